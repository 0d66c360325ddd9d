// src/gcs_store.rs
//
// Google Cloud Storage driver on top of the gcloud-storage crate.
//
// Credentials resolve per bucket record: a service account file when one is
// configured, Application Default Credentials otherwise, and anonymous access
// against `GCS_ENDPOINT_URL` for emulators. Without the `gcs` feature the
// driver still exists but refuses to hand out containers.

use std::sync::Arc;

use crate::driver::{config_mismatch, Container, ContainerConfig, StorageDriver};
use crate::error::{Result, StorageError};
use crate::uri_utils::Scheme;

#[cfg(feature = "gcs")]
pub use backend::GcsContainer;

/// Driver for `gs://` URLs.
pub struct GcsDriver {
    #[cfg(feature = "gcs")]
    containers: crate::driver::KeyedCache<crate::config::GsBucketConfig, Arc<GcsContainer>>,
}

impl Default for GcsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GcsDriver {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "gcs")]
            containers: crate::driver::KeyedCache::new(),
        }
    }
}

impl StorageDriver for GcsDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Gs
    }

    #[cfg(feature = "gcs")]
    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        let ContainerConfig::Gs(conf) = config else {
            return Err(config_mismatch(Scheme::Gs, config));
        };
        if conf.bucket.as_deref().unwrap_or_default().is_empty() {
            return Err(StorageError::InvalidUrl(format!("missing bucket name in {base_url}")));
        }
        let container = self
            .containers
            .get_or_try_init(conf.clone(), || backend::GcsContainer::connect(conf).map(Arc::new))?;
        Ok(container)
    }

    #[cfg(not(feature = "gcs"))]
    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        if !matches!(config, ContainerConfig::Gs(_)) {
            return Err(config_mismatch(Scheme::Gs, config));
        }
        Err(StorageError::Usage(format!(
            "gs driver not available for {base_url}: omnistore was built without the `gcs` feature"
        )))
    }
}

#[cfg(feature = "gcs")]
mod backend {
    use bytes::BytesMut;
    use futures::TryStreamExt;
    use gcloud_storage::client::google_cloud_auth::credentials::CredentialsFile;
    use gcloud_storage::client::{Client, ClientConfig};
    use gcloud_storage::http::buckets::test_iam_permissions::TestIamPermissionsRequest;
    use gcloud_storage::http::objects::delete::DeleteObjectRequest;
    use gcloud_storage::http::objects::download::Range;
    use gcloud_storage::http::objects::get::GetObjectRequest;
    use gcloud_storage::http::objects::list::ListObjectsRequest;
    use gcloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
    use gcloud_storage::http::Error as GcsError;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::thread;
    use tracing::{debug, error, info};

    use crate::config::GsBucketConfig;
    use crate::constants::{DEFAULT_DOWNLOAD_CHUNK_SIZE, ENV_GCS_ENDPOINT_URL};
    use crate::driver::{Container, ContainerCapabilities, Extra, ObjectHandle};
    use crate::error::{Result, StorageError};
    use crate::pipe::{read_to_end, ByteSource, DuplexPipe};
    use crate::progress::ProgressSink;
    use crate::runtime::{global_rt_handle, run_on_global_rt};
    use crate::uri_utils::Scheme;

    /// Permissions a writable bucket must grant.
    const UPLOAD_PERMISSIONS: [&str; 2] = ["storage.objects.get", "storage.objects.update"];

    fn gcs_error(err: GcsError, what: &str) -> StorageError {
        match err {
            GcsError::Response(resp) if resp.code == 404 => StorageError::NotFound(format!("{what}: {resp}")),
            GcsError::HttpClient(e) if e.is_connect() || e.is_timeout() => {
                StorageError::Download(format!("{what}: {e}"))
            }
            other => StorageError::transfer(format!("{what}: {other}")),
        }
    }

    async fn client_config(conf: &GsBucketConfig) -> anyhow::Result<ClientConfig> {
        if let Some(endpoint) = std::env::var(ENV_GCS_ENDPOINT_URL).ok().filter(|e| !e.is_empty()) {
            info!("Using custom GCS endpoint: {}", endpoint);
            return Ok(ClientConfig { storage_endpoint: endpoint, ..ClientConfig::default() }.anonymous());
        }
        let mut config = match conf.credentials_json.as_deref() {
            Some(path) => {
                debug!("Loading GCS service account from {}", path);
                let creds = CredentialsFile::new_from_file(path.to_string()).await?;
                ClientConfig::default().with_credentials(creds).await?
            }
            None => ClientConfig::default().with_auth().await?,
        };
        if conf.project.is_some() {
            config.project_id = conf.project.clone();
        }
        Ok(config)
    }

    /// One bucket bound to one authenticated client.
    pub struct GcsContainer {
        name: String,
        bucket: String,
        client: Client,
    }

    impl GcsContainer {
        pub(super) fn connect(conf: &GsBucketConfig) -> Result<Self> {
            let bucket = conf.bucket.clone().unwrap_or_default();
            let owned = conf.clone();
            let client = run_on_global_rt(async move {
                let config = client_config(&owned).await.map_err(|e| {
                    StorageError::Configuration(format!("Failed to initialize GCS authentication: {e}"))
                })?;
                Ok(Client::new(config))
            })?;
            debug!("GCS client ready for bucket {}", bucket);
            Ok(Self { name: format!("gs://{bucket}"), bucket, client })
        }

        fn get_request(&self, object_name: &str) -> GetObjectRequest {
            GetObjectRequest {
                bucket: self.bucket.clone(),
                object: object_name.to_string(),
                ..Default::default()
            }
        }

        fn spawn_download(&self, object_name: String, pipe: DuplexPipe, chunk_size: usize) -> Result<()> {
            let handle = global_rt_handle()?;
            let client = self.client.clone();
            let req = self.get_request(&object_name);
            let url = format!("{}/{}", self.name, object_name);
            thread::Builder::new()
                .name("omnistore-gcs-download".to_string())
                .spawn(move || {
                    let fed = handle.block_on(async {
                        let stream = client
                            .download_streamed_object(&req, &Range::default())
                            .await
                            .map_err(|e| gcs_error(e, &format!("get {url}")))?;
                        futures::pin_mut!(stream);
                        let mut buf = BytesMut::new();
                        while let Some(bytes) = stream
                            .try_next()
                            .await
                            .map_err(|e| gcs_error(e, &format!("reading {url}")))?
                        {
                            buf.extend_from_slice(&bytes);
                            while buf.len() >= chunk_size {
                                pipe.write(buf.split_to(chunk_size).freeze())?;
                            }
                        }
                        if !buf.is_empty() {
                            pipe.write(buf.freeze())?;
                        }
                        Ok::<_, StorageError>(())
                    });
                    match fed {
                        Ok(()) => pipe.close(),
                        Err(e) => {
                            error!("Failed downloading: {}", e);
                            pipe.fail(e);
                        }
                    }
                })?;
            Ok(())
        }
    }

    impl Container for GcsContainer {
        fn name(&self) -> &str {
            &self.name
        }

        fn scheme(&self) -> Scheme {
            Scheme::Gs
        }

        fn capabilities(&self) -> ContainerCapabilities {
            ContainerCapabilities { push_download: true, pull_download: true, list_prefix: true }
        }

        fn list_container_objects(&self, prefix: Option<&str>) -> Result<Vec<String>> {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let prefix = prefix.map(str::to_string);
            run_on_global_rt(async move {
                let mut names = Vec::new();
                let mut page_token: Option<String> = None;
                loop {
                    let req = ListObjectsRequest {
                        bucket: bucket.clone(),
                        prefix: prefix.clone(),
                        page_token: page_token.take(),
                        ..Default::default()
                    };
                    let resp = client
                        .list_objects(&req)
                        .await
                        .map_err(|e| gcs_error(e, &format!("list gs://{bucket}")))?;
                    names.extend(resp.items.unwrap_or_default().into_iter().map(|o| o.name));
                    match resp.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => return Ok(names),
                    }
                }
            })
        }

        fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
            let client = self.client.clone();
            let req = self.get_request(object_name);
            let url = format!("{}/{}", self.name, object_name);
            let obj = run_on_global_rt(async move {
                client.get_object(&req).await.map_err(|e| gcs_error(e, &format!("stat {url}")))
            })?;
            Ok(ObjectHandle::new(object_name, self.name.clone(), Some(obj.size.max(0) as u64)))
        }

        fn upload_object_via_stream(
            &self,
            stream: &mut dyn ByteSource,
            object_name: &str,
            extra: &Extra,
        ) -> Result<()> {
            let data = read_to_end(stream)?;
            let mut media = Media::new(object_name.to_string());
            if let Some(ct) = extra.get("content_type").or_else(|| extra.get("ContentType")) {
                media.content_type = ct.clone().into();
            }
            let client = self.client.clone();
            let req = UploadObjectRequest { bucket: self.bucket.clone(), ..Default::default() };
            let url = format!("{}/{}", self.name, object_name);
            debug!("GCS PUT {} ({} bytes)", url, data.len());
            run_on_global_rt(async move {
                client
                    .upload_object(&req, data.to_vec(), &UploadType::Simple(media))
                    .await
                    .map_err(|e| gcs_error(e, &format!("put {url}")))?;
                Ok(())
            })
        }

        fn download_object(&self, obj: &ObjectHandle, local_path: &Path, progress: &dyn ProgressSink) -> Result<u64> {
            let mut stream = self.download_object_as_stream(obj, DEFAULT_DOWNLOAD_CHUNK_SIZE)?;
            let mut file = File::create(local_path)?;
            let mut length = 0u64;
            while let Some(chunk) = stream.next_chunk()? {
                file.write_all(&chunk)?;
                length += chunk.len() as u64;
                progress.on_bytes(chunk.len() as u64);
            }
            file.flush()?;
            Ok(length)
        }

        fn download_object_as_stream(&self, obj: &ObjectHandle, chunk_size: usize) -> Result<Box<dyn ByteSource>> {
            let chunk_size = if chunk_size == 0 { DEFAULT_DOWNLOAD_CHUNK_SIZE } else { chunk_size };
            let pipe = DuplexPipe::new();
            self.spawn_download(obj.name.clone(), pipe.clone(), chunk_size)?;
            Ok(Box::new(pipe.reader()))
        }

        fn delete_object(&self, obj: &ObjectHandle) -> Result<bool> {
            let client = self.client.clone();
            let req = DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: obj.name.clone(),
                ..Default::default()
            };
            let url = format!("{}/{}", self.name, obj.name);
            run_on_global_rt(async move {
                client.delete_object(&req).await.map_err(|e| gcs_error(e, &format!("delete {url}")))?;
                Ok(true)
            })
        }

        /// The bucket must grant both read and update on objects.
        fn test_upload(&self, test_path: &str) -> Result<bool> {
            let client = self.client.clone();
            let req = TestIamPermissionsRequest {
                resource: self.bucket.clone(),
                permissions: UPLOAD_PERMISSIONS.iter().map(|p| p.to_string()).collect(),
            };
            let test_path = test_path.to_string();
            run_on_global_rt(async move {
                let granted = client
                    .bucket_test_iam_permissions(&req)
                    .await
                    .map_err(|e| gcs_error(e, &format!("test permissions for {test_path}")))?
                    .permissions;
                Ok(UPLOAD_PERMISSIONS.iter().all(|p| granted.iter().any(|g| g == p)))
            })
        }
    }
}
