// src/azure_store.rs
//
// Azure Blob Storage driver.
//
// Containers are addressed as `azure://<account>.blob.core.windows.net/<container>`
// and authenticate through the Entra ID default chain. Large bodies go up as
// staged blocks committed in order. Without the `azure` feature the driver
// refuses to hand out containers.

use std::sync::Arc;

use crate::driver::{config_mismatch, Container, ContainerConfig, StorageDriver};
use crate::error::{Result, StorageError};
use crate::uri_utils::{parse_url, Scheme};

#[cfg(feature = "azure")]
pub use backend::AzureContainer;

/// Blob name inside `container` for `object_path`, which is either already
/// relative or a full `azure://account/container/path` URL.
pub fn blob_name_from_object_path(account: &str, container: &str, object_path: &str) -> Result<String> {
    if !object_path.contains("://") {
        return Ok(object_path.trim_start_matches('/').to_string());
    }
    let parts = parse_url(object_path)?;
    if parts.scheme != Scheme::Azure.as_str() {
        return Err(StorageError::InvalidUrl(format!(
            "Unexpected scheme {} in {object_path}, expected azure://",
            parts.scheme
        )));
    }
    let segments = parts.segments();
    let Some((found, rest)) = segments.split_first() else {
        return Err(StorageError::InvalidUrl(format!("Missing container name in {object_path}")));
    };
    if *found != container || parts.netloc.split('.').next() != Some(account) {
        return Err(StorageError::InvalidUrl(format!(
            "Container mismatch in {object_path}: expected {account}/{container}"
        )));
    }
    if rest.is_empty() {
        return Err(StorageError::InvalidUrl(format!("Missing path in {object_path}")));
    }
    Ok(rest.join("/"))
}

/// Driver for `azure://` URLs.
pub struct AzureDriver {
    #[cfg(feature = "azure")]
    containers: crate::driver::KeyedCache<String, Arc<AzureContainer>>,
}

impl Default for AzureDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AzureDriver {
    pub fn new() -> Self {
        Self {
            #[cfg(feature = "azure")]
            containers: crate::driver::KeyedCache::new(),
        }
    }
}

impl StorageDriver for AzureDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Azure
    }

    #[cfg(feature = "azure")]
    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        let ContainerConfig::Azure(conf) = config else {
            return Err(config_mismatch(Scheme::Azure, config));
        };
        let container_name = conf
            .container_name
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| StorageError::InvalidUrl(format!("missing container name in {base_url}")))?;
        let container = self.containers.get_or_try_init(base_url.to_string(), || {
            AzureContainer::connect(base_url, &conf.account_name, &container_name).map(Arc::new)
        })?;
        Ok(container)
    }

    #[cfg(not(feature = "azure"))]
    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        if !matches!(config, ContainerConfig::Azure(_)) {
            return Err(config_mismatch(Scheme::Azure, config));
        }
        Err(StorageError::Usage(format!(
            "azure driver not available for {base_url}: omnistore was built without the `azure` feature"
        )))
    }
}

#[cfg(feature = "azure")]
mod backend {
    use azure_core::credentials::TokenCredential;
    use azure_core::error::ErrorKind;
    use azure_core::http::{Body, NoFormat, RequestContent, StatusCode, XmlFormat};
    use azure_identity::DefaultAzureCredential;
    use azure_storage_blob::clients::{
        BlobClient, BlobClientOptions, BlobContainerClient, BlobContainerClientOptions,
    };
    use azure_storage_blob::models::{
        BlobClientDownloadOptions, BlobClientGetPropertiesOptions, BlobClientGetPropertiesResultHeaders,
        BlobContainerClientListBlobFlatSegmentOptions, BlockBlobClientCommitBlockListOptions,
        BlockBlobClientStageBlockOptions, BlockBlobClientUploadOptions, BlockLookupList,
        ListBlobsFlatSegmentResponse,
    };
    use bytes::{Bytes, BytesMut};
    use futures::{StreamExt, TryStreamExt};
    use once_cell::sync::OnceCell;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;
    use tracing::{debug, error};

    use super::blob_name_from_object_path;
    use crate::constants::{AZURE_MAX_SINGLE_PUT_SIZE, DEFAULT_DOWNLOAD_CHUNK_SIZE};
    use crate::driver::{Container, ContainerCapabilities, Extra, ObjectHandle};
    use crate::error::{Result, StorageError};
    use crate::pipe::{ByteSource, DuplexPipe};
    use crate::progress::ProgressSink;
    use crate::runtime::{global_rt_handle, run_on_global_rt};
    use crate::uri_utils::Scheme;

    static AZURE_CREDENTIAL: OnceCell<Arc<dyn TokenCredential>> = OnceCell::new();

    fn credential() -> Result<Arc<dyn TokenCredential>> {
        let credential = AZURE_CREDENTIAL.get_or_try_init(|| {
            let credential: Arc<dyn TokenCredential> = DefaultAzureCredential::new()
                .map_err(|e| StorageError::Configuration(format!("Azure credentials unavailable: {e}")))?;
            Ok::<_, StorageError>(credential)
        })?;
        Ok(credential.clone())
    }

    fn azure_error(err: azure_core::Error, what: &str) -> StorageError {
        if err.http_status() == Some(StatusCode::NotFound) {
            return StorageError::NotFound(format!("{what}: {err}"));
        }
        match err.kind() {
            ErrorKind::Io => StorageError::Download(format!("{what}: {err}")),
            ErrorKind::Credential => StorageError::Configuration(format!("{what}: {err}")),
            _ => StorageError::transfer(format!("{what}: {err}")),
        }
    }

    /// One blob container bound to the process-wide credential.
    pub struct AzureContainer {
        name: String,
        account: String,
        container: String,
        account_url: String,
        credential: Arc<dyn TokenCredential>,
    }

    impl AzureContainer {
        pub(super) fn connect(base_url: &str, account: &str, container: &str) -> Result<Self> {
            let host = base_url
                .strip_prefix("azure://")
                .and_then(|rest| rest.split('/').next())
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{account}.blob.core.windows.net"));
            Ok(Self {
                name: base_url.to_string(),
                account: account.to_string(),
                container: container.to_string(),
                account_url: format!("https://{host}"),
                credential: credential()?,
            })
        }

        fn container_client(&self) -> Result<BlobContainerClient> {
            BlobContainerClient::new(
                &self.account_url,
                self.container.clone(),
                self.credential.clone(),
                Some(BlobContainerClientOptions::default()),
            )
            .map_err(|e| azure_error(e, "container client"))
        }

        fn blob_client(&self, object_name: &str) -> Result<BlobClient> {
            let blob = blob_name_from_object_path(&self.account, &self.container, object_name)?;
            BlobClient::new(
                &self.account_url,
                self.container.clone(),
                blob,
                self.credential.clone(),
                Some(BlobClientOptions::default()),
            )
            .map_err(|e| azure_error(e, "blob client"))
        }

        fn url(&self, object_name: &str) -> String {
            format!("{}/{}", self.name.trim_end_matches('/'), object_name)
        }

        /// Single put for small bodies, staged blocks committed in order above
        /// the single-shot limit.
        fn put(&self, object_name: &str, data: Bytes) -> Result<()> {
            let blob = self.blob_client(object_name)?;
            let url = self.url(object_name);
            run_on_global_rt(async move {
                if data.len() <= AZURE_MAX_SINGLE_PUT_SIZE {
                    let len = data.len() as u64;
                    let body: RequestContent<Bytes, NoFormat> = Body::from(data).into();
                    blob.upload(body, true, len, Some(BlockBlobClientUploadOptions::default()))
                        .await
                        .map_err(|e| azure_error(e, &format!("put {url}")))?;
                    return Ok(());
                }
                let block_blob = blob.block_blob_client();
                let mut ids = Vec::new();
                let mut rest = data;
                let mut index = 0u64;
                while !rest.is_empty() {
                    let chunk = rest.split_to(AZURE_MAX_SINGLE_PUT_SIZE.min(rest.len()));
                    let id = format!("{index:016x}").into_bytes();
                    let len = chunk.len() as u64;
                    let body: RequestContent<Bytes, NoFormat> = Body::from(chunk).into();
                    block_blob
                        .stage_block(&id, len, body, Some(BlockBlobClientStageBlockOptions::default()))
                        .await
                        .map_err(|e| azure_error(e, &format!("stage block {index} of {url}")))?;
                    ids.push(id);
                    index += 1;
                }
                debug!("Committing {} blocks for {}", ids.len(), url);
                let lookup = BlockLookupList { committed: None, latest: Some(ids), uncommitted: None };
                let body: RequestContent<BlockLookupList, XmlFormat> =
                    lookup.try_into().map_err(|e| azure_error(e, "block list"))?;
                block_blob
                    .commit_block_list(body, Some(BlockBlobClientCommitBlockListOptions::default()))
                    .await
                    .map_err(|e| azure_error(e, &format!("commit {url}")))?;
                Ok(())
            })
        }

        fn spawn_download(&self, object_name: &str, pipe: DuplexPipe, chunk_size: usize) -> Result<()> {
            let handle = global_rt_handle()?;
            let blob = self.blob_client(object_name)?;
            let url = self.url(object_name);
            thread::Builder::new()
                .name("omnistore-azure-download".to_string())
                .spawn(move || {
                    let fed = handle.block_on(async {
                        let resp = blob
                            .download(Some(BlobClientDownloadOptions::default()))
                            .await
                            .map_err(|e| azure_error(e, &format!("get {url}")))?;
                        let mut body = resp.into_raw_body();
                        let mut buf = BytesMut::new();
                        while let Some(bytes) = body
                            .try_next()
                            .await
                            .map_err(|e| azure_error(e, &format!("reading {url}")))?
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

    impl Container for AzureContainer {
        fn name(&self) -> &str {
            &self.name
        }

        fn scheme(&self) -> Scheme {
            Scheme::Azure
        }

        fn capabilities(&self) -> ContainerCapabilities {
            ContainerCapabilities { push_download: true, pull_download: true, list_prefix: true }
        }

        fn list_container_objects(&self, prefix: Option<&str>) -> Result<Vec<String>> {
            let client = self.container_client()?;
            let mut opts = BlobContainerClientListBlobFlatSegmentOptions::default();
            if let Some(p) = prefix.filter(|p| !p.is_empty()) {
                opts.prefix = Some(p.to_string());
            }
            let name = self.name.clone();
            run_on_global_rt(async move {
                let mut pager = client
                    .list_blobs(Some(opts))
                    .map_err(|e| azure_error(e, &format!("list {name}")))?;
                let mut out = Vec::new();
                while let Some(page) = pager.next().await {
                    let resp = page.map_err(|e| azure_error(e, &format!("list {name}")))?;
                    let body: ListBlobsFlatSegmentResponse =
                        resp.into_body().await.map_err(|e| azure_error(e, &format!("list {name}")))?;
                    out.extend(body.segment.blob_items.into_iter().filter_map(|it| it.name.and_then(|n| n.content)));
                }
                Ok(out)
            })
        }

        fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
            let blob = self.blob_client(object_name)?;
            let url = self.url(object_name);
            let size = run_on_global_rt(async move {
                let resp = blob
                    .get_properties(Some(BlobClientGetPropertiesOptions::default()))
                    .await
                    .map_err(|e| azure_error(e, &format!("stat {url}")))?;
                let len = resp.content_length().map_err(|e| azure_error(e, "content length"))?;
                Ok(len.map(|l| l as u64))
            })?;
            Ok(ObjectHandle::new(object_name, self.name.clone(), size))
        }

        fn upload_object_via_stream(
            &self,
            stream: &mut dyn ByteSource,
            object_name: &str,
            _extra: &Extra,
        ) -> Result<()> {
            let data = crate::pipe::read_to_end(stream)?;
            self.put(object_name, data)
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
            self.spawn_download(&obj.name, pipe.clone(), chunk_size)?;
            Ok(Box::new(pipe.reader()))
        }

        fn delete_object(&self, obj: &ObjectHandle) -> Result<bool> {
            let blob = self.blob_client(&obj.name)?;
            let url = self.url(&obj.name);
            run_on_global_rt(async move {
                blob.delete(None).await.map_err(|e| azure_error(e, &format!("delete {url}")))?;
                Ok(true)
            })
        }

        /// Reading the container properties proves the credential reaches it.
        fn test_upload(&self, _test_path: &str) -> Result<bool> {
            let client = self.container_client()?;
            let name = self.name.clone();
            run_on_global_rt(async move {
                match client.get_properties(None).await {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        error!("Failed testing access to {}: {}", name, e);
                        Ok(false)
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_name_from_relative_and_full_paths() {
        assert_eq!(blob_name_from_object_path("acct", "data", "/a/b.bin").unwrap(), "a/b.bin");
        assert_eq!(
            blob_name_from_object_path("acct", "data", "azure://acct.blob.core.windows.net/data/a/b.bin").unwrap(),
            "a/b.bin"
        );
    }

    #[test]
    fn test_blob_name_validation_errors() {
        let mismatch = blob_name_from_object_path("acct", "data", "azure://acct.blob.core.windows.net/other/a");
        assert!(mismatch.unwrap_err().to_string().contains("Container mismatch"));

        let missing_path = blob_name_from_object_path("acct", "data", "azure://acct.blob.core.windows.net/data");
        assert!(missing_path.unwrap_err().to_string().contains("Missing path"));

        let missing_container = blob_name_from_object_path("acct", "data", "azure://acct.blob.core.windows.net");
        assert!(missing_container.unwrap_err().to_string().contains("Missing container"));

        let wrong_scheme = blob_name_from_object_path("acct", "data", "s3://acct/data/a");
        assert!(matches!(wrong_scheme, Err(StorageError::InvalidUrl(_))));
    }

    #[test]
    fn test_azure_driver_rejects_foreign_config() {
        let driver = AzureDriver::new();
        assert_eq!(driver.scheme(), Scheme::Azure);
        assert!(matches!(driver.get_container("azure://a/b", &ContainerConfig::File), Err(StorageError::Usage(_))));
    }
}
