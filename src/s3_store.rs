// src/s3_store.rs
//
// S3 driver on top of the async AWS SDK.
//
// One client per container, built from the container's own credential record
// (explicit key/secret, optional endpoint host, region). SDK futures run on
// the global runtime; the container methods block the calling thread.

use anyhow::Context;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_config::timeout::TimeoutConfig;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_smithy_http_client::tls::rustls_provider::CryptoMode;
use aws_smithy_http_client::{tls, Builder as HttpClientBuilder};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use std::{env, fs, thread};
use tracing::{debug, error, warn};

use crate::constants::{
    DEFAULT_DOWNLOAD_CHUNK_SIZE, DEFAULT_S3_MULTIPART_PART_SIZE, DEFAULT_S3_REGION,
    ENV_AWS_CA_BUNDLE_PATH, HTTP_CONNECT_TIMEOUT, UPLOAD_TEST_SUFFIX,
};
use crate::config::S3BucketConfig;
use crate::driver::{
    config_mismatch, Container, ContainerCapabilities, ContainerConfig, Extra, KeyedCache,
    ObjectHandle, StorageDriver,
};
use crate::error::{Result, StorageError};
use crate::pipe::{ByteSource, DuplexPipe};
use crate::progress::ProgressSink;
use crate::runtime::{global_rt_handle, run_on_global_rt};
use crate::uri_utils::Scheme;

const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

// -----------------------------------------------------------------------------
// Client construction
// -----------------------------------------------------------------------------

/// Create a TLS context using a CA bundle file
fn tls_context_from_pem(filename: impl AsRef<Path>) -> anyhow::Result<tls::TlsContext> {
    let pem_contents = fs::read(&filename)
        .with_context(|| format!("Failed to read CA bundle file: {}", filename.as_ref().display()))?;

    let trust_store = tls::TrustStore::empty().with_pem_certificate(pem_contents.as_slice());

    tls::TlsContext::builder()
        .with_trust_store(trust_store)
        .build()
        .with_context(|| format!("Failed to build TLS context from PEM {}", filename.as_ref().display()))
}

/// `http(s)://host` for records with a custom host, else the default endpoint.
fn endpoint_for(conf: &S3BucketConfig, default_endpoint: Option<&str>) -> Option<String> {
    match conf.host.as_deref() {
        Some(host) if host.contains("://") => Some(host.to_string()),
        Some(host) => Some(format!("{}://{}", if conf.secure { "https" } else { "http" }, host)),
        None => default_endpoint.filter(|e| !e.is_empty()).map(str::to_string),
    }
}

async fn build_client(conf: S3BucketConfig, default_endpoint: Option<String>, retries: usize) -> Result<Client> {
    let (Some(key), Some(secret)) = (conf.key.clone(), conf.secret.clone()) else {
        return Err(StorageError::Configuration(format!(
            "Missing key and secret for S3 storage access ({})",
            conf.bucket_host()
        )));
    };
    let credentials = Credentials::new(key, secret, conf.token.clone(), None, "omnistore");

    let region = RegionProviderChain::first_try(conf.region.clone().map(Region::new))
        .or_default_provider()
        .or_else(Region::new(DEFAULT_S3_REGION));

    let timeout_config = TimeoutConfig::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .operation_timeout(OPERATION_TIMEOUT)
        .build();

    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(region)
        .credentials_provider(credentials)
        .retry_config(RetryConfig::standard().with_max_attempts(retries.max(1) as u32))
        .timeout_config(timeout_config);

    if let Some(endpoint) = endpoint_for(&conf, default_endpoint.as_deref()) {
        debug!("Using S3 endpoint {} for {}", endpoint, conf.bucket_host());
        loader = loader.endpoint_url(endpoint);
    }

    if let Ok(ca_bundle_path) = env::var(ENV_AWS_CA_BUNDLE_PATH) {
        if !ca_bundle_path.is_empty() {
            debug!("Loading CA bundle from: {}", ca_bundle_path);
            let tls_context = tls_context_from_pem(&ca_bundle_path)?;
            loader = loader.http_client(
                HttpClientBuilder::new()
                    .tls_provider(tls::Provider::Rustls(CryptoMode::AwsLc))
                    .tls_context(tls_context)
                    .build_https(),
            );
        }
    }

    let cfg = loader.load().await;
    // path-style addressing so custom endpoints (MinIO, Ceph) work
    let s3_config = aws_sdk_s3::config::Builder::from(&cfg).force_path_style(true).build();
    Ok(Client::from_conf(s3_config))
}

/// Connectivity failures become `Download` errors, missing keys `NotFound`,
/// everything else `Transfer`.
fn sdk_error<E>(err: SdkError<E, HttpResponse>, what: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            StorageError::Download(format!("{what}: {}", DisplayErrorContext(&err)))
        }
        SdkError::ServiceError(service) if service.raw().status().as_u16() == 404 => {
            StorageError::NotFound(what.to_string())
        }
        _ => StorageError::Transfer(format!("{what}: {}", DisplayErrorContext(&err))),
    }
}

fn content_type(extra: &Extra) -> Option<String> {
    extra.get("content_type").or_else(|| extra.get("ContentType")).cloned()
}

/// Pull chunks into `buf` until it holds `part_size` bytes. Returns `true`
/// once the source is exhausted.
fn fill_part(stream: &mut dyn ByteSource, buf: &mut BytesMut, part_size: usize) -> Result<bool> {
    while buf.len() < part_size {
        match stream.next_chunk()? {
            Some(chunk) => buf.extend_from_slice(&chunk),
            None => return Ok(true),
        }
    }
    Ok(false)
}

// -----------------------------------------------------------------------------
// Driver
// -----------------------------------------------------------------------------

/// Driver for `s3://` URLs.
pub struct S3Driver {
    retries: usize,
    default_endpoint: Option<String>,
    containers: KeyedCache<String, Arc<S3Container>>,
    location_failure_reported: Arc<Mutex<HashSet<String>>>,
}

impl S3Driver {
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            default_endpoint: None,
            containers: KeyedCache::new(),
            location_failure_reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Endpoint used by records that carry no host (`AWS_ENDPOINT_URL` style).
    pub fn with_default_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.default_endpoint = endpoint;
        self
    }

    fn client(&self, conf: &S3BucketConfig) -> Result<Client> {
        let conf = conf.clone();
        let endpoint = self.default_endpoint.clone();
        let retries = self.retries;
        run_on_global_rt(async move { build_client(conf, endpoint, retries).await })
    }

    /// Check that `conf` can write under `test_path` by putting a small probe
    /// object, then that the configured region matches the bucket's.
    pub fn test_bucket_config(&self, conf: &S3BucketConfig, test_path: &str) -> Result<bool> {
        if conf.bucket.is_none() {
            return Ok(false);
        }
        if !conf.is_valid() {
            return Err(probe_failure(conf, "Missing credentials"));
        }
        let client = self.client(conf)?;
        probe_bucket(&client, conf, test_path, &self.location_failure_reported)
    }
}

fn probe_failure(conf: &S3BucketConfig, msg: impl std::fmt::Display) -> StorageError {
    StorageError::Configuration(format!(
        "Failed testing access to bucket {}: {msg}",
        conf.bucket.as_deref().unwrap_or_default()
    ))
}

/// Put `<test_path>/omnistore-upload_test` and compare regions.
fn probe_bucket(
    client: &Client,
    conf: &S3BucketConfig,
    test_path: &str,
    reported: &Mutex<HashSet<String>>,
) -> Result<bool> {
    let Some(bucket) = conf.bucket.clone() else {
        return Ok(false);
    };
    let key = test_path
        .split('/')
        .filter(|s| !s.is_empty())
        .chain(std::iter::once(UPLOAD_TEST_SUFFIX))
        .collect::<Vec<_>>()
        .join("/");
    let probe = serde_json::json!({
        "user": env::var("USER").or_else(|_| env::var("USERNAME")).unwrap_or_default(),
        "machine": env::var("HOSTNAME").or_else(|_| env::var("COMPUTERNAME")).unwrap_or_default(),
        "time": chrono::Utc::now().to_rfc3339(),
    });
    {
        let client = client.clone();
        let bucket = bucket.clone();
        let body = Bytes::from(probe.to_string());
        run_on_global_rt(async move {
            client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("put {bucket}/{key}")))
        })
        .map_err(|e| probe_failure(conf, e))?;
    }

    let region = bucket_region(client, conf, reported, true);
    let mismatch = match (region.as_deref(), conf.region.as_deref()) {
        (Some(region), Some(configured)) => region != configured,
        (Some(region), None) => region != DEFAULT_S3_REGION,
        _ => false,
    };
    if mismatch {
        return Err(probe_failure(
            conf,
            format!(
                "incorrect region specified for bucket {bucket} (detected region {})",
                region.unwrap_or_default()
            ),
        ));
    }
    Ok(true)
}

/// Region the bucket lives in, `None` when it cannot be determined. A failed
/// lookup is logged once per bucket.
fn bucket_region(
    client: &Client,
    conf: &S3BucketConfig,
    reported: &Mutex<HashSet<String>>,
    report_info: bool,
) -> Option<String> {
    let bucket = conf.bucket.clone()?;
    let lookup = {
        let client = client.clone();
        let bucket = bucket.clone();
        run_on_global_rt(async move {
            client
                .get_bucket_location()
                .bucket(&bucket)
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("get bucket location of {bucket}")))
        })
    };
    match lookup {
        Ok(out) => Some(
            out.location_constraint()
                .map(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .unwrap_or(DEFAULT_S3_REGION)
                .to_string(),
        ),
        Err(e) => {
            let first = reported
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(conf.bucket_host());
            if first {
                let msg = format!(
                    "Failed getting bucket location (region) for bucket {bucket}: {e}. Default region will be used. \
                     This is normal if you do not have GET_BUCKET_LOCATION permission"
                );
                if report_info {
                    debug!("{}", msg);
                } else {
                    warn!("{}", msg);
                }
            }
            None
        }
    }
}

impl StorageDriver for S3Driver {
    fn scheme(&self) -> Scheme {
        Scheme::S3
    }

    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        let ContainerConfig::S3(conf) = config else {
            return Err(config_mismatch(Scheme::S3, config));
        };
        if !conf.is_valid() {
            return Err(StorageError::Configuration(format!(
                "Missing key and secret for S3 storage access ({base_url})"
            )));
        }
        let key = base_url.to_string();
        if let Some(existing) = self.containers.get(&key) {
            if existing.config == *conf {
                return Ok(existing);
            }
            debug!("Credentials for {} changed, rebuilding client", base_url);
            let rebuilt = Arc::new(self.build_container(base_url, conf)?);
            self.containers.insert(key, rebuilt.clone());
            return Ok(rebuilt);
        }
        let container = self
            .containers
            .get_or_try_init(key, || self.build_container(base_url, conf).map(Arc::new))?;
        Ok(container)
    }
}

impl S3Driver {
    fn build_container(&self, base_url: &str, conf: &S3BucketConfig) -> Result<S3Container> {
        let name = base_url.strip_prefix("s3://").unwrap_or(base_url).to_string();
        let bucket = match conf.bucket.clone() {
            Some(bucket) => bucket,
            None => name.rsplit('/').next().unwrap_or_default().to_string(),
        };
        if bucket.is_empty() {
            return Err(StorageError::InvalidUrl(format!("missing bucket name in {base_url}")));
        }
        Ok(S3Container {
            name,
            bucket,
            client: self.client(conf)?,
            config: conf.clone(),
            location_failure_reported: self.location_failure_reported.clone(),
        })
    }
}

// -----------------------------------------------------------------------------
// Container
// -----------------------------------------------------------------------------

/// One bucket bound to one client.
pub struct S3Container {
    /// `host/bucket` or `bucket`
    name: String,
    bucket: String,
    client: Client,
    config: S3BucketConfig,
    location_failure_reported: Arc<Mutex<HashSet<String>>>,
}

impl S3Container {
    fn put_bytes(&self, key: &str, data: Bytes, content_type: Option<String>) -> Result<()> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();
        run_on_global_rt(async move {
            let mut req = client.put_object().bucket(&bucket).key(&key).body(ByteStream::from(data));
            if let Some(ct) = content_type {
                req = req.content_type(ct);
            }
            req.send()
                .await
                .map_err(|e| sdk_error(e, &format!("put s3://{bucket}/{key}")))?;
            Ok(())
        })
    }

    fn upload_parts(
        &self,
        stream: &mut dyn ByteSource,
        key: &str,
        upload_id: &str,
        mut buf: BytesMut,
        mut exhausted: bool,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let take = if exhausted { buf.len() } else { DEFAULT_S3_MULTIPART_PART_SIZE };
            let body = buf.split_to(take).freeze();
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let e_tag = run_on_global_rt(async move {
                let resp = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("upload part {part_number} of s3://{bucket}/{key}")))?;
                Ok(resp.e_tag().unwrap_or_default().to_string())
            })?;
            if e_tag.is_empty() {
                return Err(StorageError::transfer(format!("UploadPart {part_number} returned empty ETag")));
            }
            parts.push(CompletedPart::builder().e_tag(e_tag).part_number(part_number).build());
            part_number += 1;

            if !exhausted {
                exhausted = fill_part(stream, &mut buf, DEFAULT_S3_MULTIPART_PART_SIZE)?;
            }
            if exhausted && buf.is_empty() {
                return Ok(parts);
            }
        }
    }

    fn multipart_upload(
        &self,
        stream: &mut dyn ByteSource,
        key: &str,
        content_type: Option<String>,
        buf: BytesMut,
    ) -> Result<()> {
        let upload_id = {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            run_on_global_rt(async move {
                let mut req = client.create_multipart_upload().bucket(&bucket).key(&key);
                if let Some(ct) = content_type {
                    req = req.content_type(ct);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("create multipart upload for s3://{bucket}/{key}")))?;
                Ok(resp.upload_id().unwrap_or_default().to_string())
            })?
        };
        if upload_id.is_empty() {
            return Err(StorageError::transfer("CreateMultipartUpload returned empty upload_id"));
        }

        let completed = self.upload_parts(stream, key, &upload_id, buf, false).and_then(|parts| {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let upload_id = upload_id.clone();
            let cmu = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
            run_on_global_rt(async move {
                client
                    .complete_multipart_upload()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(upload_id)
                    .multipart_upload(cmu)
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("complete multipart upload of s3://{bucket}/{key}")))?;
                Ok(())
            })
        });

        if let Err(e) = completed {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_string();
            let _ = run_on_global_rt(async move {
                let _ = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .send()
                    .await;
                Ok(())
            });
            return Err(e);
        }
        Ok(())
    }

    /// Producer thread feeding `pipe` with `chunk_size` pieces of the object body.
    fn spawn_download(&self, key: String, pipe: DuplexPipe, chunk_size: usize) -> Result<()> {
        let handle = global_rt_handle()?;
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        thread::Builder::new()
            .name("omnistore-s3-download".to_string())
            .spawn(move || {
                let fed = handle.block_on(async {
                    let out = client
                        .get_object()
                        .bucket(&bucket)
                        .key(&key)
                        .send()
                        .await
                        .map_err(|e| sdk_error(e, &format!("get s3://{bucket}/{key}")))?;
                    let mut body = out.body;
                    let mut buf = BytesMut::new();
                    while let Some(bytes) = body
                        .try_next()
                        .await
                        .map_err(|e| StorageError::transfer(format!("reading s3://{bucket}/{key}: {e}")))?
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

impl Container for S3Container {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        Scheme::S3
    }

    fn capabilities(&self) -> ContainerCapabilities {
        ContainerCapabilities {
            push_download: true,
            pull_download: true,
            list_prefix: true,
        }
    }

    fn list_container_objects(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let prefix = prefix.map(str::to_string);
        run_on_global_rt(async move {
            let mut keys = Vec::new();
            let mut cont: Option<String> = None;
            loop {
                let mut req = client.list_objects_v2().bucket(&bucket);
                if let Some(prefix) = &prefix {
                    req = req.prefix(prefix);
                }
                if let Some(token) = &cont {
                    req = req.continuation_token(token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("list s3://{bucket}")))?;
                for obj in resp.contents() {
                    if let Some(k) = obj.key() {
                        keys.push(k.to_owned());
                    }
                }
                match resp.next_continuation_token() {
                    Some(token) => cont = Some(token.to_string()),
                    None => break,
                }
            }
            Ok(keys)
        })
    }

    fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = object_name.to_string();
        let size = run_on_global_rt(async move {
            let head = client
                .head_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("s3://{bucket}/{key}")))?;
            Ok(head.content_length().map(|n| n.max(0) as u64))
        })?;
        Ok(ObjectHandle::new(object_name, self.name.clone(), size))
    }

    fn upload_object_via_stream(
        &self,
        stream: &mut dyn ByteSource,
        object_name: &str,
        extra: &Extra,
    ) -> Result<()> {
        let content_type = content_type(extra);
        let part_size = if self.config.multipart { DEFAULT_S3_MULTIPART_PART_SIZE } else { usize::MAX };
        let mut buf = BytesMut::new();
        let exhausted = fill_part(stream, &mut buf, part_size)?;
        if exhausted {
            return self.put_bytes(object_name, buf.freeze(), content_type);
        }
        debug!("Multipart upload of s3://{}/{}", self.bucket, object_name);
        self.multipart_upload(stream, object_name, content_type, buf)
    }

    fn download_object(&self, obj: &ObjectHandle, local_path: &Path, progress: &dyn ProgressSink) -> Result<u64> {
        use std::io::Write;
        let mut stream = self.download_object_as_stream(obj, DEFAULT_DOWNLOAD_CHUNK_SIZE)?;
        let mut file = fs::File::create(local_path)?;
        let mut total = 0u64;
        while let Some(chunk) = stream.next_chunk()? {
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
            progress.on_bytes(chunk.len() as u64);
        }
        file.flush()?;
        Ok(total)
    }

    fn download_object_as_stream(&self, obj: &ObjectHandle, chunk_size: usize) -> Result<Box<dyn ByteSource>> {
        let chunk_size = if chunk_size == 0 { DEFAULT_DOWNLOAD_CHUNK_SIZE } else { chunk_size };
        let pipe = DuplexPipe::new();
        self.spawn_download(obj.name.clone(), pipe.clone(), chunk_size)?;
        Ok(Box::new(pipe.reader()))
    }

    fn delete_object(&self, obj: &ObjectHandle) -> Result<bool> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = obj.name.clone();
        run_on_global_rt(async move {
            client
                .delete_object()
                .bucket(&bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("delete s3://{bucket}/{key}")))?;
            Ok(true)
        })
    }

    fn test_upload(&self, test_path: &str) -> Result<bool> {
        probe_bucket(&self.client, &self.config, test_path, &self.location_failure_reported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::ReaderSource;

    #[test]
    fn test_endpoint_for_custom_host() {
        let conf = S3BucketConfig::new("data").with_host("minio:9000").with_secure(false);
        assert_eq!(endpoint_for(&conf, None).as_deref(), Some("http://minio:9000"));
        let conf = conf.with_secure(true);
        assert_eq!(endpoint_for(&conf, Some("http://ignored")).as_deref(), Some("https://minio:9000"));
    }

    #[test]
    fn test_endpoint_falls_back_to_default() {
        let conf = S3BucketConfig::new("data");
        assert_eq!(endpoint_for(&conf, None), None);
        assert_eq!(endpoint_for(&conf, Some("")), None);
        assert_eq!(endpoint_for(&conf, Some("http://local:9000")).as_deref(), Some("http://local:9000"));
    }

    #[test]
    fn test_fill_part_reports_exhaustion() {
        let mut src = ReaderSource::with_chunk_size(std::io::Cursor::new(vec![1u8; 10]), 3).unwrap();
        let mut buf = BytesMut::new();
        assert!(!fill_part(&mut src, &mut buf, 6).unwrap());
        assert_eq!(buf.len(), 6);
        assert!(fill_part(&mut src, &mut buf, 100).unwrap());
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_content_type_keys() {
        let mut extra = Extra::new();
        assert_eq!(content_type(&extra), None);
        extra.insert("ContentType".into(), "text/plain".into());
        assert_eq!(content_type(&extra).as_deref(), Some("text/plain"));
    }

    #[test]
    fn test_container_requires_credentials() {
        let driver = S3Driver::new(1);
        let err = driver
            .get_container("s3://data", &ContainerConfig::S3(S3BucketConfig::new("data")))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Configuration(_)));
        let err = driver.get_container("s3://data", &ContainerConfig::File).err().unwrap();
        assert!(matches!(err, StorageError::Usage(_)));
    }

    #[test]
    fn test_bucket_config_without_bucket_is_false() {
        let driver = S3Driver::new(1);
        assert!(!driver.test_bucket_config(&S3BucketConfig::default(), "").unwrap());
        let err = driver.test_bucket_config(&S3BucketConfig::new("b"), "").unwrap_err();
        assert!(err.to_string().contains("Missing credentials"));
    }
}
