// src/http_store.rs
//
// Plain HTTP(S) driver: multipart POST uploads and GET downloads.
//
// The container is the scheme literal (`http://` or `https://`); object names
// are `host/path`. Listing and deleting are not part of the protocol.

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, ClientBuilder, Response, StatusCode};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::constants::{DEFAULT_DOWNLOAD_CHUNK_SIZE, HTTP_CONNECT_TIMEOUT, HTTP_MIN_KBPS_SPEED, HTTP_READ_TIMEOUT};
use crate::driver::{
    config_mismatch, Container, ContainerCapabilities, ContainerConfig, Extra, KeyedCache,
    ObjectHandle, StorageDriver,
};
use crate::error::{Result, StorageError};
use crate::pipe::{read_to_end, ByteSource, DuplexPipe};
use crate::progress::ProgressSink;
use crate::runtime::{global_rt_handle, run_on_global_rt};
use crate::uri_utils::{base_name, Scheme};

/// Supplies extra request headers (authentication) for a URL.
pub trait HeaderProvider: Send + Sync {
    /// Headers to add to a request for `url`, `None` for none.
    fn headers_for(&self, url: &str) -> Option<Vec<(String, String)>>;
}

type SharedHeaderProvider = Arc<RwLock<Option<Arc<dyn HeaderProvider>>>>;

/// Upload budget: the read timeout, or longer for large bodies so that even
/// a slow link (50 KB/s) can finish.
pub fn upload_timeout(size: u64) -> Duration {
    let budget = Duration::from_secs_f64((size as f64 / 1024.0) / HTTP_MIN_KBPS_SPEED as f64);
    budget.max(HTTP_READ_TIMEOUT)
}

/// `host/path` → (`host`, `path`).
fn split_object_name(object_name: &str) -> Result<(&str, &str)> {
    let trimmed = object_name.trim_start_matches('/');
    match trimmed.find('/') {
        Some(pos) => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
        None => Err(StorageError::InvalidUrl(format!("missing path in http object name {object_name}"))),
    }
}

fn request_error(err: reqwest::Error, what: &str) -> StorageError {
    if err.is_connect() || err.is_timeout() {
        StorageError::Download(format!("{what}: {err}"))
    } else {
        StorageError::Transfer(format!("{what}: {err}"))
    }
}

/// Driver for `http://` and `https://` URLs.
pub struct HttpDriver {
    retries: usize,
    client: OnceCell<Client>,
    containers: KeyedCache<String, Arc<HttpContainer>>,
    header_provider: SharedHeaderProvider,
}

impl HttpDriver {
    pub fn new(retries: usize) -> Self {
        Self {
            retries,
            client: OnceCell::new(),
            containers: KeyedCache::new(),
            header_provider: Arc::new(RwLock::new(None)),
        }
    }

    /// Install (or remove) the provider of per-URL request headers.
    pub fn set_header_provider(&self, provider: Option<Arc<dyn HeaderProvider>>) {
        *self.header_provider.write().unwrap_or_else(PoisonError::into_inner) = provider;
    }

    fn client(&self) -> Result<Client> {
        let client = self.client.get_or_try_init(|| {
            ClientBuilder::new()
                .connect_timeout(HTTP_CONNECT_TIMEOUT)
                .read_timeout(HTTP_READ_TIMEOUT)
                .use_rustls_tls()
                .build()
                .map_err(|e| StorageError::Configuration(format!("Failed to build HTTP client: {e}")))
        })?;
        Ok(client.clone())
    }
}

impl StorageDriver for HttpDriver {
    fn scheme(&self) -> Scheme {
        Scheme::Http
    }

    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        if *config != ContainerConfig::Http {
            return Err(config_mismatch(Scheme::Http, config));
        }
        let container = self.containers.get_or_try_init(base_url.to_string(), || {
            Ok::<_, StorageError>(Arc::new(HttpContainer {
                name: base_url.to_string(),
                client: self.client()?,
                retries: self.retries.max(1),
                header_provider: self.header_provider.clone(),
            }))
        })?;
        Ok(container)
    }
}

/// `http://` or `https://` with a shared client.
pub struct HttpContainer {
    name: String,
    client: Client,
    retries: usize,
    header_provider: SharedHeaderProvider,
}

impl HttpContainer {
    fn headers(&self, url: &str) -> Vec<(String, String)> {
        let provider = self.header_provider.read().unwrap_or_else(PoisonError::into_inner).clone();
        provider.and_then(|p| p.headers_for(url)).unwrap_or_default()
    }

    fn object_url(&self, object_name: &str) -> String {
        format!("{}{}", self.name, object_name.trim_start_matches('/'))
    }

    fn post(&self, object_name: &str, data: Bytes) -> Result<()> {
        let (host, url_path) = split_object_name(object_name)?;
        let full_url = format!("{}{}", self.name, host);
        let timeout = upload_timeout(data.len() as u64);
        let part = Part::bytes(data.to_vec()).file_name(base_name(url_path).to_string());
        let form = Form::new().part(url_path.to_string(), part);
        let headers = self.headers(&full_url);
        let client = self.client.clone();
        let object_name = object_name.to_string();
        debug!("POST {} ({:?} budget)", full_url, timeout);
        run_on_global_rt(async move {
            let mut req = client.post(&full_url).multipart(form).timeout(timeout);
            for (k, v) in headers {
                req = req.header(k, v);
            }
            let res = req
                .send()
                .await
                .map_err(|e| request_error(e, &format!("uploading {object_name}")))?;
            let status = res.status();
            if status != StatusCode::OK {
                let text = res.text().await.unwrap_or_default();
                return Err(StorageError::transfer(format!(
                    "Failed uploading object {object_name} ({}): {text}",
                    status.as_u16()
                )));
            }
            Ok(())
        })
    }

    fn get(&self, object_name: &str) -> Result<Response> {
        let url = self.object_url(object_name);
        let headers = self.headers(&url);
        let client = self.client.clone();
        let retries = self.retries;
        let object_name = object_name.to_string();
        run_on_global_rt(async move {
            let mut attempt = 1;
            let res = loop {
                let mut req = client.get(&url);
                for (k, v) in &headers {
                    req = req.header(k, v);
                }
                match req.send().await {
                    Ok(res) => break res,
                    Err(e) if (e.is_connect() || e.is_timeout()) && attempt < retries => {
                        warn!("GET {} failed (attempt {}/{}): {}", url, attempt, retries, e);
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(request_error(e, &format!("getting {url}"))),
                }
            };
            let status = res.status();
            if status != StatusCode::OK {
                let text = res.text().await.unwrap_or_default();
                let msg = format!("Failed getting object {object_name} ({}): {text}", status.as_u16());
                return Err(if status == StatusCode::NOT_FOUND {
                    StorageError::NotFound(msg)
                } else {
                    StorageError::transfer(msg)
                });
            }
            Ok(res)
        })
    }

    /// Producer thread copying the response body into `pipe`.
    fn spawn_body_pump(response: Response, pipe: DuplexPipe, chunk_size: usize) -> Result<()> {
        let handle = global_rt_handle()?;
        thread::Builder::new()
            .name("omnistore-http-download".to_string())
            .spawn(move || {
                let mut response = response;
                let fed = handle.block_on(async {
                    let mut buf = BytesMut::new();
                    while let Some(bytes) = response
                        .chunk()
                        .await
                        .map_err(|e| request_error(e, "reading response body"))?
                    {
                        // keep-alive chunks carry nothing
                        if bytes.is_empty() {
                            continue;
                        }
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

    fn body_stream(&self, obj: &ObjectHandle, chunk_size: usize) -> Result<Box<dyn ByteSource>> {
        let response = match obj.take_native::<Response>() {
            Some(response) => response,
            None => self.get(&obj.name)?,
        };
        let chunk_size = if chunk_size == 0 { DEFAULT_DOWNLOAD_CHUNK_SIZE } else { chunk_size };
        let pipe = DuplexPipe::new();
        Self::spawn_body_pump(response, pipe.clone(), chunk_size)?;
        Ok(Box::new(pipe.reader()))
    }
}

impl Container for HttpContainer {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> Scheme {
        if self.name.starts_with("https") { Scheme::Https } else { Scheme::Http }
    }

    fn capabilities(&self) -> ContainerCapabilities {
        ContainerCapabilities {
            push_download: true,
            pull_download: true,
            list_prefix: false,
        }
    }

    fn list_container_objects(&self, _prefix: Option<&str>) -> Result<Vec<String>> {
        Err(StorageError::Unsupported("List is not implemented for http protocol".into()))
    }

    /// Issues the GET right away; the open response rides on the handle.
    fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
        let response = self.get(object_name)?;
        let size = response.content_length();
        Ok(ObjectHandle::new(object_name, self.name.clone(), size).with_native(response))
    }

    fn upload_object(&self, file_path: &Path, object_name: &str, _extra: &Extra) -> Result<()> {
        let data = std::fs::read(file_path)?;
        self.post(object_name, Bytes::from(data))
    }

    fn upload_object_via_stream(
        &self,
        stream: &mut dyn ByteSource,
        object_name: &str,
        _extra: &Extra,
    ) -> Result<()> {
        let data = read_to_end(stream)?;
        self.post(object_name, data)
    }

    fn download_object(&self, obj: &ObjectHandle, local_path: &Path, progress: &dyn ProgressSink) -> Result<u64> {
        let mut stream = self.body_stream(obj, DEFAULT_DOWNLOAD_CHUNK_SIZE)?;
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
        self.body_stream(obj, chunk_size)
    }

    fn delete_object(&self, _obj: &ObjectHandle) -> Result<bool> {
        Err(StorageError::Unsupported("Delete is not implemented for http protocol".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticHeaders;

    impl HeaderProvider for StaticHeaders {
        fn headers_for(&self, url: &str) -> Option<Vec<(String, String)>> {
            url.starts_with("https://files.example.com")
                .then(|| vec![("Authorization".to_string(), "Bearer t".to_string())])
        }
    }

    fn container() -> Arc<dyn Container> {
        HttpDriver::new(1).get_container("https://", &ContainerConfig::Http).unwrap()
    }

    #[test]
    fn test_upload_timeout_floor_and_scaling() {
        assert_eq!(upload_timeout(0), HTTP_READ_TIMEOUT);
        assert_eq!(upload_timeout(1024 * 1024), HTTP_READ_TIMEOUT);
        // 10 MB at 50 KB/s
        assert_eq!(upload_timeout(10 * 1024 * 1024), Duration::from_secs_f64(10.0 * 1024.0 / 50.0));
    }

    #[test]
    fn test_split_object_name() {
        assert_eq!(split_object_name("files.example.com/a/b.txt").unwrap(), ("files.example.com", "a/b.txt"));
        assert!(split_object_name("files.example.com").is_err());
    }

    #[test]
    fn test_list_and_delete_unsupported() {
        let c = container();
        let err = c.list_container_objects(None).unwrap_err();
        assert_eq!(err.to_string(), "operation not supported: List is not implemented for http protocol");
        let obj = ObjectHandle::new("files.example.com/a", "https://", None);
        assert!(matches!(c.delete_object(&obj), Err(StorageError::Unsupported(_))));
        assert!(c.get_direct_access("https://files.example.com/a").is_none());
        assert!(c.test_upload("files.example.com").unwrap());
    }

    #[test]
    fn test_header_provider_is_consulted() {
        let driver = HttpDriver::new(1);
        driver.get_container("https://", &ContainerConfig::Http).unwrap();
        driver.set_header_provider(Some(Arc::new(StaticHeaders)));
        let container = driver.containers.get(&"https://".to_string()).unwrap();
        assert_eq!(container.headers("https://files.example.com/x").len(), 1);
        assert!(container.headers("https://elsewhere/x").is_empty());
        driver.set_header_provider(None);
        assert!(container.headers("https://files.example.com/x").is_empty());
    }

    #[test]
    fn test_containers_are_cached_per_scheme() {
        let driver = HttpDriver::new(1);
        let a = driver.get_container("http://", &ContainerConfig::Http).unwrap();
        let b = driver.get_container("http://", &ContainerConfig::Http).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "http://");
        assert_eq!(a.scheme(), Scheme::Http);
        let secure = driver.get_container("https://", &ContainerConfig::Http).unwrap();
        assert_eq!(secure.scheme(), Scheme::Https);
        let err = driver.get_container("http://", &ContainerConfig::File).err().unwrap();
        assert!(matches!(err, StorageError::Usage(_)));
    }
}
