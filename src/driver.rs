// src/driver.rs
//
// Backend capability contract.
//
// A `StorageDriver` hands out `Container`s, each bound to one base URL and one
// credential record. The orchestrator only ever talks to `Container`; the
// closed `Backend` enum picks the driver for a scheme.

use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::azure_store::AzureDriver;
use crate::config::{AzureContainerConfig, GsBucketConfig, S3BucketConfig, StorageSettings};
use crate::error::{Result, StorageError};
use crate::file_store::FileDriver;
use crate::gcs_store::GcsDriver;
use crate::http_store::HttpDriver;
use crate::pipe::{ByteSource, ReaderSource};
use crate::progress::ProgressSink;
use crate::s3_store::S3Driver;
use crate::uri_utils::Scheme;

/// Free-form metadata attached to uploads (content type, headers).
pub type Extra = HashMap<String, String>;

/// Which optional operations a container implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerCapabilities {
    /// `download_object` writes a local file and reports progress
    pub push_download: bool,
    /// `download_object_as_stream` yields chunks
    pub pull_download: bool,
    /// `list_container_objects` filters by prefix server side
    pub list_prefix: bool,
}

/// Reference to one object inside a container. Built per operation.
pub struct ObjectHandle {
    pub name: String,
    pub size: Option<u64>,
    /// Name of the container the object belongs to
    pub container: String,
    native: Mutex<Option<Box<dyn Any + Send>>>,
}

impl ObjectHandle {
    pub fn new(name: impl Into<String>, container: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            name: name.into(),
            size,
            container: container.into(),
            native: Mutex::new(None),
        }
    }

    /// Attach a backend value (an open response, a property set) to be
    /// consumed by the download that follows.
    pub fn with_native<T: Any + Send>(self, native: T) -> Self {
        *self.native.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(native));
        self
    }

    /// Take the attached backend value if it has type `T`.
    pub fn take_native<T: Any + Send>(&self) -> Option<T> {
        let mut slot = self.native.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.take()?.downcast::<T>() {
            Ok(native) => Some(*native),
            Err(other) => {
                *slot = Some(other);
                None
            }
        }
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("container", &self.container)
            .finish()
    }
}

/// Handle to a bucket/container root bound to credentials.
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    fn scheme(&self) -> Scheme;

    fn capabilities(&self) -> ContainerCapabilities;

    /// Object names in the container, filtered by `prefix` when the backend
    /// can do it server side.
    fn list_container_objects(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    fn get_object(&self, object_name: &str) -> Result<ObjectHandle>;

    /// Upload a local file. Streams it through `upload_object_via_stream`
    /// unless the backend has a native file upload.
    fn upload_object(&self, file_path: &Path, object_name: &str, extra: &Extra) -> Result<()> {
        let mut source = ReaderSource::new(File::open(file_path)?)?;
        self.upload_object_via_stream(&mut source, object_name, extra)
    }

    fn upload_object_via_stream(
        &self,
        stream: &mut dyn ByteSource,
        object_name: &str,
        extra: &Extra,
    ) -> Result<()>;

    /// Push download into `local_path`, reporting each chunk to `progress`.
    /// Returns the byte count written.
    fn download_object(
        &self,
        obj: &ObjectHandle,
        _local_path: &Path,
        _progress: &dyn ProgressSink,
    ) -> Result<u64> {
        Err(StorageError::Unsupported(format!(
            "push download is not implemented for {} ({})",
            self.scheme(),
            obj.name
        )))
    }

    /// Pull download as a chunk source.
    fn download_object_as_stream(
        &self,
        obj: &ObjectHandle,
        _chunk_size: usize,
    ) -> Result<Box<dyn ByteSource>> {
        Err(StorageError::Unsupported(format!(
            "stream download is not implemented for {} ({})",
            self.scheme(),
            obj.name
        )))
    }

    fn delete_object(&self, obj: &ObjectHandle) -> Result<bool>;

    /// Local path of `remote_path` when the object is already on a locally
    /// addressable filesystem.
    fn get_direct_access(&self, _remote_path: &str) -> Option<PathBuf> {
        None
    }

    /// Whether this container accepts writes under `test_path`.
    fn test_upload(&self, _test_path: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Credential record a container is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerConfig {
    S3(S3BucketConfig),
    Gs(GsBucketConfig),
    Azure(AzureContainerConfig),
    Http,
    File,
}

/// Factory of containers for one backend kind. Implementations cache their
/// containers per base URL.
pub trait StorageDriver: Send + Sync {
    fn scheme(&self) -> Scheme;

    fn get_container(&self, base_url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>>;
}

impl ContainerConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ContainerConfig::S3(_) => "s3",
            ContainerConfig::Gs(_) => "gs",
            ContainerConfig::Azure(_) => "azure",
            ContainerConfig::Http => "http",
            ContainerConfig::File => "file",
        }
    }
}

pub(crate) fn config_mismatch(scheme: Scheme, config: &ContainerConfig) -> StorageError {
    StorageError::Usage(format!("{scheme} driver cannot use a {} configuration", config.kind()))
}

// -----------------------------------------------------------------------------
// Keyed cache
// -----------------------------------------------------------------------------

/// Map whose values are built at most once per key, even under concurrent
/// first access. Construction for one key does not block other keys, and a
/// failed construction leaves the key empty. Lookups of built values only
/// take the shared read lock.
pub struct KeyedCache<K, V> {
    cells: RwLock<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self { cells: RwLock::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: K) -> Arc<OnceCell<V>> {
        if let Some(cell) = self.cells.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return cell.clone();
        }
        let mut cells = self.cells.write().unwrap_or_else(PoisonError::into_inner);
        cells.entry(key).or_default().clone()
    }

    pub fn get_or_try_init<E>(&self, key: K, init: impl FnOnce() -> std::result::Result<V, E>) -> std::result::Result<V, E> {
        let cell = self.cell(key);
        cell.get_or_try_init(init).cloned()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Replace whatever is cached under `key`.
    pub fn insert(&self, key: K, value: V) {
        let cell = Arc::new(OnceCell::with_value(value));
        self.cells.write().unwrap_or_else(PoisonError::into_inner).insert(key, cell);
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        let cells = self.cells.read().unwrap_or_else(PoisonError::into_inner);
        cells.values().filter(|cell| cell.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// -----------------------------------------------------------------------------
// Backend dispatch
// -----------------------------------------------------------------------------

/// Closed set of backend kinds, each holding its live driver.
#[derive(Clone)]
pub enum Backend {
    S3(Arc<S3Driver>),
    Gs(Arc<GcsDriver>),
    Azure(Arc<AzureDriver>),
    Http(Arc<HttpDriver>),
    File(Arc<FileDriver>),
}

impl Backend {
    pub fn driver(&self) -> &dyn StorageDriver {
        match self {
            Backend::S3(d) => d.as_ref(),
            Backend::Gs(d) => d.as_ref(),
            Backend::Azure(d) => d.as_ref(),
            Backend::Http(d) => d.as_ref(),
            Backend::File(d) => d.as_ref(),
        }
    }
}

/// One live driver per backend kind; `http` and `https` share a driver.
pub struct Backends {
    s3: Arc<S3Driver>,
    gs: Arc<GcsDriver>,
    azure: Arc<AzureDriver>,
    http: Arc<HttpDriver>,
    file: Arc<FileDriver>,
}

impl Backends {
    pub fn new(retries: usize) -> Self {
        Self {
            s3: Arc::new(S3Driver::new(retries)),
            gs: Arc::new(GcsDriver::new()),
            azure: Arc::new(AzureDriver::new()),
            http: Arc::new(HttpDriver::new(retries)),
            file: Arc::new(FileDriver::new()),
        }
    }

    /// Drivers tuned from settings: retry budget and the default S3 endpoint.
    pub fn from_settings(settings: &StorageSettings) -> Self {
        let retries = settings.retries;
        Self {
            s3: Arc::new(S3Driver::new(retries).with_default_endpoint(settings.s3.endpoint.clone())),
            ..Self::new(retries)
        }
    }

    pub fn get(&self, scheme: Scheme) -> Backend {
        match scheme {
            Scheme::S3 => Backend::S3(self.s3.clone()),
            Scheme::Gs => Backend::Gs(self.gs.clone()),
            Scheme::Azure => Backend::Azure(self.azure.clone()),
            Scheme::Http | Scheme::Https => Backend::Http(self.http.clone()),
            Scheme::File => Backend::File(self.file.clone()),
        }
    }

    pub fn http(&self) -> &HttpDriver {
        &self.http
    }

    pub fn s3(&self) -> &S3Driver {
        &self.s3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_object_handle_native_roundtrip() {
        let obj = ObjectHandle::new("a/b", "bucket", Some(3)).with_native(42u32);
        assert_eq!(obj.take_native::<String>(), None);
        assert_eq!(obj.take_native::<u32>(), Some(42));
        assert_eq!(obj.take_native::<u32>(), None);
    }

    #[test]
    fn test_keyed_cache_builds_once_per_key() {
        let cache: Arc<KeyedCache<String, Arc<usize>>> = Arc::new(KeyedCache::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let builds = builds.clone();
                thread::spawn(move || {
                    cache
                        .get_or_try_init::<StorageError>("k".to_string(), || {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(Arc::new(7))
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(*h.join().unwrap(), 7);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keyed_cache_lookups_share_the_read_lock() {
        let cache: Arc<KeyedCache<&str, u8>> = Arc::new(KeyedCache::new());
        cache.insert("k", 3);
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let cache = cache.clone();
            thread::spawn(move || {
                let _guard = cache.cells.read().unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        held_rx.recv().unwrap();
        // another thread is inside a read section; lookups still go through
        assert_eq!(cache.get(&"k"), Some(3));
        assert_eq!(cache.get_or_try_init::<StorageError>("k", || Ok(9)).unwrap(), 3);
        done_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn test_keyed_cache_does_not_cache_failures() {
        let cache: KeyedCache<&str, u8> = KeyedCache::new();
        let err = cache.get_or_try_init("k", || Err(StorageError::Configuration("no key".into())));
        assert!(err.is_err());
        assert!(cache.get(&"k").is_none());
        assert_eq!(cache.get_or_try_init::<StorageError>("k", || Ok(1)).unwrap(), 1);
        cache.insert("k", 2);
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[test]
    fn test_backends_route_http_and_https_together() {
        let backends = Backends::new(1);
        assert_eq!(backends.get(Scheme::Http).driver().scheme(), Scheme::Http);
        assert_eq!(backends.get(Scheme::Https).driver().scheme(), Scheme::Http);
        assert_eq!(backends.get(Scheme::File).driver().scheme(), Scheme::File);
        assert_eq!(backends.get(Scheme::S3).driver().scheme(), Scheme::S3);
    }
}
