// src/helper.rs
//
// Per-destination orchestrator handle.
//
// A `StorageHelper` is bound to one resolved base URL and one container. It
// owns the transfer protocol: canonicalization, retries with stream rewind,
// progress wiring, and the download state machine that never leaves a
// partial file under its final name.

use bytes::Bytes;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_DOWNLOAD_CHUNK_SIZE, TEMP_DOWNLOAD_SUFFIX, WRITE_TEST_MARKER};
use crate::driver::{Container, Extra, ObjectHandle};
use crate::error::{Result, StorageError};
use crate::pipe::{read_to_end, ByteSource, ReaderSource};
use crate::progress::{CallbackProgress, DownloadProgressReport, NoProgress, ProgressSink, UploadCallback};
use crate::resolver::{absolute_object_name, normalize_object_name, Resolver};
use crate::retry::with_retry;
use crate::upload_pool::{CancelFlag, UploadExecutor, UploadHandle, UploadPool, UploadTask};
use crate::uri_utils::{base_name, file_url_to_path, Scheme};

/// Source wrapper that stops a transfer once shutdown was requested.
struct CancellableSource<'a> {
    inner: &'a mut dyn ByteSource,
    cancel: &'a CancelFlag,
    what: &'a str,
}

impl ByteSource for CancellableSource<'_> {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.cancel.check(self.what)?;
        self.inner.next_chunk()
    }

    fn rewind(&mut self) -> Result<()> {
        self.inner.rewind()
    }

    fn remaining_len(&mut self) -> Option<u64> {
        self.inner.remaining_len()
    }
}

/// Handle bound to one container root and its credentials.
pub struct StorageHelper {
    base_url: String,
    scheme: Scheme,
    container: Arc<dyn Container>,
    resolver: Arc<Resolver>,
    uploads: Arc<UploadPool>,
    verbose: AtomicBool,
}

impl std::fmt::Debug for StorageHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHelper")
            .field("base_url", &self.base_url)
            .field("scheme", &self.scheme)
            .field("container", &self.container.name())
            .finish()
    }
}

impl StorageHelper {
    pub fn new(
        base_url: impl Into<String>,
        scheme: Scheme,
        container: Arc<dyn Container>,
        resolver: Arc<Resolver>,
        uploads: Arc<UploadPool>,
        verbose: bool,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            scheme,
            container,
            resolver,
            uploads,
            verbose: AtomicBool::new(verbose),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Full URL of `path` under this helper's base.
    pub fn absolute_object_name(&self, path: &str) -> String {
        absolute_object_name(&self.base_url, path)
    }

    /// Container-relative object name of `path`.
    pub fn normalize_object_name(&self, path: &str) -> String {
        normalize_object_name(&self.base_url, self.scheme, path)
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    /// Upload the local file `src` to `dest` (its base name when `None`),
    /// retrying the whole transfer up to `retries` times. Returns `dest`.
    pub fn upload(
        &self,
        src: &Path,
        dest: Option<&str>,
        extra: Option<&Extra>,
        retries: usize,
        callback: Option<UploadCallback>,
    ) -> Result<String> {
        let dest = self.upload_dest(src, dest);
        let extra = extra.cloned().unwrap_or_default();
        self.do_upload(src, &dest, &extra, retries, callback, None)
    }

    /// Queue the upload on the background pool; the handle yields `dest`.
    pub fn upload_async(
        self: &Arc<Self>,
        src: &Path,
        dest: Option<&str>,
        extra: Option<&Extra>,
        retries: usize,
        callback: Option<UploadCallback>,
    ) -> UploadHandle {
        let task = UploadTask {
            src_path: src.to_path_buf(),
            dest_path: self.upload_dest(src, dest),
            extra: extra.cloned().unwrap_or_default(),
            callback,
            retries,
        };
        debug!("Queueing upload {:?}", task);
        self.uploads.submit(task, self.clone())
    }

    /// Upload everything `stream` yields to `dest`. Between attempts the
    /// stream is rewound to where it started.
    pub fn upload_from_stream(
        &self,
        stream: &mut dyn ByteSource,
        dest: &str,
        extra: Option<&Extra>,
        retries: usize,
    ) -> Result<String> {
        let dest = self.resolver.canonicalize(dest);
        let object_name = self.normalize_object_name(&dest);
        let extra = extra.cloned().unwrap_or_default();
        let container = &self.container;
        with_retry(
            retries,
            stream,
            |s, attempt| {
                debug!("Uploading stream to {} (attempt {})", dest, attempt);
                container.upload_object_via_stream(s, &object_name, &extra)
            },
            |s| s.rewind(),
        )
        .inspect_err(|e| error!("Failed uploading to {}: {}", dest, e))?;
        Ok(dest)
    }

    fn upload_dest(&self, src: &Path, dest: Option<&str>) -> String {
        match dest.filter(|d| !d.is_empty()) {
            Some(dest) => self.resolver.canonicalize(dest),
            None => base_name(&src.to_string_lossy()).to_string(),
        }
    }

    fn do_upload(
        &self,
        src: &Path,
        dest: &str,
        extra: &Extra,
        retries: usize,
        callback: Option<UploadCallback>,
        cancel: Option<&CancelFlag>,
    ) -> Result<String> {
        let object_name = self.normalize_object_name(dest);
        let observer: Box<dyn ProgressSink> = match callback {
            Some(cb) => Box::new(CallbackProgress::new(cb)),
            None => Box::new(NoProgress),
        };
        observer.on_start(None);

        let container = &self.container;
        let uploaded = match cancel {
            None => with_retry(retries, &mut (), |_, _| container.upload_object(src, &object_name, extra), |_| Ok(())),
            Some(cancel) => File::open(src)
                .map_err(StorageError::from)
                .and_then(ReaderSource::new)
                .and_then(|mut source| {
                    with_retry(
                        retries,
                        &mut source,
                        |s, _| {
                            let mut guarded = CancellableSource { inner: s, cancel, what: dest };
                            container.upload_object_via_stream(&mut guarded, &object_name, extra)
                        },
                        |s| s.rewind(),
                    )
                }),
        };

        match uploaded {
            Ok(()) => {
                if self.verbose() {
                    info!("Finished upload: {} => {}", src.display(), dest);
                }
                observer.on_complete(dest);
                Ok(dest.to_string())
            }
            Err(e) => {
                error!("Exception encountered while uploading {} to {}: {}", src.display(), dest, e);
                observer.on_error(&e);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Object names under `prefix` (all objects when `None`). The prefix
    /// itself is never part of the result.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let Some(prefix) = prefix.filter(|p| !p.is_empty()) else {
            return self.container.list_container_objects(None);
        };
        let prefix = self.normalize_object_name(&self.resolver.canonicalize(prefix));
        let server_side = self.container.capabilities().list_prefix.then_some(prefix.as_str());
        let names = self.container.list_container_objects(server_side)?;
        Ok(names.into_iter().filter(|n| n.starts_with(&prefix) && *n != prefix).collect())
    }

    /// Handle for `path`; lookup failures other than connectivity are logged
    /// and become `None`.
    fn get_object(&self, path: &str) -> Result<Option<ObjectHandle>> {
        let object_name = self.normalize_object_name(path);
        match self.container.get_object(&object_name) {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_download_error() => Err(e),
            Err(e) => {
                warn!("Storage helper problem for {}: {}", object_name, e);
                Ok(None)
            }
        }
    }

    /// Download `remote` into `local`.
    ///
    /// Returns the local path of the data: the object itself when it is
    /// directly accessible, `local` when it already exists and `overwrite`
    /// is off, otherwise `local` after an atomic rename of the finished
    /// temporary file. Failures are logged and yield `None`, except
    /// connectivity errors which propagate.
    pub fn download_to_file(
        &self,
        remote: &str,
        local: &Path,
        overwrite: bool,
        delete_on_failure: bool,
    ) -> Result<Option<PathBuf>> {
        let remote = self.resolver.canonicalize(remote);
        let verbose = self.verbose();

        if let Some(direct) = self.container.get_direct_access(&remote) {
            debug!("Direct access to {}", direct.display());
            return Ok(Some(direct));
        }

        if verbose {
            info!("Start downloading from {}", remote);
        }
        if !overwrite && local.is_file() {
            warn!(
                "File {} already exists, no need to download, thread id = {:?}",
                local.display(),
                std::thread::current().id()
            );
            return Ok(Some(local.to_path_buf()));
        }

        let temp = PathBuf::from(format!(
            "{}_{}{}",
            local.display(),
            chrono::Utc::now().timestamp_micros(),
            TEMP_DOWNLOAD_SUFFIX
        ));
        let Some(obj) = self.get_object(&remote)? else {
            return Ok(None);
        };
        let report = DownloadProgressReport::new(remote.clone(), obj.size, verbose);

        match self.fetch_into(&obj, &temp, local, &report) {
            Ok(()) => {
                report.on_complete(&local.to_string_lossy());
                Ok(Some(local.to_path_buf()))
            }
            Err(e) => {
                if delete_on_failure {
                    let _ = fs::remove_file(&temp);
                }
                if e.is_download_error() {
                    return Err(e);
                }
                report.on_error(&e);
                Ok(None)
            }
        }
    }

    /// TEMP_DOWNLOAD → VERIFY_SIZE → ATOMIC_RENAME
    fn fetch_into(&self, obj: &ObjectHandle, temp: &Path, local: &Path, report: &DownloadProgressReport) -> Result<()> {
        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        report.on_start(obj.size);

        if self.container.capabilities().push_download {
            self.container.download_object(obj, temp, report)?;
        } else {
            let mut stream = self.container.download_object_as_stream(obj, DEFAULT_DOWNLOAD_CHUNK_SIZE)?;
            let mut file = File::create(temp)?;
            while let Some(chunk) = stream.next_chunk()? {
                file.write_all(&chunk)?;
                report.on_bytes(chunk.len() as u64);
            }
            file.flush()?;
        }

        let written = fs::metadata(temp)?.len();
        if written == 0 && obj.size != Some(0) {
            return Err(StorageError::Integrity("downloaded a 0-sized file".into()));
        }
        if let Some(expected) = obj.size.filter(|&n| n != written) {
            return Err(StorageError::Integrity(format!(
                "downloaded {written} bytes, expected {expected}"
            )));
        }

        if cfg!(not(unix)) {
            let _ = fs::remove_file(local);
        }
        fs::rename(temp, local)?;
        Ok(())
    }

    /// Lazy chunk source over `remote`; `None` when the object cannot be
    /// opened (logged). Connectivity errors propagate.
    pub fn download_as_stream(&self, remote: &str, chunk_size: Option<usize>) -> Result<Option<Box<dyn ByteSource>>> {
        let remote = self.resolver.canonicalize(remote);
        let opened = self.get_object(&remote).and_then(|obj| match obj {
            Some(obj) => self
                .container
                .download_object_as_stream(&obj, chunk_size.unwrap_or(DEFAULT_DOWNLOAD_CHUNK_SIZE))
                .map(Some),
            None => Ok(None),
        });
        match opened {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_download_error() => Err(e),
            Err(e) => {
                error!("Could not download file : {}, err:{}", remote, e);
                Ok(None)
            }
        }
    }

    /// Whole object in memory.
    pub fn download_as_bytes(&self, remote: &str) -> Result<Option<Bytes>> {
        let Some(mut stream) = self.download_as_stream(remote, None)? else {
            return Ok(None);
        };
        match read_to_end(&mut stream) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_download_error() => Err(e),
            Err(e) => {
                error!("Could not download file : {}, err:{}", remote, e);
                Ok(None)
            }
        }
    }

    pub fn delete(&self, path: &str) -> Result<bool> {
        let path = self.resolver.canonicalize(path);
        let obj = self.container.get_object(&self.normalize_object_name(&path))?;
        self.container.delete_object(&obj)
    }

    // ---------------------------------------------------------------------
    // Checks
    // ---------------------------------------------------------------------

    /// Make sure uploads to `folder` can succeed and return the conformed
    /// folder URL. Object stores write a probe; local folders are created.
    pub fn verify_upload(&self, folder: &str, raise_on_error: bool) -> Result<String> {
        let folder = self.resolver.canonicalize(folder);
        let folder = self.resolver.conform_url(&folder, Some(&self.base_url))?;
        let test_path = self.normalize_object_name(&folder);

        let verified = match self.scheme {
            Scheme::S3 | Scheme::Gs | Scheme::Azure => match self.container.test_upload(&test_path) {
                Ok(true) => Ok(()),
                Ok(false) => Err(StorageError::PermissionDenied(folder.clone())),
                Err(e) => Err(e),
            },
            Scheme::File => {
                let dir = file_url_to_path(&test_path);
                fs::create_dir_all(&dir).and_then(|_| touch(&dir)).map_err(StorageError::from)
            }
            Scheme::Http | Scheme::Https => Ok(()),
        };
        match verified {
            Ok(()) => Ok(folder),
            Err(e) if raise_on_error => Err(e),
            Err(e) => {
                error!("Failed verifying upload destination {}: {}", folder, e);
                Ok(folder)
            }
        }
    }

    /// Write and delete a marker object under `dest` (the base URL when
    /// `None`). Any failure is reported as missing permissions.
    pub fn check_write_permissions(&self, dest: Option<&str>) -> Result<bool> {
        let base = dest.filter(|d| !d.is_empty()).unwrap_or(&self.base_url);
        let marker = format!("{}/{}", base.trim_end_matches('/'), WRITE_TEST_MARKER);
        if self.scheme.is_http() {
            return Ok(true);
        }
        let mut probe = ReaderSource::from_bytes(&b"omnistore"[..]);
        self.upload_from_stream(&mut probe, &marker, None, 1)
            .and_then(|_| self.delete(&marker))
            .map_err(|e| {
                debug!("Write test on {} failed: {}", marker, e);
                StorageError::PermissionDenied(base.to_string())
            })?;
        Ok(true)
    }
}

/// Bump the modification time of a directory (fails if it is not writable).
fn touch(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(WRITE_TEST_MARKER);
    File::create(&probe)?;
    fs::remove_file(probe)
}

impl UploadExecutor for StorageHelper {
    fn execute(&self, task: UploadTask, cancel: &CancelFlag) -> Result<String> {
        let UploadTask { src_path, dest_path, extra, callback, retries } = task;
        self.do_upload(&src_path, &dest_path, &extra, retries, callback, Some(cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageSettings;
    use crate::driver::ContainerCapabilities;
    use crate::progress::UploadEvent;
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory bucket with injectable upload failures.
    #[derive(Default)]
    struct MemoryContainer {
        objects: Mutex<BTreeMap<String, Bytes>>,
        fail_uploads: AtomicUsize,
        upload_attempts: AtomicUsize,
        first_chunk_offsets: Mutex<Vec<Bytes>>,
    }

    impl MemoryContainer {
        fn put(&self, name: &str, data: &'static [u8]) {
            self.objects.lock().unwrap().insert(name.into(), Bytes::from_static(data));
        }
    }

    impl Container for MemoryContainer {
        fn name(&self) -> &str {
            "mem"
        }

        fn scheme(&self) -> Scheme {
            Scheme::S3
        }

        fn capabilities(&self) -> ContainerCapabilities {
            ContainerCapabilities { push_download: false, pull_download: true, list_prefix: false }
        }

        fn list_container_objects(&self, _prefix: Option<&str>) -> Result<Vec<String>> {
            Ok(self.objects.lock().unwrap().keys().cloned().collect())
        }

        fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(object_name)
                .ok_or_else(|| StorageError::NotFound(object_name.to_string()))?;
            Ok(ObjectHandle::new(object_name, "mem", Some(data.len() as u64)))
        }

        fn upload_object_via_stream(&self, stream: &mut dyn ByteSource, object_name: &str, _extra: &Extra) -> Result<()> {
            self.upload_attempts.fetch_add(1, Ordering::SeqCst);
            let first = stream.next_chunk()?.unwrap_or_default();
            self.first_chunk_offsets.lock().unwrap().push(first.clone());
            if self.fail_uploads.load(Ordering::SeqCst) > 0 {
                self.fail_uploads.fetch_sub(1, Ordering::SeqCst);
                return Err(StorageError::Transfer("connection reset".into()));
            }
            let mut data = first.to_vec();
            data.extend_from_slice(&read_to_end(stream)?);
            self.objects.lock().unwrap().insert(object_name.to_string(), Bytes::from(data));
            Ok(())
        }

        fn download_object_as_stream(&self, obj: &ObjectHandle, _chunk_size: usize) -> Result<Box<dyn ByteSource>> {
            let data = self.objects.lock().unwrap().get(&obj.name).cloned().unwrap_or_default();
            Ok(Box::new(ReaderSource::from_bytes(data)))
        }

        fn delete_object(&self, obj: &ObjectHandle) -> Result<bool> {
            Ok(self.objects.lock().unwrap().remove(&obj.name).is_some())
        }

        fn test_upload(&self, test_path: &str) -> Result<bool> {
            Ok(!test_path.starts_with("locked"))
        }
    }

    fn helper(container: Arc<MemoryContainer>) -> StorageHelper {
        let resolver = Arc::new(Resolver::new(&StorageSettings::default()));
        StorageHelper::new("s3://bucket", Scheme::S3, container, resolver, Arc::new(UploadPool::new(1)), false)
    }

    #[test]
    fn test_stream_upload_retries_from_start_offset() {
        let mem = Arc::new(MemoryContainer::default());
        mem.fail_uploads.store(2, Ordering::SeqCst);
        let h = helper(mem.clone());

        let mut cursor = std::io::Cursor::new(b"headerPAYLOAD".to_vec());
        cursor.set_position(6);
        let mut source = ReaderSource::new(cursor).unwrap();
        let dest = h.upload_from_stream(&mut source, "s3://bucket/dir/obj", None, 3).unwrap();

        assert_eq!(dest, "s3://bucket/dir/obj");
        assert_eq!(mem.upload_attempts.load(Ordering::SeqCst), 3);
        let firsts = mem.first_chunk_offsets.lock().unwrap().clone();
        assert!(firsts.iter().all(|c| c.as_ref() == b"PAYLOAD"));
        assert_eq!(mem.objects.lock().unwrap()["dir/obj"].as_ref(), b"PAYLOAD");
    }

    #[test]
    fn test_stream_upload_raises_last_error() {
        let mem = Arc::new(MemoryContainer::default());
        mem.fail_uploads.store(5, Ordering::SeqCst);
        let h = helper(mem.clone());
        let mut source = ReaderSource::from_bytes(&b"x"[..]);
        let err = h.upload_from_stream(&mut source, "s3://bucket/a", None, 2).unwrap_err();
        assert!(matches!(err, StorageError::Transfer(_)));
        assert_eq!(mem.upload_attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_upload_callback_sees_start_then_outcome() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("model.bin");
        fs::write(&src, b"weights").unwrap();

        let mem = Arc::new(MemoryContainer::default());
        let h = helper(mem.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cb: UploadCallback = Arc::new(move |e| sink.lock().unwrap().push(e));

        h.upload(&src, Some("s3://bucket/m/model.bin"), None, 1, Some(cb.clone())).unwrap();
        mem.fail_uploads.store(1, Ordering::SeqCst);
        assert!(h.upload(&src, Some("s3://bucket/m/again.bin"), None, 1, Some(cb)).is_err());

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                UploadEvent::Started,
                UploadEvent::Completed("s3://bucket/m/model.bin".into()),
                UploadEvent::Started,
                UploadEvent::Failed,
            ]
        );
    }

    #[test]
    fn test_upload_defaults_to_source_base_name() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("report.txt");
        fs::write(&src, b"r").unwrap();
        let mem = Arc::new(MemoryContainer::default());
        let dest = helper(mem.clone()).upload(&src, None, None, 1, None).unwrap();
        assert_eq!(dest, "report.txt");
        assert!(mem.objects.lock().unwrap().contains_key("report.txt"));
    }

    #[test]
    fn test_list_excludes_prefix_itself() {
        let mem = Arc::new(MemoryContainer::default());
        mem.put("a/", b"");
        mem.put("a/1", b"1");
        mem.put("a/2", b"2");
        mem.put("b/1", b"3");
        let h = helper(mem);
        assert_eq!(h.list(Some("a/")).unwrap(), vec!["a/1".to_string(), "a/2".to_string()]);
        assert_eq!(h.list(Some("s3://bucket/a/")).unwrap().len(), 2);
        assert_eq!(h.list(None).unwrap().len(), 4);
    }

    #[test]
    fn test_pull_download_and_skip_existing() {
        let tmp = TempDir::new().unwrap();
        let mem = Arc::new(MemoryContainer::default());
        mem.put("data/blob", b"0123456789");
        let h = helper(mem.clone());
        let local = tmp.path().join("sub").join("blob");

        let got = h.download_to_file("s3://bucket/data/blob", &local, false, true).unwrap();
        assert_eq!(got.as_deref(), Some(local.as_path()));
        assert_eq!(fs::read(&local).unwrap(), b"0123456789");

        mem.put("data/blob", b"changed");
        h.download_to_file("s3://bucket/data/blob", &local, false, true).unwrap();
        assert_eq!(fs::read(&local).unwrap(), b"0123456789");

        h.download_to_file("s3://bucket/data/blob", &local, true, true).unwrap();
        assert_eq!(fs::read(&local).unwrap(), b"changed");
        let leftovers: Vec<_> = fs::read_dir(local.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(TEMP_DOWNLOAD_SUFFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_missing_object_yields_none() {
        let tmp = TempDir::new().unwrap();
        let h = helper(Arc::new(MemoryContainer::default()));
        let local = tmp.path().join("nothing");
        assert!(h.download_to_file("s3://bucket/missing", &local, false, true).unwrap().is_none());
        assert!(!local.exists());
        assert!(h.download_as_stream("s3://bucket/missing", None).unwrap().is_none());
        assert!(h.download_as_bytes("s3://bucket/missing").unwrap().is_none());
    }

    #[test]
    fn test_download_as_bytes_and_delete() {
        let mem = Arc::new(MemoryContainer::default());
        mem.put("k", b"value");
        let h = helper(mem.clone());
        assert_eq!(h.download_as_bytes("s3://bucket/k").unwrap().unwrap().as_ref(), b"value");
        assert!(h.delete("s3://bucket/k").unwrap());
        assert!(h.delete("s3://bucket/k").is_err());
    }

    #[test]
    fn test_verify_upload_on_object_store() {
        let h = helper(Arc::new(MemoryContainer::default()));
        assert_eq!(h.verify_upload("s3://bucket/runs", true).unwrap(), "s3://bucket/runs");
        assert!(matches!(h.verify_upload("s3://bucket/locked", true), Err(StorageError::PermissionDenied(_))));
        assert_eq!(h.verify_upload("s3://bucket/locked", false).unwrap(), "s3://bucket/locked");
        assert!(matches!(h.verify_upload("s3://other/x", true), Err(StorageError::InvalidUrl(_))));
    }

    #[test]
    fn test_check_write_permissions_cleans_marker() {
        let mem = Arc::new(MemoryContainer::default());
        let h = helper(mem.clone());
        assert!(h.check_write_permissions(None).unwrap());
        assert!(mem.objects.lock().unwrap().is_empty());

        mem.fail_uploads.store(1, Ordering::SeqCst);
        let err = h.check_write_permissions(Some("s3://bucket/ro")).unwrap_err();
        assert_eq!(err.to_string(), "insufficient permissions for s3://bucket/ro");
    }

    #[test]
    fn test_check_write_permissions_skips_only_http_helpers() {
        let mem = Arc::new(MemoryContainer::default());
        let h = helper(mem.clone());
        mem.fail_uploads.store(1, Ordering::SeqCst);
        let err = h.check_write_permissions(Some("httpdata/")).unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert_eq!(mem.upload_attempts.load(Ordering::SeqCst), 1);

        let web = Arc::new(MemoryContainer::default());
        web.fail_uploads.store(1, Ordering::SeqCst);
        let resolver = Arc::new(Resolver::new(&StorageSettings::default()));
        let h = StorageHelper::new("https://", Scheme::Https, web.clone(), resolver, Arc::new(UploadPool::new(1)), false);
        assert!(h.check_write_permissions(None).unwrap());
        assert_eq!(web.upload_attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_object_name_helpers() {
        let h = helper(Arc::new(MemoryContainer::default()));
        assert_eq!(h.normalize_object_name("s3://bucket/a/b"), "a/b");
        assert_eq!(h.absolute_object_name("a/b"), "s3://bucket///a/b");
        assert_eq!(h.absolute_object_name("s3://bucket/a"), "s3://bucket/a");
    }
}
