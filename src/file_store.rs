// src/file_store.rs
//
// Local filesystem driver.
//
// A container is a directory root. Object names are paths: absolute names are
// used as they are, relative names are taken relative to the root. Listed
// names keep the form of the prefix (relative names for a relative prefix or
// no prefix, full paths for an absolute one) so every listed name can be fed
// back to `get_object`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::constants::{DEFAULT_STREAM_CHUNK_SIZE, FILE_DRIVER_CHUNK_SIZE, FILE_DRIVER_IGNORE_FOLDERS};
use crate::driver::{
    config_mismatch, Container, ContainerCapabilities, ContainerConfig, Extra, KeyedCache,
    ObjectHandle, StorageDriver,
};
use crate::error::{Result, StorageError};
use crate::pipe::{ByteSource, ReaderSource};
use crate::progress::ProgressSink;
use crate::uri_utils::{file_url_to_path, Scheme};

/// Driver for `file://` URLs and bare local paths.
#[derive(Default)]
pub struct FileDriver {
    containers: KeyedCache<PathBuf, Arc<FileContainer>>,
}

impl FileDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that roots the container for `url`: the URL itself when it
    /// names a directory (created when missing), its parent when it names a
    /// file.
    fn container_root(url: &str) -> Result<PathBuf> {
        let mut path = file_url_to_path(url);
        if path.as_os_str().is_empty() {
            path = PathBuf::from(".");
        }
        if path.is_file() {
            path = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
            if path.as_os_str().is_empty() {
                path = PathBuf::from(".");
            }
        } else if !path.exists() {
            debug!("Creating container directory {}", path.display());
            fs::create_dir_all(&path)?;
        }
        Ok(path)
    }
}

impl StorageDriver for FileDriver {
    fn scheme(&self) -> Scheme {
        Scheme::File
    }

    fn get_container(&self, url: &str, config: &ContainerConfig) -> Result<Arc<dyn Container>> {
        if *config != ContainerConfig::File {
            return Err(config_mismatch(Scheme::File, config));
        }
        let root = Self::container_root(url)?;
        let container = self.containers.get_or_try_init(root.clone(), || {
            if !root.is_dir() {
                return Err(StorageError::Configuration(format!(
                    "The base path is not a directory: {}",
                    root.display()
                )));
            }
            Ok(Arc::new(FileContainer { root: root.clone() }))
        })?;
        Ok(container)
    }
}

/// A directory used as a container.
#[derive(Debug)]
pub struct FileContainer {
    root: PathBuf,
}

impl FileContainer {
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, object_name: &str) -> PathBuf {
        self.root.join(file_url_to_path(object_name))
    }

    /// Name of a listed file in the form the listing was addressed with:
    /// relative to the root for relative prefixes, the full path otherwise.
    fn listed_name(&self, path: &Path, relative: bool) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if relative => slashed(rel),
            _ => slashed(path),
        }
    }

    fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                let name = entry.file_name();
                if FILE_DRIVER_IGNORE_FOLDERS.iter().any(|skip| name == *skip) {
                    trace!("Skipping {}", path.display());
                    continue;
                }
                Self::collect_files(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }

    fn write_stream(path: &Path, stream: &mut dyn ByteSource) -> Result<u64> {
        let mut file = File::create(path)?;
        let mut total = 0u64;
        while let Some(chunk) = stream.next_chunk()? {
            file.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        file.flush()?;
        Ok(total)
    }
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn make_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn set_object_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o664))
}

#[cfg(not(unix))]
fn set_object_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl Container for FileContainer {
    fn name(&self) -> &str {
        self.root.to_str().unwrap_or(".")
    }

    fn scheme(&self) -> Scheme {
        Scheme::File
    }

    fn capabilities(&self) -> ContainerCapabilities {
        ContainerCapabilities {
            push_download: true,
            pull_download: true,
            list_prefix: true,
        }
    }

    /// Walks the root, or only the directory a prefix points into.
    fn list_container_objects(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let prefix = prefix.filter(|p| !p.is_empty());
        let start = match prefix {
            Some(p) => {
                let path = self.object_path(p);
                if path.is_dir() {
                    path
                } else {
                    path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone())
                }
            }
            None => self.root.clone(),
        };
        if !start.is_dir() {
            if prefix.is_some() {
                return Ok(Vec::new());
            }
            return Err(StorageError::NotFound(format!(
                "container directory {} is missing",
                start.display()
            )));
        }
        let mut paths = Vec::new();
        Self::collect_files(&start, &mut paths)?;
        if let Some(p) = prefix {
            let wanted = slashed(&self.object_path(p));
            paths.retain(|path| slashed(path).starts_with(&wanted));
        }
        let relative = prefix.is_none_or(|p| file_url_to_path(p).is_relative());
        let mut names: Vec<String> = paths.iter().map(|path| self.listed_name(path, relative)).collect();
        names.sort();
        Ok(names)
    }

    fn get_object(&self, object_name: &str) -> Result<ObjectHandle> {
        let path = self.object_path(object_name);
        let meta = fs::metadata(&path)
            .map_err(|e| StorageError::NotFound(format!("{}: {e}", path.display())))?;
        if meta.is_dir() {
            return Err(StorageError::NotFound(format!("{} is a directory", path.display())));
        }
        Ok(ObjectHandle::new(object_name, self.name(), Some(meta.len())))
    }

    fn upload_object(&self, file_path: &Path, object_name: &str, _extra: &Extra) -> Result<()> {
        let dest = self.object_path(object_name);
        make_parent(&dest)?;
        fs::copy(file_path, &dest)?;
        set_object_mode(&dest)?;
        debug!("Copied {} to {}", file_path.display(), dest.display());
        Ok(())
    }

    fn upload_object_via_stream(
        &self,
        stream: &mut dyn ByteSource,
        object_name: &str,
        _extra: &Extra,
    ) -> Result<()> {
        let dest = self.object_path(object_name);
        make_parent(&dest)?;
        let written = Self::write_stream(&dest, stream)?;
        set_object_mode(&dest)?;
        debug!("Wrote {} bytes to {}", written, dest.display());
        Ok(())
    }

    fn download_object(&self, obj: &ObjectHandle, local_path: &Path, progress: &dyn ProgressSink) -> Result<u64> {
        let src = self.object_path(&obj.name);
        let mut source = ReaderSource::with_chunk_size(File::open(&src)?, DEFAULT_STREAM_CHUNK_SIZE)?;
        let mut out = File::create(local_path)?;
        let mut total = 0u64;
        while let Some(chunk) = source.next_chunk()? {
            out.write_all(&chunk)?;
            total += chunk.len() as u64;
            progress.on_bytes(chunk.len() as u64);
        }
        out.flush()?;
        Ok(total)
    }

    fn download_object_as_stream(&self, obj: &ObjectHandle, chunk_size: usize) -> Result<Box<dyn ByteSource>> {
        let src = self.object_path(&obj.name);
        let chunk_size = if chunk_size == 0 { FILE_DRIVER_CHUNK_SIZE } else { chunk_size };
        Ok(Box::new(ReaderSource::with_chunk_size(File::open(src)?, chunk_size)?))
    }

    fn delete_object(&self, obj: &ObjectHandle) -> Result<bool> {
        let path = self.object_path(&obj.name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Could not delete {}: {}", path.display(), e);
                Ok(false)
            }
        }
    }

    fn get_direct_access(&self, remote_path: &str) -> Option<PathBuf> {
        let path = std::path::absolute(file_url_to_path(remote_path)).ok()?;
        path.is_file().then_some(path)
    }
}
