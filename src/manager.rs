// src/manager.rs
//
// Orchestrator state: the resolver, one driver per backend kind, the shared
// upload pool and the per-thread helper cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{S3BucketConfig, StorageSettings};
use crate::driver::{Backends, ContainerConfig, KeyedCache};
use crate::error::{Result, StorageError};
use crate::helper::StorageHelper;
use crate::http_store::HeaderProvider;
use crate::resolver::Resolver;
use crate::upload_pool::{TerminatePolicy, UploadPool};
use crate::uri_utils::{base_name, infer_scheme, Scheme};

/// Entry point for scheme-addressed storage access.
///
/// Helpers are cached per `(base_url, calling thread)`. Construction for a
/// key happens at most once even when several callers race for it; later
/// lookups only take the cache lock.
pub struct StorageManager {
    resolver: Arc<Resolver>,
    backends: Backends,
    helpers: KeyedCache<(String, ThreadId), Arc<StorageHelper>>,
    uploads: Arc<UploadPool>,
    verbose: bool,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("helpers", &self.helpers.len())
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl StorageManager {
    pub fn new(settings: StorageSettings) -> Self {
        if let Some(level) = settings.log_level.as_deref() {
            match level.parse::<tracing::Level>() {
                Ok(level) => debug!("Storage log level {}", level),
                Err(_) => error!("Invalid storage log level in configuration: {}", level),
            }
        }
        Self {
            resolver: Arc::new(Resolver::new(&settings)),
            backends: Backends::from_settings(&settings),
            helpers: KeyedCache::new(),
            uploads: Arc::new(UploadPool::new(settings.upload_workers)),
            verbose: settings.verbose,
        }
    }

    /// Manager configured from `OMNISTORE_CONFIG` and the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(StorageSettings::load()?))
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Helper for `url`, or `None` when one cannot be built (missing
    /// credentials, backend not compiled in). The failure is logged.
    pub fn get(&self, url: &str) -> Option<Arc<StorageHelper>> {
        self.get_or_create(url, false)
            .map_err(|e| error!("{}", e))
            .ok()
    }

    /// Helper for `url`. `force_create` replaces any cached helper for the
    /// same base URL and thread.
    pub fn get_or_create(&self, url: &str, force_create: bool) -> Result<Arc<StorageHelper>> {
        let url = self.resolver.canonicalize(url);
        let base_url = self.resolver.resolve_base_url(&url)?;
        let key = (base_url.clone(), thread::current().id());

        let build = || {
            self.build_helper(&url, &base_url).map_err(|e| {
                debug!("Helper construction for {} failed: {}", url, e);
                StorageError::Configuration(format!("Failed credentials for {base_url}: {e}"))
            })
        };
        if force_create {
            let helper = build()?;
            self.helpers.insert(key, helper.clone());
            return Ok(helper);
        }
        self.helpers.get_or_try_init(key, build)
    }

    fn build_helper(&self, url: &str, base_url: &str) -> Result<Arc<StorageHelper>> {
        let scheme = infer_scheme(base_url);
        let config = match scheme {
            Scheme::S3 => ContainerConfig::S3(self.resolver.s3_config(url)),
            Scheme::Gs => ContainerConfig::Gs(self.resolver.gs_config(url)),
            Scheme::Azure => ContainerConfig::Azure(self.resolver.azure_config(url)?.ok_or_else(|| {
                StorageError::Configuration(format!("Can't find azure configuration for {url}"))
            })?),
            Scheme::Http | Scheme::Https => ContainerConfig::Http,
            Scheme::File => ContainerConfig::File,
        };
        let container = self.backends.get(scheme).driver().get_container(base_url, &config)?;
        Ok(Arc::new(StorageHelper::new(
            base_url,
            scheme,
            container,
            self.resolver.clone(),
            self.uploads.clone(),
            self.verbose,
        )))
    }

    // ---------------------------------------------------------------------
    // One-call downloads
    // ---------------------------------------------------------------------

    /// Resolve `remote` and download it to `local`.
    pub fn download_from_url(&self, remote: &str, local: &Path, overwrite: bool) -> Result<Option<PathBuf>> {
        let Some(helper) = self.get(remote) else {
            return Ok(None);
        };
        helper.download_to_file(remote, local, overwrite, true)
    }

    /// Download `remote` into a fresh temporary file whose name ends with
    /// the remote file name.
    pub fn get_local_copy(&self, remote: &str) -> Result<Option<PathBuf>> {
        let Some(helper) = self.get(remote) else {
            return Ok(None);
        };
        let suffix = format!(".{}", base_name(remote));
        let local = tempfile::Builder::new()
            .prefix("omnistore")
            .suffix(&suffix)
            .tempfile()?
            .into_temp_path()
            .keep()
            .map_err(|e| StorageError::Io(e.error))?;
        let result = helper.download_to_file(remote, &local, true, true);
        if !matches!(&result, Ok(Some(path)) if *path == local) {
            let _ = std::fs::remove_file(&local);
        }
        result
    }

    // ---------------------------------------------------------------------
    // S3 bucket records
    // ---------------------------------------------------------------------

    pub fn get_s3_configuration(&self, bucket: &str, host: Option<&str>) -> Option<S3BucketConfig> {
        self.resolver
            .with_s3_configs(|configs| configs.get_config_by_bucket(bucket, host))
    }

    /// Register credentials for one bucket.
    ///
    /// A record with key and secret is tested (when `test` is set) and then
    /// replaces any existing record for the same bucket. A record without
    /// credentials reuses a working existing record, or else takes the
    /// global defaults.
    pub fn add_s3_configuration(&self, mut config: S3BucketConfig, test: bool) -> Result<()> {
        let bucket = config.bucket.clone().unwrap_or_default();
        let host_label = config.host.clone().unwrap_or_else(|| "AWS".to_string());
        let existing = self.get_s3_configuration(&bucket, config.host.as_deref());

        if config.is_valid() {
            if test {
                self.test_s3_config(&config)?;
            }
            if let Some(existing) = existing {
                warn!(
                    "Overriding existing configuration for {}/{}",
                    existing.host.as_deref().unwrap_or("AWS"),
                    bucket
                );
                self.resolver.with_s3_configs(|configs| configs.remove_config(&existing));
            }
        } else {
            if let Some(existing) = existing {
                info!("Using existing credentials for bucket {}/{}", host_label, bucket);
                match self.test_s3_config(&existing) {
                    Ok(true) => return Ok(()),
                    Ok(false) => {}
                    Err(e) => warn!("Existing credentials for {} failed: {}", bucket, e),
                }
            }
            self.resolver
                .with_s3_configs(|configs| configs.update_config_with_defaults(&mut config));
            info!("Using global credentials for bucket {}/{}", host_label, bucket);
            if test {
                self.test_s3_config(&config)?;
            }
        }
        self.resolver.with_s3_configs(|configs| configs.add_config(config));
        Ok(())
    }

    fn test_s3_config(&self, config: &S3BucketConfig) -> Result<bool> {
        self.backends.s3().test_bucket_config(config, "")
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    /// See [`Resolver::conform_url`].
    pub fn conform_url(&self, folder: &str, base_url: Option<&str>) -> Result<String> {
        self.resolver.conform_url(folder, base_url)
    }

    pub fn add_path_substitution(
        &self,
        registered_prefix: &str,
        local_prefix: &str,
        replace_windows_sep: bool,
        replace_linux_sep: bool,
    ) -> Result<()> {
        self.resolver
            .add_rule(registered_prefix, local_prefix, replace_windows_sep, replace_linux_sep)
    }

    pub fn clear_path_substitutions(&self) {
        self.resolver.clear_rules();
    }

    /// Auth headers for HTTP(S) transfers.
    pub fn set_http_header_provider(&self, provider: Option<Arc<dyn HeaderProvider>>) {
        self.backends.http().set_header_provider(provider);
    }

    // ---------------------------------------------------------------------
    // Shutdown
    // ---------------------------------------------------------------------

    /// Stop background uploads, spending one `timeout` budget across all
    /// worker threads. Returns the number of threads still running.
    pub fn terminate_uploads(&self, force: bool, timeout: Duration) -> usize {
        self.terminate_uploads_with(force, timeout, TerminatePolicy::SharedBudget)
    }

    pub fn terminate_uploads_with(&self, force: bool, timeout: Duration, policy: TerminatePolicy) -> usize {
        self.uploads.terminate(force, timeout, policy)
    }
}

impl Default for StorageManager {
    fn default() -> Self {
        Self::new(StorageSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_helper_cached_per_base_and_thread() {
        let manager = StorageManager::default();
        let a = manager.get("/tmp/a.txt").unwrap();
        let b = manager.get("file:///var/b.txt").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.base_url(), "file://");

        let other = thread::scope(|s| s.spawn(|| manager.get("/tmp/a.txt").unwrap()).join().unwrap());
        assert!(!Arc::ptr_eq(&a, &other));

        let forced = manager.get_or_create("/tmp/a.txt", true).unwrap();
        assert!(!Arc::ptr_eq(&a, &forced));
        assert!(Arc::ptr_eq(&forced, &manager.get("/tmp/a.txt").unwrap()));
    }

    #[test]
    fn test_missing_credentials_yield_none() {
        let manager = StorageManager::default();
        assert!(manager.get("s3://no-creds-bucket/key").is_none());
        assert!(manager.get("azure://acct.blob.core.windows.net/c/blob").is_none());
    }

    #[test]
    fn test_substitution_applies_before_resolution() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("model.bin");
        fs::write(&src, b"weights").unwrap();

        let manager = StorageManager::default();
        manager
            .add_path_substitution("s3://archive/", &format!("{}/", dir.path().display()), false, false)
            .unwrap();
        let helper = manager.get("s3://archive/model.bin").unwrap();
        assert_eq!(helper.scheme(), Scheme::File);

        let local = dir.path().join("copy.bin");
        let got = manager.download_from_url("s3://archive/model.bin", &local, false).unwrap();
        assert_eq!(got.as_deref(), Some(src.as_path()));

        manager.clear_path_substitutions();
        assert!(manager.get("s3://archive/model.bin").is_none());
    }

    #[test]
    fn test_get_local_copy_keeps_file_name() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("report.csv");
        fs::write(&src, b"a,b\n1,2\n").unwrap();
        let manager = StorageManager::default();

        // local files are served in place
        let got = manager.get_local_copy(src.to_str().unwrap()).unwrap().unwrap();
        assert_eq!(got, src);

        assert!(manager.get_local_copy(dir.path().join("missing.csv").to_str().unwrap()).unwrap().is_none());
    }

    #[test]
    fn test_add_s3_configuration_without_test() {
        let manager = StorageManager::default();
        let conf = S3BucketConfig::new("models").with_host("minio:9000").with_credentials("k", "s");
        manager.add_s3_configuration(conf.clone(), false).unwrap();
        assert_eq!(manager.get_s3_configuration("models", Some("minio:9000")), Some(conf));

        let replaced = S3BucketConfig::new("models").with_host("minio:9000").with_credentials("k2", "s2");
        manager.add_s3_configuration(replaced.clone(), false).unwrap();
        assert_eq!(manager.get_s3_configuration("models", Some("minio:9000")), Some(replaced));
        assert_eq!(manager.resolver().with_s3_configs(|c| c.credentials.len()), 1);
    }

    #[test]
    fn test_add_s3_configuration_falls_back_to_defaults() {
        let mut settings = StorageSettings::default();
        settings.s3.key = Some("global-key".into());
        settings.s3.secret = Some("global-secret".into());
        let manager = StorageManager::new(settings);

        manager.add_s3_configuration(S3BucketConfig::new("shared"), false).unwrap();
        let stored = manager.get_s3_configuration("shared", None).unwrap();
        assert_eq!(stored.key.as_deref(), Some("global-key"));
        assert_eq!(stored.secret.as_deref(), Some("global-secret"));
    }

    #[test]
    fn test_conform_url_promotes_local_path() {
        let manager = StorageManager::default();
        let url = manager.conform_url("/data/out", None).unwrap();
        assert_eq!(url, "file:///data/out");
        assert!(manager.conform_url("gs://b/x", Some("gs://other")).is_err());
    }

    #[test]
    fn test_invalid_log_level_is_not_fatal() {
        let settings = StorageSettings { log_level: Some("loud".into()), ..Default::default() };
        let manager = StorageManager::new(settings);
        assert!(manager.get("/tmp/x").is_some());
    }
}
