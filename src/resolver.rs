// src/resolver.rs
//
// URL canonicalization and base-URL derivation.
//
// The base URL is the bucket/container root of a destination. It keys both the
// credential lookup and the instance cache of the manager.

use std::path::{self, Path};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use crate::config::{
    AzureContainerConfig, AzureContainerConfigurations, GsBucketConfig, GsBucketConfigurations,
    S3BucketConfig, S3BucketConfigurations, StorageSettings,
};
use crate::error::{Result, StorageError};
use crate::substitution::PathSubstitutions;
use crate::uri_utils::{infer_scheme, parse_url, path_to_file_url, Scheme};

/// Base URL of every local-filesystem destination.
pub const FILE_BASE_URL: &str = "file://";

/// Substitution rules plus the credential records used to resolve URLs.
#[derive(Debug, Default)]
pub struct Resolver {
    substitutions: RwLock<PathSubstitutions>,
    s3: RwLock<S3BucketConfigurations>,
    gcs: GsBucketConfigurations,
    azure: AzureContainerConfigurations,
}

impl Resolver {
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            substitutions: RwLock::new(PathSubstitutions::from_records(&settings.path_substitution)),
            s3: RwLock::new(settings.s3.clone()),
            gcs: settings.gcs.clone(),
            azure: settings.azure.clone(),
        }
    }

    // ---------------------------------------------------------------------
    // Substitution rules
    // ---------------------------------------------------------------------

    pub fn add_rule(
        &self,
        registered_prefix: &str,
        local_prefix: &str,
        replace_windows_sep: bool,
        replace_linux_sep: bool,
    ) -> Result<()> {
        self.substitutions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_rule(registered_prefix, local_prefix, replace_windows_sep, replace_linux_sep)
    }

    pub fn clear_rules(&self) {
        self.substitutions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Apply the first matching substitution rule, if any.
    pub fn canonicalize(&self, url: &str) -> String {
        self.substitutions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(url)
    }

    // ---------------------------------------------------------------------
    // Credential records
    // ---------------------------------------------------------------------

    pub fn s3_config(&self, url: &str) -> S3BucketConfig {
        self.s3.read().unwrap_or_else(PoisonError::into_inner).get_config_by_uri(url)
    }

    pub fn gs_config(&self, url: &str) -> GsBucketConfig {
        self.gcs.get_config_by_uri(url)
    }

    pub fn azure_config(&self, url: &str) -> Result<Option<AzureContainerConfig>> {
        self.azure.get_config_by_uri(url)
    }

    /// Run `f` with exclusive access to the S3 records.
    pub fn with_s3_configs<T>(&self, f: impl FnOnce(&mut S3BucketConfigurations) -> T) -> T {
        f(&mut self.s3.write().unwrap_or_else(PoisonError::into_inner))
    }

    // ---------------------------------------------------------------------
    // Base URL
    // ---------------------------------------------------------------------

    /// Bucket/container root for `url`:
    /// `s3://[host/]bucket`, `gs://bucket`, `azure://account-host/container`,
    /// `http://`, `https://`, and `file://` for everything else.
    pub fn resolve_base_url(&self, url: &str) -> Result<String> {
        match infer_scheme(url) {
            Scheme::S3 => {
                let conf = self.s3_config(url);
                let bucket = match conf.bucket {
                    Some(bucket) => Some(bucket),
                    None => parse_url(url)?.segments().first().map(|s| s.to_string()),
                };
                let bucket = bucket
                    .ok_or_else(|| StorageError::InvalidUrl(format!("missing bucket name in {url}")))?;
                Ok(match conf.host {
                    Some(host) => format!("s3://{host}/{bucket}"),
                    None => format!("s3://{bucket}"),
                })
            }
            Scheme::Gs => {
                let conf = self.gs_config(url);
                let bucket = conf
                    .bucket
                    .ok_or_else(|| StorageError::InvalidUrl(format!("missing bucket name in {url}")))?;
                Ok(format!("gs://{bucket}"))
            }
            Scheme::Azure => {
                let conf = self.azure_config(url)?.ok_or_else(|| {
                    StorageError::Configuration(format!("Can't find azure configuration for {url}"))
                })?;
                let parts = parse_url(url)?;
                let container = conf.container_name.unwrap_or_default();
                Ok(format!("azure://{}/{}", parts.netloc, container))
            }
            Scheme::Http => Ok("http://".to_string()),
            Scheme::Https => Ok("https://".to_string()),
            Scheme::File => Ok(FILE_BASE_URL.to_string()),
        }
    }

    /// Make `folder` start with `base_url` (resolved from `folder` when not
    /// given). A bare local path becomes an absolute `file://` URL; any other
    /// mismatch is refused.
    pub fn conform_url(&self, folder: &str, base_url: Option<&str>) -> Result<String> {
        if folder.is_empty() {
            return Ok(String::new());
        }
        let base = match base_url {
            Some(base) if !base.is_empty() => base.to_string(),
            _ => self.resolve_base_url(folder)?,
        };
        if folder.starts_with(&base) {
            return Ok(folder.to_string());
        }
        if base == FILE_BASE_URL {
            let absolute = path::absolute(Path::new(folder))?;
            let conformed = path_to_file_url(&absolute);
            debug!("Upload destination {} amended to {} for registration purposes", folder, conformed);
            return Ok(conformed);
        }
        Err(StorageError::InvalidUrl(format!(
            "folder_uri: {folder} does not start with base url: {base}"
        )))
    }
}

/// Strip the part of `path` already addressed by the container. Object stores
/// take keys without a leading `/`.
pub fn normalize_object_name(base_url: &str, scheme: Scheme, path: &str) -> String {
    let mut name = path.strip_prefix(base_url).unwrap_or(path);
    if cfg!(windows) && name.len() != path.len() {
        name = name.strip_prefix('/').unwrap_or(name);
    }
    if scheme.is_object_store() {
        name = name.trim_start_matches('/');
    }
    name.to_string()
}

/// Full URL of `path`, prefixing the container root when missing.
pub fn absolute_object_name(base_url: &str, path: &str) -> String {
    if path.starts_with(base_url) {
        return path.to_string();
    }
    format!("{}///{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
