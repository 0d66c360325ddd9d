// src/config.rs
//
// Credential records per destination plus the settings file / environment
// overlay they are loaded from.
//
// Lookups are keyed by URL: `s3://host/bucket/...`, `gs://bucket/subdir/...`,
// `azure://account.blob.core.windows.net/container/...`.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_DRIVER_RETRIES, DEFAULT_UPLOAD_WORKERS, ENV_AWS_ACCESS_KEY_ID, ENV_AWS_ENDPOINT_URL,
    ENV_AWS_REGION, ENV_AWS_SECRET_ACCESS_KEY, ENV_AWS_SESSION_TOKEN, ENV_AZURE_STORAGE_ACCOUNT,
    ENV_AZURE_STORAGE_KEY, ENV_CONFIG_PATH, ENV_GOOGLE_APPLICATION_CREDENTIALS,
    ENV_GOOGLE_CLOUD_PROJECT,
};
use crate::error::{Result, StorageError};
use crate::uri_utils::parse_url;

fn default_true() -> bool {
    true
}

// -----------------------------------------------------------------------------
// S3
// -----------------------------------------------------------------------------

/// Credentials and connection options for one S3 bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3BucketConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    /// Custom endpoint host (`minio:9000`); `None` means AWS
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default = "default_true")]
    pub multipart: bool,
}

impl S3BucketConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            secure: true,
            multipart: true,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_credentials(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self.secret = Some(secret.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Both key and secret are present.
    pub fn is_valid(&self) -> bool {
        self.key.as_deref().is_some_and(|k| !k.is_empty())
            && self.secret.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// `host/bucket` (or just `bucket`) used to identify the record in logs.
    pub fn bucket_host(&self) -> String {
        [self.host.as_deref(), self.bucket.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join("/")
    }

    /// `s3://host/bucket` prefix this record answers for.
    fn prefix(&self) -> Option<String> {
        let bucket = self.bucket.as_deref()?;
        Some(match self.host.as_deref() {
            Some(host) => format!("s3://{}/{}", host, bucket).to_lowercase(),
            None => format!("s3://{}", bucket).to_lowercase(),
        })
    }
}

/// Default S3 credentials plus per-bucket overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3BucketConfigurations {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Default endpoint URL for buckets without a `host`
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_true")]
    pub multipart: bool,
    #[serde(default)]
    pub credentials: Vec<S3BucketConfig>,
}

impl S3BucketConfigurations {
    /// Pick the record for `uri`, longest matching `s3://host/bucket` prefix
    /// first. Without a match the defaults are returned: a netloc carrying a
    /// port is an endpoint host and the first path segment is the bucket,
    /// otherwise the netloc is the bucket itself.
    pub fn get_config_by_uri(&self, uri: &str) -> S3BucketConfig {
        let lowered = uri.to_lowercase();
        let best = self
            .credentials
            .iter()
            .filter_map(|c| c.prefix().map(|p| (c, p)))
            .filter(|(_, p)| lowered == *p || lowered.starts_with(&format!("{p}/")))
            .max_by_key(|(_, p)| p.len());
        if let Some((config, _)) = best {
            return config.clone();
        }

        let (host, bucket) = match parse_url(uri) {
            Ok(parts) if parts.netloc.contains(':') => {
                let bucket = parts.segments().first().map(|s| s.to_string());
                (Some(parts.netloc), bucket)
            }
            Ok(parts) if !parts.netloc.is_empty() => (None, Some(parts.netloc)),
            _ => (None, None),
        };
        S3BucketConfig {
            bucket,
            host,
            key: self.key.clone(),
            secret: self.secret.clone(),
            token: self.token.clone(),
            region: self.region.clone(),
            secure: true,
            multipart: self.multipart,
        }
    }

    pub fn get_config_by_bucket(&self, bucket: &str, host: Option<&str>) -> Option<S3BucketConfig> {
        self.credentials
            .iter()
            .find(|c| c.bucket.as_deref() == Some(bucket) && c.host.as_deref() == host)
            .cloned()
    }

    pub fn add_config(&mut self, config: S3BucketConfig) {
        self.credentials.push(config);
    }

    pub fn remove_config(&mut self, config: &S3BucketConfig) {
        self.credentials.retain(|c| c != config);
    }

    /// Fill missing key/secret/region from the global defaults.
    pub fn update_config_with_defaults(&self, config: &mut S3BucketConfig) {
        if config.key.as_deref().is_none_or(str::is_empty) {
            config.key = self.key.clone();
        }
        if config.secret.as_deref().is_none_or(str::is_empty) {
            config.secret = self.secret.clone();
            config.token = self.token.clone();
        }
        if config.region.is_none() {
            config.region = self.region.clone();
        }
    }
}

// -----------------------------------------------------------------------------
// Google Cloud Storage
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GsBucketConfig {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub subdir: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    /// Service account JSON file; `None` uses application default credentials
    #[serde(default)]
    pub credentials_json: Option<String>,
}

impl GsBucketConfig {
    fn prefix(&self) -> Option<String> {
        let bucket = self.bucket.as_deref()?;
        Some(match self.subdir.as_deref().map(|s| s.trim_matches('/')) {
            Some(subdir) if !subdir.is_empty() => format!("gs://{}/{}", bucket, subdir),
            _ => format!("gs://{}", bucket),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GsBucketConfigurations {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub credentials_json: Option<String>,
    #[serde(default)]
    pub credentials: Vec<GsBucketConfig>,
}

impl GsBucketConfigurations {
    pub fn get_config_by_uri(&self, uri: &str) -> GsBucketConfig {
        let best = self
            .credentials
            .iter()
            .filter_map(|c| c.prefix().map(|p| (c, p)))
            .filter(|(_, p)| uri == p || uri.starts_with(&format!("{p}/")))
            .max_by_key(|(_, p)| p.len());
        if let Some((config, _)) = best {
            return config.clone();
        }
        GsBucketConfig {
            bucket: parse_url(uri).ok().map(|p| p.netloc).filter(|b| !b.is_empty()),
            subdir: None,
            project: self.project.clone(),
            credentials_json: self.credentials_json.clone(),
        }
    }
}

// -----------------------------------------------------------------------------
// Azure Blob Storage
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureContainerConfig {
    pub account_name: String,
    #[serde(default)]
    pub account_key: Option<String>,
    /// `None` answers for every container of the account
    #[serde(default)]
    pub container_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzureContainerConfigurations {
    #[serde(default)]
    pub containers: Vec<AzureContainerConfig>,
}

impl AzureContainerConfigurations {
    /// `azure://<account>.blob.core.windows.net/<container>/...` → record with
    /// the container name filled in.
    pub fn get_config_by_uri(&self, uri: &str) -> Result<Option<AzureContainerConfig>> {
        let parts = parse_url(uri)?;
        let account_name = parts.netloc.split('.').next().unwrap_or_default().to_string();
        let container = parts.segments().first().map(|s| s.to_string()).ok_or_else(|| {
            StorageError::InvalidUrl(format!(
                "URI {uri} is missing a container name (expected azure://<account-name>.../<container-name>)"
            ))
        })?;
        let found = self.get_config(&account_name, &container).map(|mut config| {
            if config.container_name.is_none() {
                config.container_name = Some(container.clone());
            }
            config
        });
        Ok(found)
    }

    pub fn get_config(&self, account_name: &str, container: &str) -> Option<AzureContainerConfig> {
        self.containers
            .iter()
            .find(|c| {
                c.account_name == account_name
                    && c.container_name.as_deref().is_none_or(|name| name == container)
            })
            .cloned()
    }
}

// -----------------------------------------------------------------------------
// Settings file
// -----------------------------------------------------------------------------

/// One `path_substitution` entry as written in the settings file. Prefixes
/// are optional here so invalid entries can be reported and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSubstitutionRecord {
    #[serde(default)]
    pub registered_prefix: Option<String>,
    #[serde(default)]
    pub local_prefix: Option<String>,
    #[serde(default)]
    pub replace_windows_sep: bool,
    #[serde(default)]
    pub replace_linux_sep: bool,
}

/// Everything the orchestrator reads at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub s3: S3BucketConfigurations,
    #[serde(default)]
    pub gcs: GsBucketConfigurations,
    #[serde(default)]
    pub azure: AzureContainerConfigurations,
    #[serde(default)]
    pub path_substitution: Vec<PathSubstitutionRecord>,
    /// Log level requested for storage operations (informational; the
    /// subscriber is installed by the application)
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,
    /// Retries handed to backend clients
    #[serde(default = "default_driver_retries")]
    pub retries: usize,
    #[serde(default)]
    pub verbose: bool,
}

fn default_upload_workers() -> usize {
    DEFAULT_UPLOAD_WORKERS
}

fn default_driver_retries() -> usize {
    DEFAULT_DRIVER_RETRIES
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            s3: S3BucketConfigurations { multipart: true, ..Default::default() },
            gcs: GsBucketConfigurations::default(),
            azure: AzureContainerConfigurations::default(),
            path_substitution: Vec::new(),
            log_level: None,
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            retries: DEFAULT_DRIVER_RETRIES,
            verbose: false,
        }
    }
}

impl StorageSettings {
    /// Parse a JSON settings document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| StorageError::Configuration(format!("invalid storage settings: {e}")))
    }

    /// Read a JSON settings file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            StorageError::Configuration(format!("failed to read settings file {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Settings file named by `OMNISTORE_CONFIG` (if any), then the
    /// environment overlay. `.env` files are honoured.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut settings = match env::var(ENV_CONFIG_PATH) {
            Ok(path) if !path.is_empty() => {
                debug!("Loading storage settings from {}", path);
                Self::from_file(path)?
            }
            _ => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Fill defaults that are still unset from the standard cloud variables.
    /// Values from the settings file win.
    pub fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            env::var(name).ok().filter(|v| !v.is_empty())
        }

        let s3 = &mut self.s3;
        s3.key = s3.key.take().or_else(|| var(ENV_AWS_ACCESS_KEY_ID));
        s3.secret = s3.secret.take().or_else(|| var(ENV_AWS_SECRET_ACCESS_KEY));
        s3.token = s3.token.take().or_else(|| var(ENV_AWS_SESSION_TOKEN));
        s3.region = s3.region.take().or_else(|| var(ENV_AWS_REGION));
        s3.endpoint = s3.endpoint.take().or_else(|| var(ENV_AWS_ENDPOINT_URL));

        let gcs = &mut self.gcs;
        gcs.project = gcs.project.take().or_else(|| var(ENV_GOOGLE_CLOUD_PROJECT));
        gcs.credentials_json = gcs
            .credentials_json
            .take()
            .or_else(|| var(ENV_GOOGLE_APPLICATION_CREDENTIALS));

        if let Some(account_name) = var(ENV_AZURE_STORAGE_ACCOUNT) {
            let known = self.azure.containers.iter().any(|c| c.account_name == account_name);
            if !known {
                self.azure.containers.push(AzureContainerConfig {
                    account_name,
                    account_key: var(ENV_AZURE_STORAGE_KEY),
                    container_name: None,
                });
            }
        }

        if self.upload_workers == 0 {
            warn!("upload_workers must be at least 1, using {}", DEFAULT_UPLOAD_WORKERS);
            self.upload_workers = DEFAULT_UPLOAD_WORKERS;
        }
    }
}
