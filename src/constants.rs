// src/constants.rs
//
// Centralized constants for omnistore to avoid hardcoded values throughout the codebase

use std::time::Duration;

/// Suffix appended to in-flight download files (`{local_path}_{timestamp}.partially`)
pub const TEMP_DOWNLOAD_SUFFIX: &str = ".partially";

/// Download progress is logged every time this many MB were transferred (5 MB)
pub const DEFAULT_REPORT_CHUNK_SIZE_MB: f64 = 5.0;

/// Chunk size used for pull-style downloads when the caller does not pick one (5 MB)
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Chunk size used when reading local files for streaming uploads (64 KB)
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size of the local filesystem driver when streaming objects out (8 KB)
pub const FILE_DRIVER_CHUNK_SIZE: usize = 8096;

/// Folders skipped while enumerating a filesystem container
pub const FILE_DRIVER_IGNORE_FOLDERS: &[&str] = &[".lock", ".hash"];

/// Number of chunks the duplex pipe buffers before `write` blocks
pub const DEFAULT_PIPE_CAPACITY: usize = 16;

/// Poll interval of a blocked pipe reader/writer, so `close` is seen promptly
pub const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Width of the asynchronous upload worker pool
pub const DEFAULT_UPLOAD_WORKERS: usize = 1;

/// Poll interval of idle upload workers and of the shutdown join loop
pub const UPLOAD_POOL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default timeout for `terminate_uploads` (seconds)
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of attempts for a single upload
pub const DEFAULT_UPLOAD_RETRIES: usize = 1;

/// Default retry count handed to backend clients
pub const DEFAULT_DRIVER_RETRIES: usize = 5;

/// Name of the marker object written by `check_write_permissions`
pub const WRITE_TEST_MARKER: &str = ".omnistore.test";

/// Suffix of the probe object written when testing bucket credentials
pub const UPLOAD_TEST_SUFFIX: &str = "omnistore-upload_test";

/// Default S3 region
pub const DEFAULT_S3_REGION: &str = "us-east-1";

/// Default multipart upload part size for S3 (16 MB)
pub const DEFAULT_S3_MULTIPART_PART_SIZE: usize = 16 * 1024 * 1024;

/// Azure single-shot upload size limit before staging blocks (16 MB)
pub const AZURE_MAX_SINGLE_PUT_SIZE: usize = 16 * 1024 * 1024;

/// HTTP driver connect timeout
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP driver read timeout, also the floor of the upload timeout
pub const HTTP_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Slowest upload speed the HTTP driver budgets for (KB/s)
pub const HTTP_MIN_KBPS_SPEED: u64 = 50;

// ============================================================================
// Environment variables
// ============================================================================

/// Path of the JSON settings file loaded by `StorageSettings::load`
pub const ENV_CONFIG_PATH: &str = "OMNISTORE_CONFIG";

/// Worker threads of the global Tokio runtime
pub const ENV_RT_THREADS: &str = "OMNISTORE_RT_THREADS";

pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_AWS_ENDPOINT_URL: &str = "AWS_ENDPOINT_URL";
pub const ENV_AWS_CA_BUNDLE_PATH: &str = "AWS_CA_BUNDLE_PATH";

pub const ENV_GOOGLE_CLOUD_PROJECT: &str = "GOOGLE_CLOUD_PROJECT";
pub const ENV_GOOGLE_APPLICATION_CREDENTIALS: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Custom GCS endpoint (emulators, proxies)
pub const ENV_GCS_ENDPOINT_URL: &str = "GCS_ENDPOINT_URL";

pub const ENV_AZURE_STORAGE_ACCOUNT: &str = "AZURE_STORAGE_ACCOUNT";
pub const ENV_AZURE_STORAGE_KEY: &str = "AZURE_STORAGE_KEY";
