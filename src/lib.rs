// src/lib.rs
//
// Copyright, 2025.  Signal65 / Futurum Group.
//
// Crate root: module tree and public re-exports.

// ===== Core Public API =====
pub mod manager;
pub mod helper;
pub mod upload_pool;

pub use manager::StorageManager;
pub use helper::StorageHelper;
pub use upload_pool::{CancelFlag, TerminatePolicy, UploadHandle, UploadPool, UploadTask};

// ===== Internal Modules (Implementation) =====
// These are public for internal use but may change without notice

pub mod constants;
pub mod error;
pub mod config;
pub mod uri_utils;
pub mod substitution;
pub mod resolver;
pub mod progress;
pub mod pipe;
pub mod retry;
pub mod runtime;

// Backend drivers
pub mod driver;
pub mod file_store;
pub mod s3_store;
pub mod http_store;
pub mod gcs_store;    // real client behind the `gcs` feature
pub mod azure_store;  // real client behind the `azure` feature

// ===== Re-exports at the crate root =====
pub use config::{
    AzureContainerConfig,
    GsBucketConfig,
    PathSubstitutionRecord,
    S3BucketConfig,
    StorageSettings,
};
pub use driver::{Container, ContainerCapabilities, Extra, ObjectHandle};
pub use error::{Result, StorageError};
pub use http_store::HeaderProvider;
pub use pipe::{ByteSink, ByteSource, DuplexPipe, ReaderSource};
pub use progress::{ProgressSink, UploadCallback, UploadEvent};
pub use resolver::Resolver;
pub use retry::with_retry;
pub use uri_utils::{infer_scheme, Scheme};
