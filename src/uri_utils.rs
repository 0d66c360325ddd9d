// src/uri_utils.rs
//! URI helpers shared by the resolver and the drivers.
//!
//! Storage URLs come in two shapes: scheme-qualified (`s3://host/bucket/key`,
//! `gs://bucket/key`, `azure://account.blob.core.windows.net/container/blob`,
//! `http(s)://host/path`, `file:///abs/path`) and bare local paths. Anything
//! without a recognised scheme is treated as a local path.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

/// Backend kind addressed by a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    S3,
    Gs,
    Azure,
    Http,
    Https,
    File,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::S3 => "s3",
            Scheme::Gs => "gs",
            Scheme::Azure => "azure",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::File => "file",
        }
    }

    /// `scheme://`
    pub fn prefix(&self) -> String {
        format!("{}://", self.as_str())
    }

    /// Object stores address objects by bucket-relative keys without a leading `/`.
    pub fn is_object_store(&self) -> bool {
        matches!(self, Scheme::S3 | Scheme::Gs | Scheme::Azure)
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Scheme::Http | Scheme::Https)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split `scheme://rest` into its two halves. Returns `None` for bare paths.
pub fn split_scheme(url: &str) -> Option<(&str, &str)> {
    let pos = url.find("://")?;
    let scheme = &url[..pos];
    // a drive letter or anything non-alphanumeric is not a scheme
    if scheme.len() < 2 || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.') {
        return None;
    }
    Some((scheme, &url[pos + 3..]))
}

/// Best-effort scheme inference; unknown or absent schemes are local files.
pub fn infer_scheme(url: &str) -> Scheme {
    match split_scheme(url).map(|(s, _)| s.to_ascii_lowercase()) {
        Some(s) if s == "s3" => Scheme::S3,
        Some(s) if s == "gs" => Scheme::Gs,
        Some(s) if s == "azure" => Scheme::Azure,
        Some(s) if s == "http" => Scheme::Http,
        Some(s) if s == "https" => Scheme::Https,
        _ => Scheme::File,
    }
}

/// Parsed pieces of a scheme-qualified URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub scheme: String,
    /// host[:port] (S3/HTTP), bucket (GCS), account host (Azure)
    pub netloc: String,
    /// Everything after the netloc, including the leading `/` when present
    pub path: String,
}

impl UrlParts {
    /// Non-empty `/`-separated path segments.
    pub fn segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }
}

/// Parse `scheme://netloc/path`. Fails for bare paths.
pub fn parse_url(url: &str) -> Result<UrlParts> {
    let (scheme, rest) = split_scheme(url)
        .ok_or_else(|| StorageError::InvalidUrl(format!("missing scheme in {url}")))?;
    let (netloc, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };
    Ok(UrlParts {
        scheme: scheme.to_ascii_lowercase(),
        netloc: netloc.to_string(),
        path: path.to_string(),
    })
}

/// Turn a `file://` URL or bare path into a filesystem path.
///
/// `file:///abs/path` → `/abs/path`; `file://./rel` → `./rel`; Windows
/// back-slashes are normalized to `/` before conversion.
pub fn file_url_to_path(url: &str) -> PathBuf {
    let raw = match split_scheme(url) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("file") => rest,
        _ => url,
    };
    PathBuf::from(raw.replace('\\', "/"))
}

/// Absolute `file://` URL for a local path.
pub fn path_to_file_url(path: &Path) -> String {
    let display = path.to_string_lossy().replace('\\', "/");
    if display.starts_with('/') {
        format!("file://{display}")
    } else {
        format!("file:///{display}")
    }
}

/// Last path component of a URL or local path.
pub fn base_name(path: &str) -> &str {
    path.trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
}
