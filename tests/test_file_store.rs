// tests/test_file_store.rs
//
// End-to-end tests of the local filesystem backend through StorageManager:
// bare paths and file:// URLs share one helper, uploads land where the URL
// says, listings honour prefixes, and destination checks create folders.

use anyhow::Result;
use omnistore::driver::{ContainerConfig, StorageDriver};
use omnistore::file_store::FileDriver;
use omnistore::resolver::Resolver;
use omnistore::{infer_scheme, Scheme, StorageHelper, StorageManager, StorageSettings, UploadPool};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn url(dir: &TempDir, rel: &str) -> String {
    format!("file://{}/{}", dir.path().display(), rel)
}

#[test]
fn test_file_scheme_inference() {
    assert_eq!(infer_scheme("file:///tmp/test.txt"), Scheme::File);
    assert_eq!(infer_scheme("/direct/path/test.txt"), Scheme::File);
    assert_eq!(infer_scheme("relative/test.txt"), Scheme::File);
    assert_eq!(infer_scheme("s3://bucket/test.txt"), Scheme::S3);
    assert_eq!(infer_scheme("gs://bucket/test.txt"), Scheme::Gs);
    assert_eq!(infer_scheme("https://example.com/test.txt"), Scheme::Https);
}

#[test]
fn test_upload_list_delete() -> Result<()> {
    let work = TempDir::new()?;
    let store = TempDir::new()?;
    let src = work.path().join("metrics.json");
    fs::write(&src, br#"{"loss": 0.25}"#)?;

    let manager = StorageManager::default();
    let helper = manager.get(&url(&store, "")).expect("file helper");
    assert_eq!(helper.base_url(), "file://");

    let dest = url(&store, "runs/7/metrics.json");
    let uploaded = helper.upload(&src, Some(&dest), None, 1, None)?;
    assert_eq!(uploaded, dest);
    assert_eq!(fs::read(store.path().join("runs/7/metrics.json"))?, br#"{"loss": 0.25}"#);

    helper.upload(&src, Some(&url(&store, "runs/8/metrics.json")), None, 1, None)?;
    helper.upload(&src, Some(&url(&store, "runs.json")), None, 1, None)?;

    let prefix = format!("{}/runs/", store.path().display());
    let listed = helper.list(Some(&url(&store, "runs/")))?;
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|n| n.starts_with(&prefix) && *n != prefix));

    assert!(helper.delete(&dest)?);
    assert!(!store.path().join("runs/7/metrics.json").exists());
    assert_eq!(helper.list(Some(&url(&store, "runs/")))?.len(), 1);
    Ok(())
}

#[test]
fn test_list_excludes_the_prefix_itself() -> Result<()> {
    let store = TempDir::new()?;
    fs::create_dir_all(store.path().join("a"))?;
    fs::write(store.path().join("a/x.bin"), b"x")?;
    fs::write(store.path().join("a/y.bin"), b"y")?;
    fs::write(store.path().join("b.bin"), b"b")?;

    let manager = StorageManager::default();
    let helper = manager.get(&url(&store, "a/")).expect("file helper");
    let prefix = format!("{}/a/", store.path().display());
    let names = helper.list(Some(&prefix))?;
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&prefix));
    assert!(names.iter().all(|n| n.starts_with(&prefix)));

    // a prefix pointing at nothing lists nothing
    assert!(helper.list(Some(&url(&store, "c/")))?.is_empty());
    Ok(())
}

#[test]
fn test_list_with_container_relative_prefix() -> Result<()> {
    let store = TempDir::new()?;
    fs::create_dir_all(store.path().join("a"))?;
    fs::write(store.path().join("a/x.bin"), b"x")?;
    fs::write(store.path().join("a/y.bin"), b"y")?;
    fs::write(store.path().join("b.bin"), b"b")?;

    let container = FileDriver::new().get_container(&url(&store, ""), &ContainerConfig::File)?;
    let resolver = Arc::new(Resolver::new(&StorageSettings::default()));
    let helper = StorageHelper::new("file://", Scheme::File, container, resolver, Arc::new(UploadPool::new(1)), false);

    assert_eq!(helper.list(Some("a/"))?, vec!["a/x.bin", "a/y.bin"]);
    assert_eq!(helper.list(Some("a"))?, vec!["a/x.bin", "a/y.bin"]);
    let everything = helper.list(None)?;
    assert_eq!(everything, vec!["a/x.bin", "a/y.bin", "b.bin"]);
    assert!(everything.iter().all(|n| !n.starts_with("./")));
    Ok(())
}

#[test]
fn test_verify_upload_creates_folder_once() -> Result<()> {
    let store = TempDir::new()?;
    let folder = store.path().join("results/run-1");
    let folder_str = folder.to_string_lossy().to_string();

    let manager = StorageManager::default();
    let helper = manager.get(&folder_str).expect("file helper");
    let first = helper.verify_upload(&folder_str, true)?;
    assert!(folder.is_dir());
    assert_eq!(first, format!("file://{}", folder_str));

    let second = helper.verify_upload(&folder_str, true)?;
    assert_eq!(first, second);
    assert!(fs::read_dir(&folder)?.next().is_none());
    Ok(())
}

#[test]
fn test_check_write_permissions_leaves_nothing_behind() -> Result<()> {
    let store = TempDir::new()?;
    let manager = StorageManager::default();
    let dest = url(&store, "");
    let helper = manager.get(&dest).expect("file helper");
    assert!(helper.check_write_permissions(Some(&dest))?);
    assert!(fs::read_dir(store.path())?.next().is_none());
    Ok(())
}

#[cfg(unix)]
#[test]
fn test_check_write_permissions_on_read_only_folder() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let store = TempDir::new()?;
    let locked = store.path().join("locked");
    fs::create_dir(&locked)?;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o555))?;
    // root ignores directory permissions
    if fs::write(locked.join("probe"), b"").is_ok() {
        return Ok(());
    }

    let manager = StorageManager::default();
    let dest = format!("file://{}", locked.display());
    let helper = manager.get(&dest).expect("file helper");
    let err = helper.check_write_permissions(Some(&dest)).unwrap_err();
    assert!(err.to_string().starts_with("insufficient permissions for"));

    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755))?;
    Ok(())
}
