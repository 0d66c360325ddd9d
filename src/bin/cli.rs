//
// Copyright, 2025.  Signal65 / Futurum Group.
//
//! CLI over the storage orchestrator.
//!
//! Examples:
//! ```bash
//! omnistore-cli upload      model.bin s3://bucket/models/model.bin
//! omnistore-cli upload      'runs/*.json' gs://bucket/runs/ --async
//! omnistore-cli download    s3://bucket/models/model.bin /tmp/model.bin
//! omnistore-cli cat         https://example.com/data.csv | head
//! omnistore-cli ls          s3://bucket --prefix models/
//! omnistore-cli rm          azure://acct.blob.core.windows.net/container/old.bin
//! omnistore-cli verify      /mnt/results/run-7
//! omnistore-cli check-write s3://bucket/tmp
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use omnistore::constants::{DEFAULT_TERMINATE_TIMEOUT, DEFAULT_UPLOAD_RETRIES};
use omnistore::progress::BarProgress;
use omnistore::uri_utils::base_name;
use omnistore::{ByteSource, ProgressSink, StorageHelper, StorageManager, StorageSettings};

/// Macro to safely print with broken pipe handling
macro_rules! safe_println {
    ($($arg:tt)*) => {
        match writeln!(io::stdout(), $($arg)*) {
            Ok(_) => {},
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                // Gracefully exit on broken pipe (e.g., when piped to head/tail)
                std::process::exit(0);
            }
            Err(e) => return Err(e.into())
        }
    };
}

// -- Commands

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short = 'v',
        long,
        action = ArgAction::Count,
        help = "Increase log verbosity: -v = Info, -vv = Debug",
    )]
    verbose: u8,

    /// JSON settings file (defaults to $OMNISTORE_CONFIG)
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload local files. Several sources (or a glob) need a folder destination.
    Upload {
        /// Local file(s), glob patterns allowed
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Destination URL
        dest: String,
        /// Attempts per file
        #[arg(short = 'r', long, default_value_t = DEFAULT_UPLOAD_RETRIES)]
        retries: usize,
        /// Queue uploads on the background pool
        #[arg(long = "async")]
        run_async: bool,
        /// How long to wait for each background upload (e.g. "90s", "5m")
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Download one object to a local file.
    Download {
        remote: String,
        local: PathBuf,
        /// Replace an existing local file
        #[arg(long)]
        overwrite: bool,
        /// Leave the temporary file behind when the download fails
        #[arg(long)]
        keep_partial: bool,
    },

    /// Stream an object to stdout.
    Cat {
        remote: String,
        /// Show a progress bar on stderr
        #[arg(long)]
        progress: bool,
    },

    /// List objects under a container URL.
    Ls {
        url: String,
        #[arg(short = 'p', long)]
        prefix: Option<String>,
    },

    /// Delete one object.
    Rm { url: String },

    /// Check a destination folder is writable, creating local folders.
    Verify { folder: String },

    /// Upload and delete a marker object under a destination.
    CheckWrite { url: String },
}

fn main() -> Result<()> {
    // Loads any variables from .env file that are not already set
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",        // no -v: WARN level
        1 => "info",        // -v: INFO level
        _ => "debug",       // -vv or more: DEBUG level
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // Initialize tracing-log bridge to capture log crate messages from dependencies
    tracing_log::LogTracer::init().ok();

    let mut settings = match &cli.config {
        Some(path) => StorageSettings::from_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => StorageSettings::load().context("loading settings")?,
    };
    settings.apply_env();
    settings.verbose |= cli.verbose > 0;
    let manager = StorageManager::new(settings);

    match cli.cmd {
        Command::Upload { files, dest, retries, run_async, timeout } => {
            upload_cmd(&manager, &files, &dest, retries, run_async, timeout)?;
        }

        Command::Download { remote, local, overwrite, keep_partial } => {
            let helper = helper_for(&manager, &remote)?;
            match helper.download_to_file(&remote, &local, overwrite, !keep_partial)? {
                Some(path) => safe_println!("{}", path.display()),
                None => bail!("download of {} failed", remote),
            }
        }

        Command::Cat { remote, progress } => {
            cat_cmd(&manager, &remote, progress)?;
        }

        Command::Ls { url, prefix } => {
            let helper = helper_for(&manager, &url)?;
            let names = helper
                .list(prefix.as_deref())
                .with_context(|| format!("listing {url}"))?;
            for name in names {
                safe_println!("{}", name);
            }
        }

        Command::Rm { url } => {
            let helper = helper_for(&manager, &url)?;
            if !helper.delete(&url)? {
                bail!("{} was not deleted", url);
            }
            info!("Deleted {}", url);
        }

        Command::Verify { folder } => {
            let conformed = manager.conform_url(&folder, None)?;
            let helper = helper_for(&manager, &conformed)?;
            let url = helper.verify_upload(&conformed, true)?;
            safe_println!("{}", url);
        }

        Command::CheckWrite { url } => {
            let helper = helper_for(&manager, &url)?;
            helper.check_write_permissions(Some(&url))?;
            safe_println!("{} is writable", url);
        }
    }
    Ok(())
}

fn helper_for(manager: &StorageManager, url: &str) -> Result<std::sync::Arc<StorageHelper>> {
    manager
        .get_or_create(url, false)
        .with_context(|| format!("no storage access for {url}"))
}

/// Expand glob patterns into the files to upload.
fn expand_sources(patterns: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for pattern in patterns {
        let s = pattern.to_string_lossy();
        if s.contains('*') || s.contains('?') {
            for entry in glob::glob(&s)? {
                match entry {
                    Ok(path) if path.is_file() => files.push(path),
                    Ok(_) => {}
                    Err(e) => warn!("Glob error: {}", e),
                }
            }
        } else if pattern.is_file() {
            files.push(pattern.clone());
        } else {
            warn!("Skipping {}: not a file", pattern.display());
        }
    }
    Ok(files)
}

fn upload_cmd(
    manager: &StorageManager,
    patterns: &[PathBuf],
    dest: &str,
    retries: usize,
    run_async: bool,
    timeout: Option<Duration>,
) -> Result<()> {
    let files = expand_sources(patterns)?;
    if files.is_empty() {
        bail!("No files found to upload");
    }
    let to_folder = files.len() > 1 || dest.ends_with('/');
    let dest_for = |src: &Path| {
        if to_folder {
            format!("{}/{}", dest.trim_end_matches('/'), base_name(&src.to_string_lossy()))
        } else {
            dest.to_string()
        }
    };
    let helper = helper_for(manager, dest)?;

    if !run_async {
        for src in &files {
            let url = helper.upload(src, Some(&dest_for(src)), None, retries, None)?;
            safe_println!("{}", url);
        }
        return Ok(());
    }

    let handles: Vec<_> = files
        .iter()
        .map(|src| helper.upload_async(src, Some(&dest_for(src)), None, retries, None))
        .collect();
    let budget = timeout.unwrap_or(Duration::MAX);
    let mut failed = 0usize;
    for handle in &handles {
        match handle.wait_timeout(budget) {
            Some(Ok(url)) => safe_println!("{}", url),
            Some(Err(e)) => {
                failed += 1;
                warn!("Upload to {} failed: {}", handle.dest(), e);
            }
            None => {
                failed += 1;
                warn!("Upload to {} did not finish in time", handle.dest());
            }
        }
    }
    let alive = manager.terminate_uploads(false, DEFAULT_TERMINATE_TIMEOUT);
    if alive > 0 {
        warn!("{} upload thread(s) still running at exit", alive);
    }
    if failed > 0 {
        bail!("{} of {} uploads failed", failed, handles.len());
    }
    Ok(())
}

fn cat_cmd(manager: &StorageManager, remote: &str, progress: bool) -> Result<()> {
    let helper = helper_for(manager, remote)?;
    let Some(mut stream) = helper.download_as_stream(remote, None)? else {
        bail!("cannot read {}", remote);
    };
    let bar = if progress { BarProgress::new("CAT") } else { BarProgress::hidden("CAT") };
    bar.on_start(stream.remaining_len());

    let mut stdout = io::stdout().lock();
    loop {
        let chunk = match stream.next_chunk() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                bar.on_error(&e);
                return Err(e).with_context(|| format!("reading {remote}"));
            }
        };
        match stdout.write_all(&chunk) {
            Ok(()) => bar.on_bytes(chunk.len() as u64),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    match stdout.flush() {
        Err(e) if e.kind() == ErrorKind::BrokenPipe => return Ok(()),
        other => other?,
    }
    bar.on_complete(remote);
    Ok(())
}
