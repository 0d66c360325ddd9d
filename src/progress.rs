// src/progress.rs
//
// Progress sinks for transfers: throttled log reports, upload callbacks and an
// indicatif bar for the CLI.

use indicatif::{ProgressBar, ProgressStyle};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::constants::DEFAULT_REPORT_CHUNK_SIZE_MB;
use crate::error::StorageError;

const MB: f64 = 1024.0 * 1024.0;

/// Observer of one transfer. Every method has a no-op default; each sink
/// decides how to treat its own failures.
pub trait ProgressSink: Send + Sync {
    /// Transfer begins; `total` is the object size when known.
    fn on_start(&self, _total: Option<u64>) {}

    /// `n` more bytes moved.
    fn on_bytes(&self, _n: u64) {}

    fn on_error(&self, _err: &StorageError) {}

    /// Transfer finished at `dest`.
    fn on_complete(&self, _dest: &str) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

// -----------------------------------------------------------------------------
// Download report
// -----------------------------------------------------------------------------

#[derive(Debug)]
struct ReportState {
    total_mb: f64,
    downloaded_mb: f64,
    last_reported: f64,
    tic: Instant,
}

/// Logs `Downloading: X MB / Y MB @ Z MB/s from <url>` each time another
/// report chunk (5 MB) has arrived, or on every chunk when verbose.
#[derive(Debug)]
pub struct DownloadProgressReport {
    remote_path: String,
    verbose: bool,
    report_chunk_size_mb: f64,
    state: Mutex<ReportState>,
}

impl DownloadProgressReport {
    pub fn new(remote_path: impl Into<String>, total_size: Option<u64>, verbose: bool) -> Self {
        Self {
            remote_path: remote_path.into(),
            verbose,
            report_chunk_size_mb: DEFAULT_REPORT_CHUNK_SIZE_MB,
            state: Mutex::new(ReportState {
                total_mb: total_size.map(|s| s as f64 / MB).unwrap_or(-1.0),
                downloaded_mb: 0.0,
                last_reported: 0.0,
                tic: Instant::now(),
            }),
        }
    }

    pub fn with_report_chunk_size_mb(mut self, mb: f64) -> Self {
        self.report_chunk_size_mb = mb;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downloaded_mb(&self) -> f64 {
        self.state().downloaded_mb
    }

    /// At least one progress line was logged.
    pub fn reported(&self) -> bool {
        self.state().last_reported > 0.0
    }
}

impl ProgressSink for DownloadProgressReport {
    fn on_start(&self, total: Option<u64>) {
        let mut state = self.state();
        if let Some(total) = total {
            state.total_mb = total as f64 / MB;
        }
        state.tic = Instant::now();
        if self.verbose {
            info!("Start downloading from {}", self.remote_path);
        }
    }

    fn on_bytes(&self, n: u64) {
        let mut state = self.state();
        state.downloaded_mb += n as f64 / MB;
        let last_part = state.downloaded_mb - state.last_reported;
        if self.verbose || last_part >= self.report_chunk_size_mb {
            let elapsed = state.tic.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 { last_part / elapsed } else { 0.0 };
            state.tic = Instant::now();
            state.last_reported = state.downloaded_mb;
            info!(
                "Downloading: {:.0}MB / {:.2}MB @ {:.2}MB/s from {}",
                state.downloaded_mb, state.total_mb, speed, self.remote_path
            );
        }
    }

    fn on_error(&self, err: &StorageError) {
        error!("Could not download {} , err: {}", self.remote_path, err);
    }

    fn on_complete(&self, dest: &str) {
        let state = self.state();
        if self.verbose || state.last_reported > 0.0 {
            info!(
                "Downloaded {:.2} MB successfully from {} , saved to {}",
                state.downloaded_mb, self.remote_path, dest
            );
        }
    }
}

// -----------------------------------------------------------------------------
// Upload callback
// -----------------------------------------------------------------------------

/// What an upload callback is told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Started,
    /// Destination URL of the finished upload
    Completed(String),
    Failed,
}

pub type UploadCallback = Arc<dyn Fn(UploadEvent) + Send + Sync>;

/// Adapts a plain callback to `ProgressSink`. A panicking callback is logged
/// and otherwise ignored so it cannot abort the upload.
pub struct CallbackProgress {
    callback: UploadCallback,
}

impl CallbackProgress {
    pub fn new(callback: UploadCallback) -> Self {
        Self { callback }
    }

    fn fire(&self, event: UploadEvent) {
        let callback = &self.callback;
        let label = format!("{event:?}");
        if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
            warn!("Exception on upload callback ({})", label);
        }
    }
}

impl ProgressSink for CallbackProgress {
    fn on_start(&self, _total: Option<u64>) {
        self.fire(UploadEvent::Started);
    }

    fn on_error(&self, _err: &StorageError) {
        self.fire(UploadEvent::Failed);
    }

    fn on_complete(&self, dest: &str) {
        self.fire(UploadEvent::Completed(dest.to_string()));
    }
}

// -----------------------------------------------------------------------------
// Terminal bar
// -----------------------------------------------------------------------------

/// indicatif bar for interactive transfers.
pub struct BarProgress {
    operation: String,
    progress_bar: ProgressBar,
    bytes: AtomicU64,
    started: Mutex<Instant>,
}

impl BarProgress {
    pub fn new(operation: &str) -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{}: {{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, ETA: {{eta}})",
                    operation
                ))
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        Self {
            operation: operation.to_string(),
            progress_bar: pb,
            bytes: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }
    }

    pub fn hidden(operation: &str) -> Self {
        let bar = Self::new(operation);
        bar.progress_bar.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        bar
    }

    pub fn position(&self) -> u64 {
        self.progress_bar.position()
    }

    fn elapsed(&self) -> Duration {
        self.started.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

impl ProgressSink for BarProgress {
    fn on_start(&self, total: Option<u64>) {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        match total {
            Some(total) => self.progress_bar.set_length(total),
            None => self.progress_bar.enable_steady_tick(Duration::from_millis(100)),
        }
    }

    fn on_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        self.progress_bar.inc(n);
    }

    fn on_error(&self, err: &StorageError) {
        self.progress_bar.abandon_with_message(format!("{} failed: {}", self.operation, err));
    }

    fn on_complete(&self, _dest: &str) {
        let total = self.bytes.load(Ordering::Relaxed);
        let secs = self.elapsed().as_secs_f64();
        let throughput = if secs > 0.0 { total as f64 / MB / secs } else { 0.0 };
        self.progress_bar.finish_with_message(format!(
            "{} complete! {:.2} MB in {:.2}s ({:.2} MB/s)",
            self.operation,
            total as f64 / MB,
            secs,
            throughput
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_report_throttles() {
        let report = DownloadProgressReport::new("s3://b/k", Some(20 * 1024 * 1024), false);
        report.on_start(None);
        report.on_bytes(1024 * 1024);
        assert!(!report.reported());
        report.on_bytes(4 * 1024 * 1024);
        assert!(report.reported());
        assert!((report.downloaded_mb() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_download_report_verbose_reports_every_chunk() {
        let report = DownloadProgressReport::new("s3://b/k", None, true);
        report.on_bytes(10);
        assert!(report.reported());
    }

    #[test]
    fn test_callback_progress_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            CallbackProgress::new(Arc::new(move |e| seen.lock().unwrap().push(e)))
        };
        sink.on_start(Some(3));
        sink.on_bytes(3);
        sink.on_complete("s3://b/k");
        sink.on_error(&StorageError::Transfer("x".into()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![UploadEvent::Started, UploadEvent::Completed("s3://b/k".into()), UploadEvent::Failed]
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let sink = CallbackProgress::new(Arc::new(|_| panic!("callback bug")));
        sink.on_start(None);
        sink.on_complete("file:///tmp/x");
    }

    #[test]
    fn test_bar_counts_bytes() {
        let bar = BarProgress::hidden("download");
        bar.on_start(Some(100));
        bar.on_bytes(40);
        bar.on_bytes(60);
        assert_eq!(bar.position(), 100);
        bar.on_complete("x");
    }
}
