// src/upload_pool.rs
//
// Background upload workers.
//
// A fixed number of worker threads pull `UploadTask`s from a FIFO queue and
// hand each one to its `UploadExecutor`. Shutdown is cooperative: the cancel
// flag is raised, executors observe it between chunks, and `terminate` waits
// for the registered threads within a timeout budget.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::constants::UPLOAD_POOL_POLL_INTERVAL;
use crate::driver::Extra;
use crate::error::{Result, StorageError};
use crate::progress::UploadCallback;

/// Shared cancellation flag. Once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is raised.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled(what.to_string()));
        }
        Ok(())
    }
}

/// One queued upload. Immutable once submitted and consumed exactly once.
pub struct UploadTask {
    pub src_path: PathBuf,
    pub dest_path: String,
    pub extra: Extra,
    pub callback: Option<UploadCallback>,
    pub retries: usize,
}

impl std::fmt::Debug for UploadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadTask")
            .field("src_path", &self.src_path)
            .field("dest_path", &self.dest_path)
            .field("retries", &self.retries)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Runs a dequeued task on a worker thread; returns the destination URL.
pub trait UploadExecutor: Send + Sync {
    fn execute(&self, task: UploadTask, cancel: &CancelFlag) -> Result<String>;
}

/// How `terminate` spends its timeout across worker threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminatePolicy {
    /// One budget for all threads, consumed in registration order
    #[default]
    SharedBudget,
    /// The full timeout for each thread
    PerThread,
}

/// Pending result of an asynchronous upload.
pub struct UploadHandle {
    rx: Mutex<Receiver<Result<String>>>,
    dest: String,
}

impl UploadHandle {
    fn new(rx: Receiver<Result<String>>, dest: String) -> Self {
        Self { rx: Mutex::new(rx), dest }
    }

    /// Destination the task was submitted for.
    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Block until the upload finishes.
    pub fn wait(self) -> Result<String> {
        let rx = self.rx.into_inner().unwrap_or_else(PoisonError::into_inner);
        rx.recv()
            .map_err(|_| StorageError::Cancelled(format!("upload to {} was dropped", self.dest)))?
    }

    /// Wait at most `timeout`; `None` while the upload is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<String>> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err(StorageError::Cancelled(format!("upload to {} was dropped", self.dest))))
            }
        }
    }
}

struct Job {
    task: UploadTask,
    executor: Arc<dyn UploadExecutor>,
    done: Sender<Result<String>>,
}

struct PoolInner {
    sender: Option<Sender<Job>>,
    /// Live-thread registry in spawn order
    threads: Vec<JoinHandle<()>>,
}

/// Bounded worker pool for asynchronous uploads.
pub struct UploadPool {
    workers: usize,
    cancel: CancelFlag,
    inner: Mutex<PoolInner>,
}

impl UploadPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            cancel: CancelFlag::new(),
            inner: Mutex::new(PoolInner { sender: None, threads: Vec::new() }),
        }
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    /// Threads still registered (running or not yet reaped).
    pub fn live_threads(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.threads.iter().filter(|t| !t.is_finished()).count()
    }

    /// Queue `task`. Workers start on first use. After termination the
    /// handle resolves to `Cancelled` right away.
    pub fn submit(&self, task: UploadTask, executor: Arc<dyn UploadExecutor>) -> UploadHandle {
        let (done, rx) = mpsc::channel();
        let handle = UploadHandle::new(rx, task.dest_path.clone());
        if self.cancel.is_cancelled() {
            let _ = done.send(Err(StorageError::Cancelled(format!("upload to {} after shutdown", task.dest_path))));
            return handle;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.sender.is_none() {
            match self.start_workers() {
                Ok((sender, threads)) => {
                    inner.sender = Some(sender);
                    inner.threads.extend(threads);
                }
                Err(e) => {
                    error!("Failed starting upload workers: {}", e);
                    let _ = done.send(Err(e));
                    return handle;
                }
            }
        }
        let job = Job { task, executor, done };
        if let Some(sender) = inner.sender.as_ref() {
            if let Err(mpsc::SendError(job)) = sender.send(job) {
                let _ = job.done.send(Err(StorageError::Cancelled(format!(
                    "upload pool closed before {} was queued",
                    job.task.dest_path
                ))));
            }
        }
        handle
    }

    fn start_workers(&self) -> Result<(Sender<Job>, Vec<JoinHandle<()>>)> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut threads = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let receiver = receiver.clone();
            let cancel = self.cancel.clone();
            let t = thread::Builder::new()
                .name(format!("omnistore-upload-{i}"))
                .spawn(move || worker_loop(receiver, cancel))?;
            threads.push(t);
        }
        debug!("Started {} upload worker(s)", self.workers);
        Ok((sender, threads))
    }

    /// Stop the pool. `force` returns at once and leaves running uploads to
    /// finish on their own. Otherwise the cancel flag is raised and each
    /// registered thread is waited for according to `policy`. Returns the
    /// number of threads still alive when the budget ran out.
    pub fn terminate(&self, force: bool, timeout: Duration, policy: TerminatePolicy) -> usize {
        if force {
            return 0;
        }
        self.cancel.cancel();
        let threads = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner.sender = None;
            std::mem::take(&mut inner.threads)
        };

        let started = Instant::now();
        let mut stragglers = Vec::new();
        for t in threads {
            let budget = match policy {
                TerminatePolicy::SharedBudget => timeout.saturating_sub(started.elapsed()),
                TerminatePolicy::PerThread => timeout,
            };
            if join_within(&t, budget) {
                let _ = t.join();
            } else {
                stragglers.push(t);
            }
        }
        if !stragglers.is_empty() {
            warn!("{} upload thread(s) still running after {:?}", stragglers.len(), started.elapsed());
        }
        let alive = stragglers.len();
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .threads
            .extend(stragglers);
        alive
    }
}

impl Drop for UploadPool {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.sender = None;
    }
}

fn join_within(t: &JoinHandle<()>, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while !t.is_finished() {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(UPLOAD_POOL_POLL_INTERVAL.min(deadline - now));
    }
    true
}

fn worker_loop(receiver: Arc<Mutex<Receiver<Job>>>, cancel: CancelFlag) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(UPLOAD_POOL_POLL_INTERVAL);
        match next {
            Ok(job) => {
                let Job { task, executor, done } = job;
                let result = match cancel.check(&task.dest_path) {
                    Ok(()) => executor.execute(task, &cancel),
                    Err(e) => Err(e),
                };
                let _ = done.send(result);
            }
            Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => return,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recording {
        runs: AtomicUsize,
    }

    impl UploadExecutor for Recording {
        fn execute(&self, task: UploadTask, _cancel: &CancelFlag) -> Result<String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(task.dest_path)
        }
    }

    fn task(dest: &str) -> UploadTask {
        UploadTask {
            src_path: PathBuf::from("/dev/null"),
            dest_path: dest.to_string(),
            extra: Extra::new(),
            callback: None,
            retries: 1,
        }
    }

    #[test]
    fn test_tasks_complete_through_handles() {
        let pool = UploadPool::new(2);
        let exec = Arc::new(Recording { runs: AtomicUsize::new(0) });
        let handles: Vec<_> = (0..5).map(|i| pool.submit(task(&format!("file:///x/{i}")), exec.clone())).collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.wait().unwrap(), format!("file:///x/{i}"));
        }
        assert_eq!(exec.runs.load(Ordering::SeqCst), 5);
        assert_eq!(pool.terminate(false, Duration::from_secs(1), TerminatePolicy::SharedBudget), 0);
    }

    #[test]
    fn test_submit_after_terminate_is_cancelled() {
        let pool = UploadPool::new(1);
        pool.terminate(false, Duration::from_millis(10), TerminatePolicy::SharedBudget);
        let exec = Arc::new(Recording { runs: AtomicUsize::new(0) });
        let err = pool.submit(task("file:///late"), exec.clone()).wait().unwrap_err();
        assert!(matches!(err, StorageError::Cancelled(_)));
        assert_eq!(exec.runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_force_terminate_returns_immediately() {
        let pool = UploadPool::new(1);
        let started = Instant::now();
        assert_eq!(pool.terminate(true, Duration::from_secs(5), TerminatePolicy::SharedBudget), 0);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!pool.cancel_flag().is_cancelled());
    }

    #[test]
    fn test_cancel_flag_check() {
        let flag = CancelFlag::new();
        assert!(flag.check("x").is_ok());
        flag.clone().cancel();
        assert!(matches!(flag.check("x"), Err(StorageError::Cancelled(_))));
    }
}
