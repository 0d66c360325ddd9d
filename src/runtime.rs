// src/runtime.rs
//
//! Blocking bridge to the async vendor SDKs.
//!
//! One multi-thread Tokio runtime lives on its own background thread for the
//! lifetime of the process. Blocking callers (the orchestrator, upload
//! workers, pipe producers) hand futures to it with `run_on_global_rt` and
//! wait for the result on their own thread.

use anyhow::anyhow;
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::mpsc;
use std::thread;
use tokio::runtime::{Builder as TokioBuilder, Handle};
use tracing::debug;

use crate::constants::ENV_RT_THREADS;
use crate::error::{Result, StorageError};

static RT_HANDLE: OnceCell<Handle> = OnceCell::new();

/// Create (once) the background runtime and return its handle.
pub fn global_rt_handle() -> Result<&'static Handle> {
    RT_HANDLE.get_or_try_init(|| {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("omnistore-rt".to_string())
            .spawn(move || {
                let threads = get_runtime_threads();
                debug!("Creating Tokio runtime with {} worker threads", threads);

                let built = TokioBuilder::new_multi_thread()
                    .enable_io()
                    .enable_time()
                    .worker_threads(threads)
                    .thread_name("omnistore-rt-worker")
                    .build();
                match built {
                    Ok(rt) => {
                        // hand a clone back to the creator, then park the runtime forever
                        let _ = tx.send(Ok(rt.handle().clone()));
                        rt.block_on(std::future::pending::<()>());
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            })?;

        let handle = rx
            .recv()
            .map_err(|_| StorageError::Backend(anyhow!("runtime thread exited before start")))??;
        Ok(handle)
    })
}

/// Worker thread count, `OMNISTORE_RT_THREADS` or a CPU-based default.
fn get_runtime_threads() -> usize {
    std::env::var(ENV_RT_THREADS)
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|n: &usize| *n > 0)
        .unwrap_or_else(|| num_cpus::get().clamp(2, 16))
}

/// Run `fut` on the global runtime and block the current thread until it
/// completes. Safe to call from plain threads and from inside another runtime.
pub fn run_on_global_rt<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = global_rt_handle()?;
    let (tx, rx) = mpsc::channel();
    handle.spawn(async move {
        let _ = tx.send(fut.await);
    });
    rx.recv()
        .map_err(|_| StorageError::Backend(anyhow!("global runtime task crashed: RecvError(())")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_on_global_rt_returns_value() {
        let v = run_on_global_rt(async { Ok(21 * 2) }).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_run_on_global_rt_propagates_error() {
        let err = run_on_global_rt::<_, ()>(async { Err(StorageError::Transfer("boom".into())) })
            .unwrap_err();
        assert!(matches!(err, StorageError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_callable_from_async_context() {
        let v = tokio::task::spawn_blocking(|| run_on_global_rt(async { Ok("ok") }))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v, "ok");
    }
}
