//! Shared one-shot timer pool
//!
//! Invoke timeouts and preview idle expiry run here. Callbacks execute on
//! the pool's workers, outside any caller lock; each callback re-validates
//! the state it was scheduled for before acting, so cancelling a timer
//! that already fired is harmless.

use crate::errors::{Result, TcapError};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Handle to a scheduled callback
#[derive(Debug)]
pub struct TimerHandle {
    abort: AbortHandle,
}

impl TimerHandle {
    /// Cancel the callback; no-op if it already ran
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// Multi-worker timer pool
pub struct TimerService {
    workers: usize,
    runtime: Mutex<Option<Runtime>>,
}

impl TimerService {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            runtime: Mutex::new(None),
        }
    }

    /// Spin up the worker pool (idempotent)
    pub fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Ok(());
        }

        let rt = Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name("tcap-timer")
            .enable_time()
            .build()?;
        *runtime = Some(rt);

        info!(workers = self.workers, "Timer pool started");
        Ok(())
    }

    /// Shut down the pool; pending callbacks never run
    pub fn stop(&self) {
        if let Some(rt) = self.runtime.lock().take() {
            rt.shutdown_background();
            info!("Timer pool stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// Run `task` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Result<TimerHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = self.runtime.lock();
        let rt = runtime.as_ref().ok_or(TcapError::NotStarted)?;

        let join = rt.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        debug!(delay_ms = delay.as_millis() as u64, "Timer scheduled");

        Ok(TimerHandle {
            abort: join.abort_handle(),
        })
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        // Runtime::drop blocks, which panics inside an async context
        if let Some(rt) = self.runtime.get_mut().take() {
            rt.shutdown_background();
        }
    }
}
