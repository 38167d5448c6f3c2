use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

struct Armed {
    generation: u64,
    handle: JoinHandle<()>,
}

/// A single cancellable delayed task. Arming replaces whatever was armed
/// before, so at most one task is ever pending.
#[derive(Default)]
pub struct RenewalTimer {
    slot: Arc<Mutex<Option<Armed>>>,
    generation: AtomicU64,
}

impl RenewalTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, cancelling any previously armed task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::clone(&self.slot);

        let mut guard = self.slot.lock();
        if let Some(previous) = guard.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Release our slot before running so the task can re-arm without
            // aborting itself.
            {
                let mut guard = slot.lock();
                match guard.as_ref() {
                    Some(armed) if armed.generation == generation => {
                        guard.take();
                    }
                    _ => return,
                }
            }
            task.await;
        });

        debug!(generation, delay_secs = delay.as_secs(), "Renewal timer armed");
        *guard = Some(Armed { generation, handle });
    }

    /// Cancel the pending task, if any.
    pub fn disarm(&self) {
        if let Some(armed) = self.slot.lock().take() {
            armed.handle.abort();
            debug!(generation = armed.generation, "Renewal timer disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Drop for RenewalTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
