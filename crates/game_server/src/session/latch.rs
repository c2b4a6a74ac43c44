//! The latch: process-wide serialization of protocol handlers.
//!
//! Every multiplexer in the process shares one [`Latch`]. At most one
//! handler body executes at any instant, so game logic can mutate shared
//! state without per-entity locking. The cost is that handler throughput is
//! capped at a single handler at a time across all sessions. Network I/O
//! (receive pumps, frame sends) never runs under the latch and stays fully
//! concurrent.
//!
//! Keep handlers short and never perform blocking I/O inside them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Mutual-exclusion gate around handler invocation.
#[derive(Debug, Default)]
pub struct Latch {
    gate: Mutex<()>,
    invocations: AtomicU64,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the latch.
    ///
    /// A panic inside `f` is caught and returned as `Err` with the panic
    /// message; the latch is released either way.
    pub async fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, String> {
        let _guard = self.gate.lock().await;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            if let Some(msg) = payload.downcast_ref::<&str>() {
                (*msg).to_string()
            } else if let Some(msg) = payload.downcast_ref::<String>() {
                msg.clone()
            } else {
                "unknown panic".to_string()
            }
        })
    }

    /// Total number of handler invocations admitted so far.
    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let latch = Latch::new();
        let value = latch.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(latch.invocations(), 1);
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_latch_released() {
        let latch = Latch::new();
        let err = latch.run(|| -> u8 { panic!("boom") }).await.unwrap_err();
        assert_eq!(err, "boom");

        // still usable afterwards
        assert_eq!(latch.run(|| 1).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bodies_never_overlap() {
        let latch = Arc::new(Latch::new());
        let busy = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            let busy = busy.clone();
            tasks.push(tokio::spawn(async move {
                latch
                    .run(|| {
                        assert!(!busy.swap(true, Ordering::SeqCst), "overlapping handlers");
                        std::thread::sleep(Duration::from_millis(5));
                        busy.store(false, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(latch.invocations(), 8);
    }
}
