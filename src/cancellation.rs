use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One-shot signal that the request task has released its resources.
/// Checked-then-awaited so a late waiter still observes a signal that fired
/// before it subscribed.
pub struct ReleaseSignal {
    notify: Notify,
    done: AtomicBool,
}

impl ReleaseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
        })
    }

    pub fn fire(&self) {
        self.done.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn fired(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.fired() {
                return;
            }
            let notified = self.notify.notified();
            if self.fired() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ReleaseSignal {
    fn default() -> Self {
        Self {
            notify: Notify::new(),
            done: AtomicBool::new(false),
        }
    }
}

/// Held by the request task; firing on drop means even a forced abort ends
/// with a confirmed release instead of a fire-and-forget close.
pub struct ReleaseGuard(Arc<ReleaseSignal>);

impl ReleaseGuard {
    pub fn new(signal: Arc<ReleaseSignal>) -> Self {
        Self(signal)
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fire();
    }
}

/// Everything interrupt() needs to tear down one in-flight request.
pub struct RequestHandle {
    pub id: String,
    pub discard: Arc<AtomicBool>,
    pub token: CancellationToken,
    pub released: Arc<ReleaseSignal>,
    pub task: JoinHandle<()>,
}

/// Coordinates barge-in teardown: discard flag first so nothing stale leaks
/// downstream, then cooperative cancellation, then a bounded wait for the
/// resource-release signal, with forced task termination as the last resort.
pub struct CancellationController {
    release_timeout: Duration,
}

impl CancellationController {
    pub fn new(release_timeout: Duration) -> Self {
        Self { release_timeout }
    }

    /// Blocks until the request's resources are confirmed released. After
    /// this returns, no audio_data for the interrupted request can reach
    /// downstream.
    pub async fn interrupt(&self, handle: RequestHandle) -> Result<()> {
        handle.discard.store(true, Ordering::SeqCst);
        handle.token.cancel();

        match tokio::time::timeout(self.release_timeout, handle.released.wait()).await {
            Ok(()) => {}
            Err(_) => {
                warn!(
                    request_id = %handle.id,
                    "release signal overdue, forcing task termination"
                );
                handle.task.abort();
                let _ = handle.task.await;
                handle.released.wait().await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_release_fires_on_guard_drop() {
        let signal = ReleaseSignal::new();
        let guard = ReleaseGuard::new(signal.clone());
        assert!(!signal.fired());
        drop(guard);
        assert!(signal.fired());
        // A waiter arriving after the fact still returns.
        signal.wait().await;
    }

    #[tokio::test]
    async fn test_interrupt_waits_for_cooperative_release() {
        let signal = ReleaseSignal::new();
        let discard = Arc::new(AtomicBool::new(false));
        let token = CancellationToken::new();

        let task_signal = signal.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let _guard = ReleaseGuard::new(task_signal);
            task_token.cancelled().await;
        });

        let controller = CancellationController::new(Duration::from_secs(1));
        let handle = RequestHandle {
            id: "r1".to_string(),
            discard: discard.clone(),
            token,
            released: signal.clone(),
            task,
        };
        controller.interrupt(handle).await.unwrap();
        assert!(discard.load(Ordering::SeqCst));
        assert!(signal.fired());
    }

    #[tokio::test]
    async fn test_interrupt_forces_termination_of_a_stuck_task() {
        let signal = ReleaseSignal::new();
        let token = CancellationToken::new();

        let task_signal = signal.clone();
        let task = tokio::spawn(async move {
            let _guard = ReleaseGuard::new(task_signal);
            // Ignores cancellation entirely.
            futures::future::pending::<()>().await;
        });

        let controller = CancellationController::new(Duration::from_millis(50));
        let handle = RequestHandle {
            id: "r1".to_string(),
            discard: Arc::new(AtomicBool::new(false)),
            token,
            released: signal.clone(),
            task,
        };
        controller.interrupt(handle).await.unwrap();
        assert!(signal.fired());
    }
}
