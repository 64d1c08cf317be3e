//! Background rotation of the counting windows.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Windows;
use crate::clock::Clock;

/// Handle to the task that retires expired windows in the background.
///
/// The task wakes at each window deadline, rotates the pair, and derives
/// the next deadline from the fresh window. Deadlines are recomputed from
/// the clock on every pass, so the loop never accumulates drift, and a
/// deadline already in the past rotates immediately instead of erroring.
///
/// Dropping the handle cancels the loop; [`stop`](RotationTask::stop)
/// additionally awaits its exit for deterministic teardown.
#[derive(Debug)]
pub(super) struct RotationTask {
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl RotationTask {
    /// Spawns the rotation loop on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub(super) fn spawn<C: Clock + 'static>(windows: Arc<Windows>, clock: C) -> Self {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();

        let handle = tokio::spawn(async move {
            #[cfg(feature = "tracing")]
            tracing::trace!("window rotation task started");

            loop {
                let now = clock.now_micros();
                let wait = windows.current_end_micros().saturating_sub(now);

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_micros(wait)) => {
                        windows.refresh(clock.now_micros());
                    }
                }
            }

            #[cfg(feature = "tracing")]
            tracing::trace!("window rotation task stopped");
        });

        Self {
            handle,
            cancellation_token,
        }
    }

    /// Cancels the loop and waits for it to finish.
    pub(super) async fn stop(mut self) {
        self.cancellation_token.cancel();

        // Join only fails if the loop panicked, and nothing in it does.
        let _ = (&mut self.handle).await;
    }
}

impl Drop for RotationTask {
    fn drop(&mut self) {
        // A limiter dropped without `shutdown` must not leak the loop.
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_utils::ManualClock;
    use crate::clock::SystemClock;

    #[tokio::test]
    async fn stop_terminates_the_loop() {
        let windows = Arc::new(Windows::new(0, 60_000_000));
        let task = RotationTask::spawn(windows, SystemClock);

        let stopped = tokio::time::timeout(Duration::from_secs(1), task.stop()).await;

        assert!(stopped.is_ok(), "stop must not outwait the window");
    }

    #[tokio::test]
    async fn dropping_the_handle_cancels_the_loop() {
        let windows = Arc::new(Windows::new(0, 60_000_000));
        let task = RotationTask::spawn(windows, SystemClock);
        let token = task.cancellation_token.clone();

        drop(task);

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn an_expired_window_rotates_immediately() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_millis(5));

        // The window ended 4ms before the task even starts: the first
        // pass must rotate without waiting out a full span.
        let windows = Arc::new(Windows::new(0, 1_000));
        let task = RotationTask::spawn(windows.clone(), clock.clone());

        let rotated = tokio::time::timeout(Duration::from_secs(1), async {
            while windows.current_end_micros() == 1_000 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(rotated.is_ok(), "overdue window was never rotated");
        task.stop().await;
    }
}
