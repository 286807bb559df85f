use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Periodic job on the tokio runtime. The first run happens one `period` after
/// spawning; the job stops when cancelled, dropped, or when `job` returns
/// `false`.
#[derive(Debug)]
pub struct RepeatingTask {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        ticks = ticks.wrapping_add(1);
                        if !job(ticks).await {
                            debug!(task = name, ticks, "repeating task finished");
                            break;
                        }
                    }
                    _ = token.cancelled() => {
                        debug!(task = name, ticks, "repeating task cancelled");
                        break;
                    }
                }
            }
        });
        Self {
            cancel_token,
            handle,
        }
    }

    /// Cooperative: a run already in progress completes first.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancels and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
