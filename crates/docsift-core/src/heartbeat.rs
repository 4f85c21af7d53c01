use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{JobId, ProgressEvent};

/// Periodic "still working" events for a job in execution.
///
/// The ticker runs until the `Heartbeat` is dropped.
pub struct Heartbeat {
    _guard: DropGuard,
}

impl Heartbeat {
    pub fn start(
        job: JobId,
        every: Duration,
        progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
    ) -> Self {
        let token = CancellationToken::new();
        let stop = token.clone();
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval_at(started + every, every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let elapsed = started.elapsed();
                        tracing::debug!(job = %job, elapsed_secs = elapsed.as_secs(), "heartbeat");
                        progress(ProgressEvent::Heartbeat {
                            job: job.clone(),
                            elapsed,
                        });
                    }
                }
            }
        });
        Self {
            _guard: token.drop_guard(),
        }
    }
}
