use std::{fmt, time::Duration};

use futures::future::BoxFuture;

/// Deferred execution capability used for retries, dependency re-checks and
/// health checks.
///
/// Tasks are fire-and-forget; there is no cancellation. Callers guard their
/// task bodies against state that changed in the meantime.
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule_after(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Runs tasks on the ambient tokio runtime after a `tokio::time::sleep`.
///
/// Under a paused test runtime the sleep is driven by tokio's virtual clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unit_tokio_scheduler_runs_after_delay() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        TokioScheduler.schedule_after(
            Duration::from_secs(2),
            Box::pin(async move { flag.store(true, Ordering::SeqCst) }),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
