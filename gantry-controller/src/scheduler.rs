//! Periodic jobs with a runtime budget, and a bounded executor for ad hoc work.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::controller_metrics::{EXECUTOR_REJECTIONS_TOTAL, STUCK_TASKS_CANCELLED_TOTAL};
use crate::errors::{GantryError, Result};

/// A job run on a fixed period. Each run is cancelled if it exceeds `max_runtime`,
/// so a wedged run cannot hold back later ticks.
pub struct PeriodicTask {
    name: String,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Starts the job. When `trigger` is given, a notification runs the job early.
    pub fn spawn<F>(
        name: impl Into<String>,
        period: Duration,
        max_runtime: Duration,
        trigger: Option<Arc<Notify>>,
        job: F,
    ) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                match &trigger {
                    Some(trigger) => {
                        tokio::select! {
                            _ = interval.tick() => {}
                            _ = trigger.notified() => {
                                debug!(task = %task_name, "periodic task triggered early");
                            }
                        }
                    }
                    None => {
                        interval.tick().await;
                    }
                }

                if tokio::time::timeout(max_runtime, job()).await.is_err() {
                    metrics::counter!(STUCK_TASKS_CANCELLED_TOTAL.name, "task" => task_name.clone()).increment(1);
                    warn!(
                        task = %task_name,
                        max_runtime_ms = max_runtime.as_millis() as u64,
                        "periodic task overran its budget and was cancelled"
                    );
                }
            }
        });
        PeriodicTask { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Async executor with a fixed number of permits. Submissions beyond capacity are
/// rejected rather than queued.
pub struct TaskExecutor {
    name: String,
    permits: Arc<Semaphore>,
}

impl TaskExecutor {
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        TaskExecutor {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn submit<F, T>(&self, task: F) -> Result<JoinHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!(EXECUTOR_REJECTIONS_TOTAL.name, "executor" => self.name.clone()).increment(1);
                error!(
                    executor = %self.name,
                    alarm = "executor_rejected",
                    "executor saturated, task rejected"
                );
                return Err(GantryError::ExecutorRejected(self.name.clone()));
            }
        };
        Ok(tokio::spawn(async move {
            let output = task.await;
            drop(permit);
            output
        }))
    }
}
