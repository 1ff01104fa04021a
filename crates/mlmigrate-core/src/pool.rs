//! Bounded worker pool for child migrations.
//!
//! `submit` waits for a free slot before spawning, so at most `concurrency` tasks
//! exist at once. Results come back only through [`WorkerPool::drain`], which waits for
//! every submitted task and logs progress while it waits. A failing, panicking or aborted
//! task yields a failed outcome for its child and never affects siblings.

use crate::error::{MigrateError, Result};
use crate::snapshot::ChildRecord;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one child task.
#[derive(Debug)]
pub struct TaskOutcome {
    pub child_id: String,
    pub result: Result<ChildRecord>,
}

impl TaskOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct WorkerPool {
    label: String,
    tasks: JoinSet<TaskOutcome>,
    /// Child of every task not yet collected, so an aborted task can still be reported.
    in_flight: HashMap<Id, String>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    progress_interval: Duration,
    submitted: usize,
    completed: usize,
    started: Instant,
}

impl WorkerPool {
    /// Create a pool running at most `concurrency` tasks at once.
    pub fn new(label: impl Into<String>, concurrency: usize, progress_interval: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            label: label.into(),
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            progress_interval: progress_interval.max(MIN_PROGRESS_INTERVAL),
            submitted: 0,
            completed: 0,
            started: Instant::now(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks submitted but not yet collected by a drain.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    /// Spawn a child migration once a slot is free.
    pub async fn submit<F>(&mut self, child_id: impl Into<String>, task: F) -> Result<()>
    where
        F: Future<Output = Result<ChildRecord>> + Send + 'static,
    {
        let child_id = child_id.into();
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::Other(format!("worker pool closed: {}", e)))?;

        self.submitted += 1;
        let tracked = child_id.clone();
        let handle = self.tasks.spawn(async move {
            let result = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(MigrateError::Other(format!(
                    "task panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            drop(permit);
            TaskOutcome { child_id, result }
        });
        self.in_flight.insert(handle.id(), tracked);
        Ok(())
    }

    /// Wait for every submitted task and return their outcomes.
    ///
    /// Waits in bounded slices of the progress interval, logging completed and pending
    /// counts with the overall throughput after each slice that produced no result.
    pub async fn drain(&mut self) -> Vec<TaskOutcome> {
        let batch = self.tasks.len();
        let mut outcomes = Vec::with_capacity(batch);
        if batch == 0 {
            return outcomes;
        }
        debug!(pool = %self.label, batch, "Draining batch");

        while !self.tasks.is_empty() {
            match tokio::time::timeout(self.progress_interval, self.tasks.join_next_with_id()).await {
                Ok(Some(Ok((id, outcome)))) => {
                    self.in_flight.remove(&id);
                    self.completed += 1;
                    outcomes.push(outcome);
                }
                Ok(Some(Err(e))) => {
                    // Panics are caught inside the task; only aborts land here.
                    let child_id = self.in_flight.remove(&e.id()).unwrap_or_default();
                    warn!(pool = %self.label, child = %child_id, "Worker task aborted: {}", e);
                    self.completed += 1;
                    outcomes.push(TaskOutcome {
                        child_id,
                        result: Err(MigrateError::Other(format!("worker task aborted: {}", e))),
                    });
                }
                Ok(None) => break,
                Err(_) => {
                    let elapsed = self.started.elapsed();
                    info!(
                        pool = %self.label,
                        completed = outcomes.len(),
                        pending = self.tasks.len(),
                        rate = format!("{:.2}/s", rate(self.completed, elapsed)),
                        "Waiting for batch to drain"
                    );
                }
            }
        }

        debug!(
            pool = %self.label,
            batch,
            total = self.completed,
            rate = format!("{:.2}/s", rate(self.completed, self.started.elapsed())),
            "Batch drained"
        );
        outcomes
    }
}

fn rate(completed: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        completed as f64 / secs
    } else {
        0.0
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let mut pool = WorkerPool::new("test", 3, Duration::from_secs(1));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            pool.submit(format!("r{}", i), async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(ChildRecord::new(format!("r{}", i), format!("d{}", i)))
            })
            .await
            .unwrap();
            assert!(pool.pending() <= 12);
        }

        let outcomes = pool.drain().await;
        assert_eq!(outcomes.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.completed(), 12);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mut pool = WorkerPool::new("test", 4, Duration::from_secs(1));
        for id in ["r1", "r2", "r3"] {
            pool.submit(id, async move {
                if id == "r2" {
                    Err(MigrateError::not_found("run", id))
                } else {
                    Ok(ChildRecord::new(id, format!("dst-{}", id)))
                }
            })
            .await
            .unwrap();
        }

        let mut outcomes = pool.drain().await;
        outcomes.sort_by(|a, b| a.child_id.cmp(&b.child_id));
        assert!(outcomes[0].is_ok());
        assert!(!outcomes[1].is_ok());
        assert!(outcomes[2].is_ok());
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_outcome() {
        let mut pool = WorkerPool::new("test", 2, Duration::from_secs(1));
        let explode = true;
        pool.submit("boom", async move {
            if explode {
                panic!("bad payload");
            }
            Ok(ChildRecord::new("boom", "d"))
        })
        .await
        .unwrap();
        pool.submit("fine", async { Ok(ChildRecord::new("fine", "d")) })
            .await
            .unwrap();

        let outcomes = pool.drain().await;
        assert_eq!(outcomes.len(), 2);
        let boom = outcomes.iter().find(|o| o.child_id == "boom").unwrap();
        let message = boom.result.as_ref().unwrap_err().to_string();
        assert!(message.contains("bad payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_past_progress_interval() {
        let mut pool = WorkerPool::new("test", 1, Duration::from_secs(1));
        pool.submit("slow", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ChildRecord::new("slow", "d"))
        })
        .await
        .unwrap();

        let outcomes = pool.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_ok());
    }

    #[tokio::test]
    async fn test_aborted_task_is_reported_failed() {
        let mut pool = WorkerPool::new("test", 2, Duration::from_secs(1));
        pool.submit("stuck", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ChildRecord::new("stuck", "d"))
        })
        .await
        .unwrap();
        pool.tasks.abort_all();

        let outcomes = pool.drain().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].child_id, "stuck");
        assert!(!outcomes[0].is_ok());
        assert!(pool.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_empty_drain() {
        let mut pool = WorkerPool::new("test", 2, Duration::from_secs(1));
        assert!(pool.drain().await.is_empty());
    }
}
