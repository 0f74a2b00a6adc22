// packages/engine/src/lifecycle/scheduler.rs
//! Cancellable background tasks keyed by instance id
//!
//! Heartbeats and auto-checkpoints are registered per instance and cancelled
//! when the instance reaches a terminal state. Fleet-wide loops (idle sweep,
//! warm pool replenishment) are registered as global tasks and only stop on
//! shutdown.
//!
//! Cancellation is cooperative: every task receives a [`CancellationToken`]
//! and is expected to leave its loop when the token fires. Handles are never
//! aborted, since a task may itself be the one cancelling its instance.

use crate::utils::ids::InstanceId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
struct ScheduledTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of running background tasks
#[derive(Debug)]
pub struct TaskRegistry {
    root: CancellationToken,
    per_instance: DashMap<InstanceId, Vec<ScheduledTask>>,
    global: Mutex<Vec<ScheduledTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            per_instance: DashMap::new(),
            global: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task owned by one instance
    pub fn spawn_for<F, Fut>(&self, instance_id: &InstanceId, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            warn!(instance_id = %instance_id, task = name, "Scheduler is shut down, task not started");
            return;
        }
        let token = self.root.child_token();
        let handle = tokio::spawn(task(token.clone()));
        debug!(instance_id = %instance_id, task = name, "Scheduled task");
        self.per_instance
            .entry(instance_id.clone())
            .or_default()
            .push(ScheduledTask { name, token, handle });
    }

    /// Spawn a task that lives until shutdown
    pub fn spawn_global<F, Fut>(&self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return;
        }
        let token = self.root.child_token();
        let handle = tokio::spawn(task(token.clone()));
        debug!(task = name, "Scheduled global task");
        self.global.lock().push(ScheduledTask { name, token, handle });
    }

    /// Cancel every task of an instance, returning how many were signalled
    pub fn cancel_instance(&self, instance_id: &InstanceId) -> usize {
        match self.per_instance.remove(instance_id) {
            Some((_, tasks)) => {
                for task in &tasks {
                    debug!(instance_id = %instance_id, task = task.name, "Cancelling task");
                    task.token.cancel();
                }
                tasks.len()
            }
            None => 0,
        }
    }

    /// Number of live tasks registered for an instance
    pub fn task_count(&self, instance_id: &InstanceId) -> usize {
        self.per_instance
            .get(instance_id)
            .map(|tasks| tasks.iter().filter(|t| !t.handle.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn task_names(&self, instance_id: &InstanceId) -> Vec<&'static str> {
        self.per_instance
            .get(instance_id)
            .map(|tasks| tasks.iter().map(|t| t.name).collect())
            .unwrap_or_default()
    }

    pub fn global_count(&self) -> usize {
        self.global
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel everything and wait for the tasks to leave their loops
    pub async fn shutdown(&self) {
        self.root.cancel();

        let mut handles: Vec<ScheduledTask> = self.global.lock().drain(..).collect();
        let ids: Vec<InstanceId> = self.per_instance.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tasks)) = self.per_instance.remove(&id) {
                handles.extend(tasks);
            }
        }

        for task in handles {
            if let Err(e) = task.handle.await {
                warn!(task = task.name, "Background task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskRegistry {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn ticker(counter: Arc<AtomicU32>) -> impl FnOnce(CancellationToken) -> futures::future::BoxFuture<'static, ()> {
        move |token| {
            Box::pin(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = interval.tick() => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_instance_stops_its_tasks_only() {
        let registry = TaskRegistry::new();
        let a = InstanceId::new("inst_a");
        let b = InstanceId::new("inst_b");
        let count_a = Arc::new(AtomicU32::new(0));
        let count_b = Arc::new(AtomicU32::new(0));

        registry.spawn_for(&a, "heartbeat", ticker(count_a.clone()));
        registry.spawn_for(&b, "heartbeat", ticker(count_b.clone()));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(registry.cancel_instance(&a), 1);
        assert_eq!(registry.task_count(&a), 0);
        let frozen = count_a.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count_a.load(Ordering::SeqCst), frozen);
        assert!(count_b.load(Ordering::SeqCst) > frozen);
        assert_eq!(registry.task_names(&b), vec!["heartbeat"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_every_task() {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        registry.spawn_global("sweep", ticker(counter.clone()));
        registry.spawn_for(&InstanceId::new("inst_a"), "heartbeat", ticker(counter));
        assert_eq!(registry.global_count(), 1);

        registry.shutdown().await;
        assert!(registry.is_shut_down());
        assert_eq!(registry.global_count(), 0);

        // nothing new starts after shutdown
        registry.spawn_global("late", |_| async {});
        assert_eq!(registry.global_count(), 0);
    }
}
