//! Periodic background tasks with cancellable handles.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Handle to a spawned background task; aborts the task when dropped
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    /// Task name used in logs
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the task
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the task has stopped
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run `tick` every `period` until the handle is aborted.
///
/// The first tick fires immediately. A slow tick delays the following ones
/// instead of bursting to catch up.
pub fn spawn_periodic<F>(name: &'static str, period: Duration, mut tick: F) -> TaskHandle
where
    F: FnMut() -> BoxFuture<'static, ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::debug!("Periodic task '{}' started ({:?})", name, period);

        loop {
            timer.tick().await;
            tick().await;
        }
    });

    TaskHandle { name, handle }
}

/// Spawn a long-running task under a name
pub fn spawn_named<F>(name: &'static str, future: F) -> TaskHandle
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    TaskHandle {
        name,
        handle: tokio::spawn(future),
    }
}

/// Owned set of background tasks stopped together
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: Vec<TaskHandle>,
}

impl TaskSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a task
    pub fn push(&mut self, task: TaskHandle) {
        self.tasks.push(task);
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is tracked
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Abort every task and forget them
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            log::debug!("Stopping task '{}'", task.name());
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_ticks_and_abort() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ticks = counter.clone();
        let handle = spawn_periodic("counter", Duration::from_millis(100), move || {
            let ticks = ticks.clone();
            async move {
                ticks.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let seen = counter.load(Ordering::SeqCst);
        assert!((3..=4).contains(&seen), "saw {seen} ticks");

        handle.abort();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_task_set_shutdown() {
        let mut set = TaskSet::new();
        set.push(spawn_named("idle", futures::future::pending()));
        assert_eq!(set.len(), 1);

        set.shutdown();
        assert!(set.is_empty());
    }
}
