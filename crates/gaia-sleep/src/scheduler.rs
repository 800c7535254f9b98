//! SleepTaskScheduler (C7): selects and executes background tasks while the
//! owning cognition service is ASLEEP.
//!
//! `next_task` picks the highest-priority task whose `last_run` is oldest,
//! never-run tasks winning ties. Task bodies are a small enum of named
//! actions dispatched through a registered [`TaskAction`] rather than a
//! closure per task, so new kinds register without touching selection
//! logic. The scheduler records the running task as "current" so the
//! sleep manager's wake signal can read its interruptibility.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SessionCuration,
    ThoughtSeedReview,
    VectorReflection,
    AdapterTraining,
}

#[derive(Debug, Clone)]
pub struct SleepTask {
    pub id: String,
    pub kind: TaskKind,
    pub priority: i32,
    pub interruptible: bool,
    pub estimated_duration: Duration,
    pub last_run: Option<DateTime<Utc>>,
}

impl SleepTask {
    pub fn new(id: impl Into<String>, kind: TaskKind, priority: i32, interruptible: bool, estimated_duration: Duration) -> Self {
        Self {
            id: id.into(),
            kind,
            priority,
            interruptible,
            estimated_duration,
            last_run: None,
        }
    }
}

/// The three short, interruptible maintenance tasks that run whenever the
/// device is free, plus the long non-interruptible adapter training task
/// that is only ever scheduled while the device is reserved to the
/// training worker (coordinated externally by `GpuHandoffCoordinator`).
pub fn default_maintenance_tasks() -> Vec<SleepTask> {
    vec![
        SleepTask::new("session-curation", TaskKind::SessionCuration, 10, true, Duration::from_secs(30)),
        SleepTask::new("thought-seed-review", TaskKind::ThoughtSeedReview, 5, true, Duration::from_secs(60)),
        SleepTask::new("vector-reflection", TaskKind::VectorReflection, 1, true, Duration::from_secs(120)),
    ]
}

pub fn adapter_training_task() -> SleepTask {
    SleepTask::new("adapter-training", TaskKind::AdapterTraining, 0, false, Duration::from_secs(3600))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Skipped,
}

/// One named action a `SleepTask` can run. Implementations poll
/// `cancel_requested` between cooperative points and return early with
/// `TaskOutcome::Cancelled` when it is set — the scheduler never yanks a
/// task out from under it.
#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn run(&self, cancel_requested: &AtomicBool) -> TaskOutcome;
}

/// A no-op action used for task kinds that have not been wired to a real
/// implementation yet; completes immediately.
pub struct NoopAction;

#[async_trait]
impl TaskAction for NoopAction {
    async fn run(&self, _cancel_requested: &AtomicBool) -> TaskOutcome {
        TaskOutcome::Completed
    }
}

pub struct SleepTaskScheduler {
    tasks: Mutex<Vec<SleepTask>>,
    actions: HashMap<TaskKind, Arc<dyn TaskAction>>,
    current: Mutex<Option<SleepTask>>,
    cancel_requested: Arc<AtomicBool>,
}

impl SleepTaskScheduler {
    pub fn new(tasks: Vec<SleepTask>, actions: HashMap<TaskKind, Arc<dyn TaskAction>>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            actions,
            current: Mutex::new(None),
            cancel_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Highest-priority task whose `last_run` is oldest; never-run tasks
    /// are treated as infinitely old and so win any tie against a task
    /// that has run before.
    pub fn next_task(&self) -> Option<SleepTask> {
        self.tasks
            .lock()
            .iter()
            .max_by(|a, b| {
                a.priority.cmp(&b.priority).then_with(|| match (a.last_run, b.last_run) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (Some(a), Some(b)) => b.cmp(&a),
                })
            })
            .cloned()
    }

    pub fn current_task(&self) -> Option<SleepTask> {
        self.current.lock().clone()
    }

    /// `None` when nothing is currently running — the sleep manager treats
    /// that the same as an interruptible task for the purposes of the
    /// `_WAKING` vs `_FINISHING_TASK` decision.
    pub fn current_interruptible(&self) -> Option<bool> {
        self.current.lock().as_ref().map(|t| t.interruptible)
    }

    /// Sets the cooperative cancellation flag; a running interruptible
    /// task observes it at its next cooperative point and aborts.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    /// Runs `task`'s registered action to completion, recording it as
    /// "current" for the duration and stamping `last_run` on exit
    /// regardless of outcome.
    pub async fn execute(&self, task: SleepTask) -> TaskOutcome {
        self.cancel_requested.store(false, Ordering::SeqCst);
        *self.current.lock() = Some(task.clone());

        let outcome = match self.actions.get(&task.kind) {
            Some(action) => action.run(&self.cancel_requested).await,
            None => TaskOutcome::Skipped,
        };

        {
            let mut tasks = self.tasks.lock();
            if let Some(t) = tasks.iter_mut().find(|t| t.id == task.id) {
                t.last_run = Some(Utc::now());
            }
        }
        *self.current.lock() = None;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(tasks: Vec<SleepTask>) -> SleepTaskScheduler {
        let mut actions: HashMap<TaskKind, Arc<dyn TaskAction>> = HashMap::new();
        actions.insert(TaskKind::SessionCuration, Arc::new(NoopAction));
        actions.insert(TaskKind::ThoughtSeedReview, Arc::new(NoopAction));
        actions.insert(TaskKind::VectorReflection, Arc::new(NoopAction));
        SleepTaskScheduler::new(tasks, actions)
    }

    #[test]
    fn never_run_tasks_beat_previously_run_ones_at_equal_priority() {
        let mut tasks = default_maintenance_tasks();
        tasks[1].priority = tasks[0].priority; // tie session-curation and thought-seed-review
        tasks[0].last_run = Some(Utc::now());
        let sched = scheduler(tasks);
        let next = sched.next_task().unwrap();
        assert_eq!(next.id, "thought-seed-review");
    }

    #[test]
    fn highest_priority_wins_regardless_of_last_run() {
        let sched = scheduler(default_maintenance_tasks());
        let next = sched.next_task().unwrap();
        assert_eq!(next.id, "session-curation");
    }

    #[tokio::test]
    async fn execute_stamps_last_run_and_clears_current() {
        let sched = scheduler(default_maintenance_tasks());
        let task = sched.next_task().unwrap();
        assert!(sched.current_task().is_none());
        let outcome = sched.execute(task.clone()).await;
        assert_eq!(outcome, TaskOutcome::Completed);
        assert!(sched.current_task().is_none());

        let refreshed = sched.next_task().unwrap();
        assert_ne!(refreshed.id, task.id, "just-run task should no longer sort first");
    }

    #[tokio::test]
    async fn current_interruptible_reflects_registered_task_shape() {
        let sched = scheduler(vec![adapter_training_task()]);
        assert!(sched.current_interruptible().is_none());

        struct Slow;
        #[async_trait]
        impl TaskAction for Slow {
            async fn run(&self, cancel_requested: &AtomicBool) -> TaskOutcome {
                while !cancel_requested.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                TaskOutcome::Cancelled
            }
        }
        let mut actions: HashMap<TaskKind, Arc<dyn TaskAction>> = HashMap::new();
        actions.insert(TaskKind::AdapterTraining, Arc::new(Slow));
        let sched = Arc::new(SleepTaskScheduler::new(vec![adapter_training_task()], actions));

        let running = sched.clone();
        let handle = tokio::spawn(async move { running.execute(adapter_training_task()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.current_interruptible(), Some(false));
        sched.request_cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, TaskOutcome::Cancelled);
    }
}
