//! FIFO task queue with isolated, sequential draining

use super::{Task, TaskKind};
use crate::error::{Error, Result};
use crate::events::ErrorChannel;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Executes dequeued tasks
pub trait TaskRunner {
    fn run(&mut self, task: &Task) -> Result<()>;
}

impl<F> TaskRunner for F
where
    F: FnMut(&Task) -> Result<()>,
{
    fn run(&mut self, task: &Task) -> Result<()> {
        self(task)
    }
}

/// Result of a single drain step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A task ran to completion
    Succeeded,
    /// A task ran and failed; the failure was reported
    Failed,
    /// The queue was already empty
    Empty,
}

/// Totals of one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Strictly FIFO queue of tasks
pub struct TaskManager {
    /// Pending tasks, head first
    queue: Mutex<VecDeque<Task>>,
    /// Set while a drain is in progress
    draining: AtomicBool,
    /// Where task failures are reported
    errors: ErrorChannel,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::with_errors(ErrorChannel::new())
    }

    /// Create a manager that reports task failures into `errors`
    pub fn with_errors(errors: ErrorChannel) -> Self {
        TaskManager {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            errors,
        }
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    /// Append a task to the tail of the queue
    pub fn enqueue(&self, task: Task) -> Result<()> {
        if task.path.trim().is_empty() {
            return Err(Error::InvalidTask(format!("{} task without a path", task.kind)));
        }
        if task.kind == TaskKind::Renamed
            && task.old_path.as_deref().map_or(true, |p| p.trim().is_empty())
        {
            return Err(Error::InvalidTask(format!(
                "rename to {} without a previous path",
                task.path
            )));
        }

        debug!("Queued task: {}", task);
        self.queue.lock().push_back(task);
        Ok(())
    }

    /// Pop the head task and run it.
    ///
    /// The queue lock is not held while the task runs, so notifications can
    /// keep enqueueing.
    pub fn next<R: TaskRunner + ?Sized>(&self, runner: &mut R) -> StepOutcome {
        let Some(task) = self.queue.lock().pop_front() else {
            return StepOutcome::Empty;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&task)));
        let error = match result {
            Ok(Ok(())) => {
                debug!("Task done: {}", task);
                return StepOutcome::Succeeded;
            }
            Ok(Err(e)) => Error::TaskFailed {
                task: task.to_string(),
                reason: e.to_string(),
            },
            Err(_) => Error::TaskPanicked(task.to_string()),
        };

        self.errors.report(&error);
        StepOutcome::Failed
    }

    /// Run queued tasks until the queue is empty.
    ///
    /// Tasks enqueued during the drain are run as well. Only one drain may
    /// run at a time.
    pub fn drain<R: TaskRunner + ?Sized>(&self, runner: &mut R) -> Result<DrainReport> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::DrainInProgress);
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        loop {
            match self.next(runner) {
                StepOutcome::Succeeded => report.succeeded += 1,
                StepOutcome::Failed => report.failed += 1,
                StepOutcome::Empty => break,
            }
        }

        if report.executed() > 0 {
            info!(
                "Drained {} tasks ({} failed)",
                report.executed(),
                report.failed
            );
        }
        Ok(report)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drop all pending tasks, returning how many were discarded
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Copy of the pending tasks, head first
    pub fn pending(&self) -> Vec<Task> {
        self.queue.lock().iter().cloned().collect()
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("pending", &self.len())
            .field("draining", &self.is_draining())
            .finish()
    }
}

/// Clears the draining flag on every exit path
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(log: &mut Vec<String>) -> impl FnMut(&Task) -> Result<()> + '_ {
        move |task: &Task| {
            log.push(task.path.clone());
            Ok(())
        }
    }

    #[test]
    fn test_fifo_order() {
        let manager = TaskManager::new();
        manager.enqueue(Task::created("/t1")).unwrap();
        manager.enqueue(Task::changed("/t2")).unwrap();
        manager.enqueue(Task::deleted("/t3")).unwrap();

        let mut log = Vec::new();
        let report = manager.drain(&mut record(&mut log)).unwrap();

        assert_eq!(log, vec!["/t1", "/t2", "/t3"]);
        assert_eq!(report, DrainReport { succeeded: 3, failed: 0 });
        assert!(manager.is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_drain() {
        let errors = ErrorChannel::new();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        errors.subscribe(move |e| sink.lock().push(e.to_string()));

        let manager = TaskManager::with_errors(errors);
        for path in ["/t1", "/t2", "/t3"] {
            manager.enqueue(Task::changed(path)).unwrap();
        }

        let mut ran = Vec::new();
        let report = manager
            .drain(&mut |task: &Task| -> Result<()> {
                ran.push(task.path.clone());
                if task.path == "/t2" {
                    return Err(Error::Internal("boom".to_string()));
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(ran, vec!["/t1", "/t2", "/t3"]);
        assert_eq!(report, DrainReport { succeeded: 2, failed: 1 });
        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("/t2"));
    }

    #[test]
    fn test_panicking_task_is_isolated() {
        let manager = TaskManager::new();
        manager.enqueue(Task::created("/bad")).unwrap();
        manager.enqueue(Task::created("/good")).unwrap();

        let mut ran = Vec::new();
        let report = manager
            .drain(&mut |task: &Task| -> Result<()> {
                if task.path == "/bad" {
                    panic!("runner exploded");
                }
                ran.push(task.path.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(ran, vec!["/good"]);
        assert_eq!(report.failed, 1);
        assert!(!manager.is_draining());
    }

    #[test]
    fn test_step_outcomes() {
        let manager = TaskManager::new();
        let mut ok = |_: &Task| -> Result<()> { Ok(()) };
        assert_eq!(manager.next(&mut ok), StepOutcome::Empty);

        manager.enqueue(Task::created("/a")).unwrap();
        assert_eq!(manager.next(&mut ok), StepOutcome::Succeeded);

        manager.enqueue(Task::created("/b")).unwrap();
        let mut failing = |_: &Task| -> Result<()> { Err(Error::Internal("no".into())) };
        assert_eq!(manager.next(&mut failing), StepOutcome::Failed);
        assert_eq!(manager.next(&mut failing), StepOutcome::Empty);
    }

    #[test]
    fn test_invalid_tasks_rejected() {
        let manager = TaskManager::new();
        assert!(manager.enqueue(Task::created("")).unwrap_err().is_validation());

        let rename = Task {
            kind: TaskKind::Renamed,
            path: "/new".to_string(),
            old_path: None,
        };
        assert!(manager.enqueue(rename).unwrap_err().is_validation());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_reentrant_drain_rejected() {
        let manager = Arc::new(TaskManager::new());
        manager.enqueue(Task::created("/outer")).unwrap();

        let inner = Arc::clone(&manager);
        let mut nested = None;
        manager
            .drain(&mut |_: &Task| -> Result<()> {
                let mut noop = |_: &Task| -> Result<()> { Ok(()) };
                nested = Some(inner.drain(&mut noop));
                Ok(())
            })
            .unwrap();

        assert!(matches!(nested, Some(Err(Error::DrainInProgress))));
        // The guard is released once the outer drain returns
        let mut noop = |_: &Task| -> Result<()> { Ok(()) };
        assert!(manager.drain(&mut noop).is_ok());
    }

    #[test]
    fn test_tasks_enqueued_during_drain_run() {
        let manager = Arc::new(TaskManager::new());
        manager.enqueue(Task::created("/first")).unwrap();

        let producer = Arc::clone(&manager);
        let mut ran = Vec::new();
        manager
            .drain(&mut |task: &Task| -> Result<()> {
                if task.path == "/first" {
                    producer.enqueue(Task::created("/second"))?;
                }
                ran.push(task.path.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(ran, vec!["/first", "/second"]);
    }

    #[test]
    fn test_clear() {
        let manager = TaskManager::new();
        manager.enqueue(Task::created("/a")).unwrap();
        manager.enqueue(Task::renamed("/a", "/b")).unwrap();

        assert_eq!(manager.len(), 2);
        assert_eq!(manager.pending()[1].old_path.as_deref(), Some("/a"));
        assert_eq!(manager.clear(), 2);
        assert!(manager.is_empty());
    }
}
