//! Progress tracking for multi-step tasks
//!
//! Each key (a domain) has at most one running task. A task is driven through
//! a [`TaskGuard`]; finishing it, or dropping the guard, releases the key.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use colored::Colorize;
use tracing::{info, warn};

use crate::errors::ManagerError;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Receives progress events for rendering
pub trait ProgressSink: Send + Sync {
    fn started(&self, key: &str, description: &str, total: usize);

    fn advanced(&self, key: &str, position: usize, total: usize, description: Option<&str>);

    fn finished(&self, key: &str, state: TaskState, message: Option<&str>);
}

/// Emits progress as tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn started(&self, key: &str, description: &str, total: usize) {
        info!(task = key, total, "{}", description);
    }

    fn advanced(&self, key: &str, position: usize, total: usize, description: Option<&str>) {
        if let Some(description) = description {
            info!(task = key, "[{}/{}] {}", position + 1, total, description);
        }
    }

    fn finished(&self, key: &str, state: TaskState, message: Option<&str>) {
        match state {
            TaskState::Completed => info!(task = key, "Task completed"),
            _ => warn!(task = key, "Task {}: {}", state, message.unwrap_or("")),
        }
    }
}

/// Prints colored step lines to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn started(&self, _key: &str, description: &str, _total: usize) {
        eprintln!("{} {}", "==>".cyan().bold(), description.bold());
    }

    fn advanced(&self, _key: &str, position: usize, total: usize, description: Option<&str>) {
        if let Some(description) = description {
            let counter = format!("[{}/{}]", position + 1, total);
            eprintln!("  {} {}", counter.dimmed(), description);
        }
    }

    fn finished(&self, _key: &str, state: TaskState, message: Option<&str>) {
        let message = message.unwrap_or("");
        match state {
            TaskState::Completed => eprintln!("{} {}", "done".green().bold(), message),
            TaskState::Cancelled => eprintln!("{} {}", "cancelled".yellow().bold(), message),
            _ => eprintln!("{} {}", "failed".red().bold(), message),
        }
    }
}

struct ActiveTask {
    description: String,
    total: usize,
    position: usize,
    started: Instant,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveTask>,
    outcomes: HashMap<String, TaskState>,
    cleanups: usize,
}

/// Registry of running tasks
#[derive(Clone)]
pub struct Progress {
    registry: Arc<Mutex<Registry>>,
    sink: Arc<dyn ProgressSink>,
}

impl Progress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            sink,
        }
    }

    /// Start a task under `key`. Starting a second task on an active key is a
    /// programming error and fails immediately.
    pub fn begin(
        &self,
        key: &str,
        description: impl Into<String>,
        total: usize,
    ) -> Result<TaskGuard, ManagerError> {
        let description = description.into();
        {
            let mut registry = self.lock();
            if registry.active.contains_key(key) {
                return Err(ManagerError::ProgressError(format!(
                    "a task is already running for {}",
                    key
                )));
            }
            registry.active.insert(
                key.to_string(),
                ActiveTask {
                    description: description.clone(),
                    total,
                    position: 0,
                    started: Instant::now(),
                },
            );
        }
        self.sink.started(key, &description, total);

        Ok(TaskGuard {
            progress: self.clone(),
            key: key.to_string(),
            finished: false,
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn has_active_task(&self) -> bool {
        self.active_count() > 0
    }

    /// How many tasks have been cleaned up
    pub fn cleanup_count(&self) -> usize {
        self.lock().cleanups
    }

    /// `Running` while a task is active, else the outcome of the last one
    pub fn state(&self, key: &str) -> TaskState {
        let registry = self.lock();
        if registry.active.contains_key(key) {
            return TaskState::Running;
        }
        registry.outcomes.get(key).copied().unwrap_or(TaskState::Idle)
    }

    /// Description and position of an active task
    pub fn position(&self, key: &str) -> Option<(String, usize, usize)> {
        self.lock()
            .active
            .get(key)
            .map(|task| (task.description.clone(), task.position, task.total))
    }

    fn advance(&self, key: &str, advance: usize, description: Option<&str>) {
        let update = {
            let mut registry = self.lock();
            registry.active.get_mut(key).map(|task| {
                task.position = (task.position + advance).min(task.total);
                if let Some(description) = description {
                    task.description = description.to_string();
                }
                (task.position, task.total)
            })
        };
        if let Some((position, total)) = update {
            self.sink.advanced(key, position, total, description);
        }
    }

    fn cleanup(&self, key: &str, state: TaskState, message: Option<&str>) {
        let elapsed = {
            let mut registry = self.lock();
            let task = registry.active.remove(key);
            registry.outcomes.insert(key.to_string(), state);
            registry.cleanups += 1;
            task.map(|t| t.started.elapsed())
        };
        if let Some(elapsed) = elapsed {
            tracing::debug!("Task {} ended {} after {:?}", key, state, elapsed);
        }
        self.sink.finished(key, state, message);
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Recover from poisoning; the registry holds no partial updates
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

/// Handle of one running task.
///
/// Ends through [`complete`](Self::complete), [`fail`](Self::fail) or
/// [`cancel`](Self::cancel); a guard dropped without either ends `Failed`.
/// Cleanup runs exactly once either way.
pub struct TaskGuard {
    progress: Progress,
    key: String,
    finished: bool,
}

impl TaskGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn update(&self, advance: usize, description: Option<&str>) {
        self.progress.advance(&self.key, advance, description);
    }

    pub fn complete(mut self, message: Option<&str>) {
        self.finish(TaskState::Completed, message);
    }

    pub fn fail(mut self, message: &str) {
        self.finish(TaskState::Failed, Some(message));
    }

    pub fn cancel(mut self, message: &str) {
        self.finish(TaskState::Cancelled, Some(message));
    }

    fn finish(&mut self, state: TaskState, message: Option<&str>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.progress.cleanup(&self.key, state, message);
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.finish(TaskState::Failed, Some("task abandoned"));
    }
}
