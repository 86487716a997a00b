//! Task pipeline
//!
//! Change notifications become [`Task`]s on a FIFO [`TaskManager`] queue.
//! Draining is explicit and runs each task through a caller-supplied
//! [`TaskRunner`]; one task failing never stops the rest.

mod manager;

pub use manager::{DrainReport, StepOutcome, TaskManager, TaskRunner};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of observed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Created => "created",
            TaskKind::Changed => "changed",
            TaskKind::Deleted => "deleted",
            TaskKind::Renamed => "renamed",
        };
        f.write_str(name)
    }
}

/// One observed filesystem change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: TaskKind,
    /// Affected path; the new path for renames
    pub path: String,
    /// Previous path, only for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
}

impl Task {
    pub fn created(path: impl Into<String>) -> Self {
        Self::simple(TaskKind::Created, path)
    }

    pub fn changed(path: impl Into<String>) -> Self {
        Self::simple(TaskKind::Changed, path)
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self::simple(TaskKind::Deleted, path)
    }

    pub fn renamed(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Task {
            kind: TaskKind::Renamed,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }

    fn simple(kind: TaskKind, path: impl Into<String>) -> Self {
        Task {
            kind,
            path: path.into(),
            old_path: None,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old_path {
            Some(old) => write!(f, "{} {} -> {}", self.kind, old, self.path),
            None => write!(f, "{} {}", self.kind, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Task::created("/a.txt").to_string(), "created /a.txt");
        assert_eq!(
            Task::renamed("/a.txt", "/b.txt").to_string(),
            "renamed /a.txt -> /b.txt"
        );
    }

    #[test]
    fn test_serialized_form() {
        let json = serde_json::to_string(&Task::deleted("/x")).unwrap();
        assert_eq!(json, r#"{"kind":"deleted","path":"/x"}"#);
    }
}
