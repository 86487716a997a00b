//! Change notifications from the source tree

use crate::task::Task;
use crate::vfs::LocalFileSystem;
use notify::event::{ModifyKind, RenameMode};
use notify::EventKind;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long a tracked rename source waits for its destination half before
/// it is treated as a move out of the tree
pub const MOVE_PAIR_WINDOW: Duration = Duration::from_millis(250);

/// Structured change observed under the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl ChangeEvent {
    /// Translate a single raw notify event, without pairing.
    ///
    /// A paired rename becomes `Renamed`. A lone rename source is a
    /// deletion and a lone rename target a creation (a move out of or into
    /// the watched tree). Renames of unknown direction are resolved by
    /// checking whether the path still exists. Access notifications carry
    /// no change.
    pub fn from_notify(event: &notify::Event) -> Vec<ChangeEvent> {
        let each = |make: fn(PathBuf) -> ChangeEvent| -> Vec<ChangeEvent> {
            event.paths.iter().cloned().map(make).collect()
        };

        match event.kind {
            EventKind::Create(_) => each(ChangeEvent::Created),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match &event.paths[..] {
                [from, to] => vec![ChangeEvent::Renamed {
                    from: from.clone(),
                    to: to.clone(),
                }],
                _ => Vec::new(),
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeEvent::Deleted),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeEvent::Created),
            EventKind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .map(|path| {
                    if exists(path) {
                        ChangeEvent::Created(path.clone())
                    } else {
                        ChangeEvent::Deleted(path.clone())
                    }
                })
                .collect(),
            EventKind::Modify(_) | EventKind::Any => each(ChangeEvent::Changed),
            EventKind::Remove(_) => each(ChangeEvent::Deleted),
            EventKind::Access(_) | EventKind::Other => Vec::new(),
        }
    }

    /// Task for this change, with paths made logical relative to `source`.
    ///
    /// Changes entirely outside the source root yield `None`. A rename across
    /// the root boundary becomes a creation or a deletion.
    pub fn to_task(&self, source: &LocalFileSystem) -> Option<Task> {
        match self {
            ChangeEvent::Created(path) => source.logical_path_of(path).map(Task::created),
            ChangeEvent::Changed(path) => source.logical_path_of(path).map(Task::changed),
            ChangeEvent::Deleted(path) => source.logical_path_of(path).map(Task::deleted),
            ChangeEvent::Renamed { from, to } => {
                match (source.logical_path_of(from), source.logical_path_of(to)) {
                    (Some(old), Some(new)) => Some(Task::renamed(old, new)),
                    (None, Some(new)) => Some(Task::created(new)),
                    (Some(old), None) => Some(Task::deleted(old)),
                    (None, None) => None,
                }
            }
        }
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Rename source waiting for its destination half
#[derive(Debug)]
struct PendingMove {
    path: PathBuf,
    seen: Instant,
}

/// Pairs the halves of tracked renames.
///
/// Backends that tag rename halves with a tracker report the source half,
/// then the destination half, then a combined event. Within the tree only
/// the combined event should count. A source half that never meets its
/// destination is a move out of the tree and a destination half without a
/// known source is a move in.
#[derive(Debug, Default)]
pub struct MoveMatcher {
    pending: HashMap<usize, PendingMove>,
}

impl MoveMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate a raw event, holding back tracked rename halves
    pub fn translate(&mut self, event: &notify::Event) -> Vec<ChangeEvent> {
        let tracker = event.tracker();

        match (&event.kind, tracker) {
            (EventKind::Modify(ModifyKind::Name(RenameMode::From)), Some(tracker)) => {
                if let Some(path) = event.paths.first() {
                    self.pending.insert(
                        tracker,
                        PendingMove {
                            path: path.clone(),
                            seen: Instant::now(),
                        },
                    );
                }
                Vec::new()
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::To)), Some(tracker))
                if self.pending.contains_key(&tracker) =>
            {
                // The combined event follows
                Vec::new()
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), Some(tracker)) => {
                self.pending.remove(&tracker);
                ChangeEvent::from_notify(event)
            }
            _ => ChangeEvent::from_notify(event),
        }
    }

    /// Give up on source halves older than `window`, reporting them as
    /// deletions
    pub fn expire(&mut self, window: Duration) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let stale: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.seen) >= window)
            .map(|(tracker, _)| *tracker)
            .collect();

        let mut moves: Vec<PendingMove> = stale
            .iter()
            .filter_map(|tracker| self.pending.remove(tracker))
            .collect();
        moves.sort_by_key(|pending| pending.seen);
        moves
            .into_iter()
            .map(|pending| ChangeEvent::Deleted(pending.path))
            .collect()
    }

    /// Report every waiting source half as a deletion
    pub fn flush(&mut self) -> Vec<ChangeEvent> {
        self.expire(Duration::ZERO)
    }

    /// Number of source halves still waiting for a partner
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
