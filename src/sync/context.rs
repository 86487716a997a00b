//! Sync context: one source, one destination, one watcher, one queue

use super::watcher::{MoveMatcher, MOVE_PAIR_WINDOW};
use super::ChangeEvent;
use crate::config::Config;
use crate::crypto::{Crypter, CrypterParams};
use crate::error::{Error, Result};
use crate::events::{Events, Lifecycle};
use crate::task::{DrainReport, TaskManager, TaskRunner};
use crate::vfs::{CryptedFileSystem, FileSystem, LocalFileSystem};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Lifecycle state of a sync context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Inner {
    state: ContextState,
    watcher: Option<RecommendedWatcher>,
    /// Rename halves waiting for their partner
    moves: MoveMatcher,
}

/// State reachable from the watcher thread
struct Shared {
    source: LocalFileSystem,
    destination: CryptedFileSystem,
    tasks: TaskManager,
    events: Events,
    /// Guards notification handling and lifecycle transitions
    lock: ReentrantMutex<RefCell<Inner>>,
}

impl Shared {
    fn state(&self) -> ContextState {
        self.lock.lock().borrow().state
    }

    fn set_state(&self, state: ContextState) {
        self.lock.lock().borrow_mut().state = state;
    }

    fn dispatch(&self, event: ChangeEvent) -> Result<bool> {
        let guard = self.lock.lock();
        if guard.borrow().state != ContextState::Running {
            debug!("Ignoring change while not running: {:?}", event);
            return Ok(false);
        }

        match event.to_task(&self.source) {
            Some(task) => {
                self.tasks.enqueue(task)?;
                Ok(true)
            }
            None => {
                debug!("Ignoring change outside the source: {:?}", event);
                Ok(false)
            }
        }
    }

    fn handle_notification(&self, result: notify::Result<notify::Event>) {
        match result {
            Ok(event) => {
                let guard = self.lock.lock();
                let changes = {
                    let mut inner = guard.borrow_mut();
                    if inner.state != ContextState::Running {
                        debug!("Ignoring notification while not running: {:?}", event.kind);
                        return;
                    }
                    let mut changes = inner.moves.expire(MOVE_PAIR_WINDOW);
                    changes.extend(inner.moves.translate(&event));
                    changes
                };
                self.dispatch_all(changes);
            }
            Err(e) => {
                self.events.raise_error(&Error::Watch(e));
            }
        }
    }

    /// Queue deletions for rename sources that found no destination within
    /// `window`
    fn settle_moves(&self, window: Duration) {
        let guard = self.lock.lock();
        let expired = guard.borrow_mut().moves.expire(window);
        self.dispatch_all(expired);
    }

    fn dispatch_all(&self, changes: Vec<ChangeEvent>) {
        for change in changes {
            if let Err(e) = self.dispatch(change) {
                self.events.raise_error(&e);
            }
        }
    }

    /// Detach the watcher without signalling; it is returned so the caller
    /// can drop it after releasing the lock
    fn take_watcher(&self) -> Option<RecommendedWatcher> {
        let guard = self.lock.lock();
        let mut inner = guard.borrow_mut();
        inner.state = ContextState::Idle;
        inner.watcher.take()
    }
}

/// Encrypted mirror of a source tree
pub struct SyncContext {
    shared: Arc<Shared>,
}

impl SyncContext {
    /// Build a context from construction parameters.
    ///
    /// The source must be an existing directory. A missing or empty salt
    /// selects the default salt, missing iterations the default count.
    pub fn create(
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        password: &[u8],
        salt: Option<&[u8]>,
        iterations: Option<u32>,
    ) -> Result<Self> {
        let params = CrypterParams::new(password, salt.filter(|s| !s.is_empty()), iterations)?;

        let source = std::path::absolute(source.as_ref())?;
        match fs::metadata(&source) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => return Err(Error::NotADirectory(source)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::PathNotFound(source))
            }
            Err(e) => return Err(e.into()),
        }

        let events = Events::new();
        let errors = events.errors().clone();
        let source = LocalFileSystem::with_errors(&source, errors.clone())?;
        let destination =
            CryptedFileSystem::with_errors(destination, Crypter::Keyed(params), errors.clone())?;

        info!(
            "Sync context: {:?} -> {:?}",
            source.root_directory(),
            destination.root_directory()
        );

        Ok(SyncContext {
            shared: Arc::new(Shared {
                source,
                destination,
                tasks: TaskManager::with_errors(errors),
                events,
                lock: ReentrantMutex::new(RefCell::new(Inner {
                    state: ContextState::Idle,
                    watcher: None,
                    moves: MoveMatcher::new(),
                })),
            }),
        })
    }

    /// Build a context from a loaded configuration
    pub fn from_config(config: &Config, password: &[u8]) -> Result<Self> {
        Self::create(
            &config.source,
            &config.destination,
            password,
            config.encryption.salt(),
            Some(config.encryption.iterations),
        )
    }

    pub fn source(&self) -> &LocalFileSystem {
        &self.shared.source
    }

    pub fn destination(&self) -> &CryptedFileSystem {
        &self.shared.destination
    }

    /// Crypter protecting the destination indexes
    pub fn crypter(&self) -> &Crypter {
        self.shared.destination.crypter()
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.shared.tasks
    }

    pub fn events(&self) -> &Events {
        &self.shared.events
    }

    pub fn state(&self) -> ContextState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ContextState::Running
    }

    /// Number of armed change subscriptions (0 or 1)
    pub fn active_subscriptions(&self) -> usize {
        usize::from(self.shared.lock.lock().borrow().watcher.is_some())
    }

    /// Arm the change watcher. Does nothing unless idle.
    pub fn start(&self) -> Result<()> {
        let guard = self.shared.lock.lock();
        if self.shared.state() != ContextState::Idle {
            return Ok(());
        }

        self.shared.set_state(ContextState::Starting);
        self.shared.events.raise(Lifecycle::Starting);

        let watcher = match self.arm_watcher() {
            Ok(watcher) => watcher,
            Err(e) => {
                self.shared.set_state(ContextState::Idle);
                self.shared.events.raise_error(&e);
                return Err(e);
            }
        };

        {
            let mut inner = guard.borrow_mut();
            inner.watcher = Some(watcher);
            inner.state = ContextState::Running;
        }
        info!("Watching {:?}", self.shared.source.root_directory());
        self.shared.events.raise(Lifecycle::Started);
        Ok(())
    }

    fn arm_watcher(&self) -> Result<RecommendedWatcher> {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                if let Some(shared) = shared.upgrade() {
                    shared.handle_notification(result);
                }
            })?;
        watcher.watch(self.shared.source.root_directory(), RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    /// Disarm the change watcher. Does nothing unless running.
    pub fn stop(&self) -> Result<()> {
        let watcher = {
            let guard = self.shared.lock.lock();
            if self.shared.state() != ContextState::Running {
                return Ok(());
            }

            // Sources still waiting for a partner left the tree
            self.shared.settle_moves(Duration::ZERO);
            self.shared.set_state(ContextState::Stopping);
            self.shared.events.raise(Lifecycle::Stopping);
            let watcher = guard.borrow_mut().watcher.take();
            watcher
        };

        // The watcher thread may be waiting on the lock; release it first
        drop(watcher);

        let _guard = self.shared.lock.lock();
        self.shared.set_state(ContextState::Idle);
        info!("Stopped watching {:?}", self.shared.source.root_directory());
        self.shared.events.raise(Lifecycle::Stopped);
        Ok(())
    }

    /// Queue a change. Returns whether a task was added; changes are ignored
    /// unless the context is running.
    pub fn dispatch(&self, event: ChangeEvent) -> Result<bool> {
        self.shared.dispatch(event)
    }

    /// Run all queued tasks through `runner`.
    ///
    /// Rename sources older than [`MOVE_PAIR_WINDOW`] without a matching
    /// destination are queued as deletions first.
    pub fn drain<R: TaskRunner + ?Sized>(&self, runner: &mut R) -> Result<DrainReport> {
        self.shared.settle_moves(MOVE_PAIR_WINDOW);
        self.shared.tasks.drain(runner)
    }

    /// Release the watcher and key material without lifecycle signals
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Some(watcher) = self.shared.take_watcher() {
            drop(watcher);
            debug!("Sync context disposed while watching");
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("source", &self.shared.source)
            .field("destination", &self.shared.destination)
            .field("state", &self.state())
            .field("tasks", &self.shared.tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskKind};
    use notify::event::{ModifyKind, RenameMode};
    use notify::{Event, EventKind};
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        ctx: SyncContext,
        signals: Arc<Mutex<Vec<Lifecycle>>>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        let ctx = SyncContext::create(
            temp.path().join("src"),
            temp.path().join("dst"),
            b"p",
            None,
            Some(10),
        )
        .unwrap();

        let signals = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&signals);
        ctx.events().on_lifecycle(move |s| sink.lock().push(s));

        Fixture {
            temp,
            ctx,
            signals,
        }
    }

    #[test]
    fn test_create_validation() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(temp.path().join("file"), b"x").unwrap();
        let dst = temp.path().join("dst");

        let err = SyncContext::create(&src, &dst, b"", None, None).unwrap_err();
        assert!(err.is_validation());

        let err = SyncContext::create(&src, &dst, b"p", None, Some(0)).unwrap_err();
        assert!(err.is_validation());

        let err = SyncContext::create(temp.path().join("missing"), &dst, b"p", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::PathNotFound(_)));

        let err = SyncContext::create(temp.path().join("file"), &dst, b"p", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::NotADirectory(_)));

        // An empty salt selects the default
        let ctx = SyncContext::create(&src, &dst, b"p", Some(b""), None).unwrap();
        assert!(ctx.crypter().is_keyed());
    }

    #[test]
    fn test_start_is_idempotent() {
        let f = fixture();
        f.ctx.start().unwrap();
        f.ctx.start().unwrap();

        assert!(f.ctx.is_running());
        assert_eq!(f.ctx.active_subscriptions(), 1);
        assert_eq!(
            *f.signals.lock(),
            vec![Lifecycle::Starting, Lifecycle::Started]
        );
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let f = fixture();
        f.ctx.stop().unwrap();

        assert_eq!(f.ctx.state(), ContextState::Idle);
        assert!(f.signals.lock().is_empty());
    }

    #[test]
    fn test_lifecycle_signal_order() {
        let f = fixture();
        f.ctx.start().unwrap();
        f.ctx.stop().unwrap();
        f.ctx.stop().unwrap();

        assert_eq!(f.ctx.active_subscriptions(), 0);
        assert_eq!(
            *f.signals.lock(),
            vec![
                Lifecycle::Starting,
                Lifecycle::Started,
                Lifecycle::Stopping,
                Lifecycle::Stopped
            ]
        );

        // A stopped context can be started again
        f.ctx.start().unwrap();
        assert_eq!(f.ctx.active_subscriptions(), 1);
    }

    #[test]
    fn test_dispatch_only_while_running() {
        let f = fixture();
        let root = f.ctx.source().root_directory().to_path_buf();

        assert!(!f.ctx.dispatch(ChangeEvent::Created(root.join("a.txt"))).unwrap());
        assert!(f.ctx.tasks().is_empty());

        f.ctx.start().unwrap();
        f.ctx.tasks().clear();
        assert!(f.ctx.dispatch(ChangeEvent::Created(root.join("a.txt"))).unwrap());
        assert!(!f
            .ctx
            .dispatch(ChangeEvent::Changed("/not/under/source".into()))
            .unwrap());

        assert_eq!(f.ctx.tasks().pending(), vec![Task::created("/a.txt")]);
    }

    #[test]
    fn test_dispose_skips_stop_signals() {
        let f = fixture();
        f.ctx.start().unwrap();
        let signals = Arc::clone(&f.signals);

        f.ctx.dispose();
        assert_eq!(
            *signals.lock(),
            vec![Lifecycle::Starting, Lifecycle::Started]
        );
    }

    #[test]
    fn test_watcher_feeds_queue() {
        let f = fixture();
        f.ctx.start().unwrap();

        let root = f.ctx.source().root_directory().to_path_buf();
        fs::write(root.join("new.txt"), b"hello").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while f.ctx.tasks().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        f.ctx.stop().unwrap();

        let pending = f.ctx.tasks().pending();
        assert!(pending.iter().any(|t| t.path == "/new.txt"));
    }

    #[test]
    fn test_drain_through_context() {
        let f = fixture();
        f.ctx.start().unwrap();
        f.ctx.tasks().clear();
        let root = f.ctx.source().root_directory().to_path_buf();
        f.ctx
            .dispatch(ChangeEvent::Deleted(root.join("gone.txt")))
            .unwrap();
        f.ctx.stop().unwrap();

        let mut seen = Vec::new();
        let report = f
            .ctx
            .drain(&mut |task: &Task| -> Result<()> {
                seen.push(task.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(report.succeeded, seen.len());
        assert!(seen.contains(&Task::deleted("/gone.txt")));
    }

    fn rename(mode: RenameMode, paths: &[PathBuf], tracker: usize) -> notify::Result<Event> {
        let event = paths
            .iter()
            .fold(Event::new(EventKind::Modify(ModifyKind::Name(mode))), |e, p| {
                e.add_path(p.clone())
            });
        Ok(event.set_tracker(tracker))
    }

    /// Drain until a task satisfying `want` shows up or five seconds pass
    fn drain_until(ctx: &SyncContext, want: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !seen.iter().any(&want) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            ctx.drain(&mut |task: &Task| -> Result<()> {
                seen.push(task.clone());
                Ok(())
            })
            .unwrap();
        }
        seen
    }

    #[test]
    fn test_watcher_error_keeps_running() {
        let f = fixture();
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        f.ctx.events().on_error(move |e| sink.lock().push(e.to_string()));

        f.ctx.start().unwrap();
        f.ctx
            .shared
            .handle_notification(Err(notify::Error::generic("backend hiccup")));

        assert!(f.ctx.is_running());
        let reported = reported.lock();
        assert_eq!(reported.len(), 1);
        assert!(reported[0].contains("backend hiccup"));
    }

    #[test]
    fn test_tracked_rename_becomes_one_task() {
        let f = fixture();
        f.ctx.start().unwrap();
        f.ctx.tasks().clear();
        let root = f.ctx.source().root_directory().to_path_buf();
        let (a, b) = (root.join("a.txt"), root.join("b.txt"));

        f.ctx
            .shared
            .handle_notification(rename(RenameMode::From, &[a.clone()], 1));
        f.ctx
            .shared
            .handle_notification(rename(RenameMode::To, &[b.clone()], 1));
        f.ctx
            .shared
            .handle_notification(rename(RenameMode::Both, &[a, b], 1));

        assert_eq!(
            f.ctx.tasks().pending(),
            vec![Task::renamed("/a.txt", "/b.txt")]
        );
    }

    #[test]
    fn test_unmatched_rename_source_settles_on_drain_and_stop() {
        let f = fixture();
        f.ctx.start().unwrap();
        f.ctx.tasks().clear();
        let root = f.ctx.source().root_directory().to_path_buf();

        f.ctx
            .shared
            .handle_notification(rename(RenameMode::From, &[root.join("early.txt")], 4));
        std::thread::sleep(MOVE_PAIR_WINDOW + Duration::from_millis(50));
        let mut seen = Vec::new();
        f.ctx
            .drain(&mut |task: &Task| -> Result<()> {
                seen.push(task.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![Task::deleted("/early.txt")]);

        f.ctx
            .shared
            .handle_notification(rename(RenameMode::From, &[root.join("late.txt")], 5));
        assert!(f.ctx.tasks().is_empty());
        f.ctx.stop().unwrap();
        assert_eq!(f.ctx.tasks().pending(), vec![Task::deleted("/late.txt")]);
    }

    #[test]
    fn test_move_into_source_is_created() {
        let f = fixture();
        let outside = f.temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("in.txt"), b"arrived").unwrap();

        f.ctx.start().unwrap();
        let root = f.ctx.source().root_directory().to_path_buf();
        fs::rename(outside.join("in.txt"), root.join("in.txt")).unwrap();

        let seen = drain_until(&f.ctx, |t| t.path == "/in.txt");
        f.ctx.stop().unwrap();
        assert!(seen
            .iter()
            .any(|t| t.kind == TaskKind::Created && t.path == "/in.txt"));
    }

    #[test]
    fn test_move_out_of_source_is_deleted() {
        let f = fixture();
        let outside = f.temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let root = f.ctx.source().root_directory().to_path_buf();
        fs::write(root.join("out.txt"), b"leaving").unwrap();

        f.ctx.start().unwrap();
        fs::rename(root.join("out.txt"), outside.join("out.txt")).unwrap();

        let seen = drain_until(&f.ctx, |t| t.kind == TaskKind::Deleted);
        f.ctx.stop().unwrap();
        assert!(seen
            .iter()
            .any(|t| t.kind == TaskKind::Deleted && t.path == "/out.txt"));
    }
}
