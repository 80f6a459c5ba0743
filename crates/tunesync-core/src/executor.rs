//! Batch executor that drains an [`OperationQueue`] against a device.
//!
//! Execution order is fixed:
//! 1. music file removals, then playlist removals
//! 2. removal of directories emptied by step 1, deepest first
//! 3. music file transfers, then playlist transfers
//!
//! Cancellation is checked between operations, never during one. Whatever
//! happens, the device is flushed and closed before the final progress
//! report. Failed removals are logged and the run carries on; any other
//! failure ends the run.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;

use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::error::{Error, Result, TransportError};
use crate::paths;
use crate::queue::{CopyOperation, DeleteOperation, OperationQueue};
use crate::transport::DirRemoval;

// =============================================================================
// Progress reporting
// =============================================================================

/// Receives status updates from a running executor, on the worker thread.
pub trait ProgressSink: Send {
    /// One-off description of the whole run, sent before anything executes.
    fn label(&self, text: &str);

    /// Fraction of operations finished, in `[0, 1]`. `done` is set exactly
    /// once, on the last report.
    fn progress(&self, fraction: f64, done: bool);
}

/// Update sent by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Run description.
    Label(String),
    /// Progress report.
    Progress {
        /// Fraction finished.
        fraction: f64,
        /// Whether this is the final report.
        done: bool,
    },
}

/// Forwards updates over a channel so another thread can display them.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<SyncEvent>,
}

impl ChannelSink {
    /// Wrap a sender.
    #[must_use]
    pub const fn new(sender: Sender<SyncEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn label(&self, text: &str) {
        // the receiver may have hung up; the run continues regardless
        let _ = self.sender.send(SyncEvent::Label(text.to_string()));
    }

    fn progress(&self, fraction: f64, done: bool) {
        let _ = self.sender.send(SyncEvent::Progress { fraction, done });
    }
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn label(&self, _text: &str) {}

    fn progress(&self, _fraction: f64, _done: bool) {}
}

// =============================================================================
// Cancellation
// =============================================================================

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an unset token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Execution state and report
// =============================================================================

/// Lifecycle of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Not started.
    Idle,
    /// Draining the queue.
    Running,
    /// Every operation ran.
    Completed,
    /// Stopped early on request.
    Cancelled,
    /// Stopped by a failed operation.
    Failed,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Final state.
    pub state: ExecutorState,
    /// Files transferred, playlists included.
    pub files_copied: usize,
    /// Files removed, playlists included.
    pub files_deleted: usize,
    /// Removals skipped because the file was being copied again.
    pub deletions_skipped: usize,
    /// Removals that failed and were ignored.
    pub deletion_failures: usize,
    /// Empty directories removed.
    pub directories_removed: usize,
    /// Last progress fraction reported.
    pub progress: f64,
}

impl ExecutionReport {
    const fn new() -> Self {
        Self {
            state: ExecutorState::Idle,
            files_copied: 0,
            files_deleted: 0,
            deletions_skipped: 0,
            deletion_failures: 0,
            directories_removed: 0,
            progress: 0.0,
        }
    }

    /// Short human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{}: {} copied, {} deleted ({} failed, {} skipped), {} directories removed",
            self.state,
            self.files_copied,
            self.files_deleted,
            self.deletion_failures,
            self.deletions_skipped,
            self.directories_removed
        )
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs one prebuilt queue against one device.
pub struct BatchExecutor {
    queue: OperationQueue,
    sink: Box<dyn ProgressSink>,
    cancel: CancellationToken,
    report: ExecutionReport,
    completed: usize,
    total: usize,
}

impl BatchExecutor {
    /// Prepare a run. Nothing happens until [`run`](Self::run).
    #[must_use]
    pub fn new(queue: OperationQueue, sink: Box<dyn ProgressSink>, cancel: CancellationToken) -> Self {
        let total = queue.total_operations();
        Self {
            queue,
            sink,
            cancel,
            report: ExecutionReport::new(),
            completed: 0,
            total,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ExecutorState {
        self.report.state
    }

    /// The queue being executed.
    #[must_use]
    pub const fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Drain the queue against `device`.
    ///
    /// # Errors
    ///
    /// Returns the first fatal transport failure, after flushing the device
    /// and reporting final progress.
    pub fn run(&mut self, device: &mut Device) -> Result<ExecutionReport> {
        self.report = ExecutionReport::new();
        self.report.state = ExecutorState::Running;
        self.report.deletions_skipped = self.queue.skipped_deletion_count();
        self.completed = 0;

        let label = self.queue.label();
        info!("Syncing {}: {}", device.name(), label);
        self.sink.label(&label);

        if let Err(e) = device.transport_mut().open() {
            error!("Could not open {}: {}", device.name(), e);
            return Err(self.finish(ExecutorState::Failed, e.into()));
        }

        match self.drain(device) {
            Ok(cancelled) => {
                let flushed = device.flush();
                let state = if cancelled {
                    ExecutorState::Cancelled
                } else {
                    ExecutorState::Completed
                };
                if let Err(e) = flushed {
                    error!("Flushing {} failed: {}", device.name(), e);
                    return Err(self.finish(ExecutorState::Failed, e));
                }
                if !cancelled {
                    self.report.progress = 1.0;
                }
                self.report.state = state;
                self.sink.progress(self.report.progress, true);
                info!("Sync of {} finished: {}", device.name(), self.report.summary());
                Ok(self.report.clone())
            }
            Err(e) => {
                error!("Sync of {} failed: {}", device.name(), e);
                if let Err(flush_err) = device.flush() {
                    warn!("Flushing {} after failure: {}", device.name(), flush_err);
                }
                Err(self.finish(ExecutorState::Failed, e))
            }
        }
    }

    fn finish(&mut self, state: ExecutorState, err: Error) -> Error {
        self.report.state = state;
        self.sink.progress(self.report.progress, true);
        err
    }

    /// Run every batch. Returns whether the run was cancelled.
    fn drain(&mut self, device: &mut Device) -> Result<bool> {
        let deletions: Vec<DeleteOperation> = self
            .queue
            .deletions()
            .iter()
            .chain(self.queue.playlist_deletions())
            .filter(|op| op.required)
            .cloned()
            .collect();
        let copies: Vec<CopyOperation> = self
            .queue
            .copies()
            .iter()
            .chain(self.queue.playlist_copies())
            .cloned()
            .collect();

        let mut touched_dirs = HashSet::new();
        for op in &deletions {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let target = device.absolute_path(&op.destination);
            if !paths::is_strictly_within(&target, device.root()) {
                warn!("Refusing to remove {} outside {}", target, device.root());
                self.report.deletion_failures += 1;
                self.step();
                continue;
            }
            touched_dirs.insert(paths::parent(&target).to_string());
            match device.transport_mut().remove_file(&target) {
                Ok(()) => {
                    debug!("Removed {}", target);
                    self.report.files_deleted += 1;
                }
                Err(e) => {
                    warn!("Ignoring failed removal of {}: {}", target, e);
                    self.report.deletion_failures += 1;
                }
            }
            self.step();
        }

        if self.remove_empty_dirs(device, touched_dirs) {
            return Ok(true);
        }

        for op in &copies {
            if self.cancel.is_cancelled() {
                return Ok(true);
            }
            let target = device.absolute_path(&op.destination);
            if !paths::is_strictly_within(&target, device.root()) {
                return Err(
                    TransportError::at("upload", &target, "outside the device root").into(),
                );
            }
            let transport = device.transport_mut();
            transport.make_dirs(paths::parent(&target))?;
            transport.upload_file(&op.source, &target)?;
            debug!("Copied {} to {}", op.source.display(), target);
            self.report.files_copied += 1;
            self.step();
        }
        Ok(false)
    }

    /// Remove directories left empty, deepest first, climbing towards the
    /// root while removals succeed. Returns whether cancellation was seen.
    fn remove_empty_dirs(&mut self, device: &mut Device, dirs: HashSet<String>) -> bool {
        let root = device.root().to_string();
        let mut dirs: Vec<String> = dirs.into_iter().collect();
        dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| a.cmp(b)));

        let mut removed: HashSet<String> = HashSet::new();
        for dir in dirs {
            if self.cancel.is_cancelled() {
                return true;
            }
            let mut current = dir;
            while paths::is_strictly_within(&current, &root) && !removed.contains(&current) {
                match device.transport_mut().remove_dir_if_empty(&current) {
                    DirRemoval::Removed => {
                        debug!("Removed empty directory {}", current);
                        self.report.directories_removed += 1;
                        let parent = paths::parent(&current).to_string();
                        removed.insert(current);
                        current = parent;
                    }
                    DirRemoval::NotEmpty => break,
                    DirRemoval::Failed(reason) => {
                        debug!("Leaving directory {}: {}", current, reason);
                        break;
                    }
                }
            }
        }
        false
    }

    fn step(&mut self) {
        self.completed += 1;
        if self.total > 0 {
            self.report.progress = self.completed as f64 / self.total as f64;
        }
        self.sink.progress(self.report.progress, false);
    }
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|part| !part.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceProfile;
    use crate::transport::mock::MockTransport;
    use crate::transport::{StorageSpace, TransportConfig};
    use std::fs;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<SyncEvent>>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<SyncEvent> {
            self.events.lock().expect("lock").clone()
        }

        fn progress_values(&self) -> Vec<(f64, bool)> {
            self.events()
                .into_iter()
                .filter_map(|event| match event {
                    SyncEvent::Progress { fraction, done } => Some((fraction, done)),
                    SyncEvent::Label(_) => None,
                })
                .collect()
        }
    }

    impl ProgressSink for RecordingSink {
        fn label(&self, text: &str) {
            self.events
                .lock()
                .expect("lock")
                .push(SyncEvent::Label(text.to_string()));
        }

        fn progress(&self, fraction: f64, done: bool) {
            let mut events = self.events.lock().expect("lock");
            events.push(SyncEvent::Progress { fraction, done });
            let reports = events
                .iter()
                .filter(|e| matches!(e, SyncEvent::Progress { .. }))
                .count();
            if let Some((n, token)) = &self.cancel_after
                && reports == *n
            {
                token.cancel();
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        source: std::path::PathBuf,
        mock: MockTransport,
        device: Device,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let source = dir.path().join("song.mp3");
        fs::write(&source, "ID3").expect("write source");
        let mock = MockTransport::new();
        mock.add_dir("/dev");
        let device = Device::with_transport(
            DeviceProfile::new("Test", "/dev", TransportConfig::Filesystem),
            Box::new(mock.clone()),
        );
        Fixture {
            _dir: dir,
            source,
            mock,
            device,
        }
    }

    fn mutating_calls(mock: &MockTransport) -> Vec<String> {
        mock.calls()
            .into_iter()
            .filter(|c| !c.starts_with("make_dir "))
            .collect()
    }

    #[test]
    fn test_deletions_and_cleanup_precede_copies() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/Old/Album/y.mp3", "y");
        fx.mock.add_file("/dev/Playlists/B.m3u", "../Old/Album/y.mp3\n");
        let mut queue = OperationQueue::new();
        queue.copy_playlist(&fx.source, "Playlists/A.m3u");
        queue.copy(&fx.source, "New/z.mp3");
        queue.delete_playlist("Playlists/B.m3u");
        queue.delete("Old/Album/y.mp3");

        let sink = RecordingSink::default();
        let mut executor =
            BatchExecutor::new(queue, Box::new(sink.clone()), CancellationToken::new());
        let report = executor.run(&mut fx.device).expect("run");

        assert_eq!(
            mutating_calls(&fx.mock),
            vec![
                "open",
                "remove_file /dev/Old/Album/y.mp3",
                "remove_file /dev/Playlists/B.m3u",
                "remove_dir /dev/Old/Album",
                "remove_dir /dev/Old",
                "remove_dir /dev/Playlists",
                "upload /dev/New/z.mp3",
                "upload /dev/Playlists/A.m3u",
                "flush /dev",
                "close",
            ]
        );
        assert_eq!(report.state, ExecutorState::Completed);
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.files_copied, 2);
        assert_eq!(report.directories_removed, 3);
        assert!(fx.mock.has_file("/dev/Playlists/A.m3u"));
        assert!(!fx.mock.has_dir("/dev/Old"));
        assert_eq!(executor.state(), ExecutorState::Completed);
    }

    #[test]
    fn test_progress_is_monotonic_and_ends_done() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/a.mp3", "a");
        let mut queue = OperationQueue::new();
        queue.delete("a.mp3");
        queue.copy(&fx.source, "b.mp3");
        queue.copy(&fx.source, "c.mp3");
        queue.copy(&fx.source, "d.mp3");

        let sink = RecordingSink::default();
        BatchExecutor::new(queue, Box::new(sink.clone()), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(
            sink.events().first(),
            Some(&SyncEvent::Label("3 files to copy and 1 to delete".to_string()))
        );
        assert_eq!(
            sink.progress_values(),
            vec![
                (0.25, false),
                (0.5, false),
                (0.75, false),
                (1.0, false),
                (1.0, true)
            ]
        );
    }

    #[test]
    fn test_cancelled_deletion_is_skipped_and_not_counted() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/a.mp3", "old");
        let mut queue = OperationQueue::new();
        queue.delete("a.mp3");
        queue.copy(&fx.source, "a.mp3");

        let sink = RecordingSink::default();
        let report = BatchExecutor::new(queue, Box::new(sink.clone()), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert!(!fx.mock.calls().iter().any(|c| c.starts_with("remove_file")));
        assert_eq!(report.deletions_skipped, 1);
        assert_eq!(sink.progress_values(), vec![(1.0, false), (1.0, true)]);
        assert_eq!(fx.mock.file_text("/dev/a.mp3").as_deref(), Some("ID3"));
    }

    #[test]
    fn test_failed_removal_is_not_fatal() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/locked.mp3", "x");
        fx.mock.fail_removal_of("/dev/locked.mp3");
        let mut queue = OperationQueue::new();
        queue.delete("locked.mp3");
        queue.delete("already-gone.mp3");
        queue.copy(&fx.source, "new.mp3");

        let report = BatchExecutor::new(queue, Box::new(NoopSink), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.state, ExecutorState::Completed);
        assert_eq!(report.deletion_failures, 2);
        assert_eq!(report.files_copied, 1);
        assert!(fx.mock.has_file("/dev/new.mp3"));
    }

    #[test]
    fn test_cancel_between_operations() {
        let mut fx = fixture();
        let token = CancellationToken::new();
        let mut queue = OperationQueue::new();
        for name in ["1.mp3", "2.mp3", "3.mp3", "4.mp3"] {
            queue.copy(&fx.source, name);
        }
        // cancel once the second copy has reported
        let sink = RecordingSink {
            cancel_after: Some((2, token.clone())),
            ..RecordingSink::default()
        };

        let report = BatchExecutor::new(queue, Box::new(sink.clone()), token)
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.state, ExecutorState::Cancelled);
        assert_eq!(
            fx.mock.file_paths(),
            vec!["/dev/1.mp3".to_string(), "/dev/2.mp3".to_string()]
        );
        let calls = fx.mock.calls();
        assert_eq!(&calls[calls.len() - 2..], ["flush /dev", "close"]);
        // last fraction preserved, not forced to 1.0
        assert_eq!(sink.progress_values().last(), Some(&(0.5, true)));
    }

    #[test]
    fn test_cancel_before_start_runs_nothing_but_flushes() {
        let mut fx = fixture();
        let token = CancellationToken::new();
        token.cancel();
        let mut queue = OperationQueue::new();
        queue.copy(&fx.source, "a.mp3");

        let report = BatchExecutor::new(queue, Box::new(NoopSink), token)
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.state, ExecutorState::Cancelled);
        assert_eq!(fx.mock.calls(), vec!["open", "flush /dev", "close"]);
    }

    #[test]
    fn test_upload_failure_is_fatal_but_flushes() {
        let mut fx = fixture();
        fx.mock.fail_upload_to("/dev/b.mp3");
        let mut queue = OperationQueue::new();
        queue.copy(&fx.source, "a.mp3");
        queue.copy(&fx.source, "b.mp3");
        queue.copy(&fx.source, "c.mp3");

        let sink = RecordingSink::default();
        let mut executor =
            BatchExecutor::new(queue, Box::new(sink.clone()), CancellationToken::new());
        let err = executor.run(&mut fx.device).expect_err("upload fails");

        assert!(err.is_transport());
        assert_eq!(executor.state(), ExecutorState::Failed);
        assert!(!fx.mock.calls().contains(&"upload /dev/c.mp3".to_string()));
        assert!(fx.mock.calls().ends_with(&["flush /dev".to_string(), "close".to_string()]));
        let last = sink.progress_values().last().copied().expect("final report");
        assert!(last.1);
        assert!((last.0 - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_removals_outside_root_are_refused() {
        let mut fx = fixture();
        fx.mock.add_file("/outside.mp3", "keep");
        fx.mock.add_file("/etc/passwd", "keep");
        let mut queue = OperationQueue::new();
        queue.delete("../outside.mp3");
        queue.delete("/etc/passwd");

        let report = BatchExecutor::new(queue, Box::new(NoopSink), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.deletion_failures, 2);
        assert_eq!(report.files_deleted, 0);
        assert!(fx.mock.has_file("/outside.mp3"));
        assert!(fx.mock.has_file("/etc/passwd"));
        assert!(
            !fx.mock
                .calls()
                .iter()
                .any(|c| c.starts_with("remove_file") || c.starts_with("remove_dir"))
        );
    }

    #[test]
    fn test_upload_outside_root_is_fatal() {
        let mut fx = fixture();
        let mut queue = OperationQueue::new();
        queue.copy(&fx.source, "../escape.mp3");

        let err = BatchExecutor::new(queue, Box::new(NoopSink), CancellationToken::new())
            .run(&mut fx.device)
            .expect_err("refused");

        assert!(err.is_transport());
        assert!(!fx.mock.calls().iter().any(|c| c.starts_with("upload")));
    }

    #[test]
    fn test_cleanup_never_removes_root() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/only.mp3", "x");
        let mut queue = OperationQueue::new();
        queue.delete("only.mp3");

        let report = BatchExecutor::new(queue, Box::new(NoopSink), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.directories_removed, 0);
        assert!(!fx.mock.calls().iter().any(|c| c.starts_with("remove_dir")));
    }

    #[test]
    fn test_cleanup_keeps_non_empty_directories() {
        let mut fx = fixture();
        fx.mock.add_file("/dev/Artist/A/1.mp3", "1");
        fx.mock.add_file("/dev/Artist/B/2.mp3", "2");
        let mut queue = OperationQueue::new();
        queue.delete("Artist/A/1.mp3");

        let report = BatchExecutor::new(queue, Box::new(NoopSink), CancellationToken::new())
            .run(&mut fx.device)
            .expect("run");

        assert_eq!(report.directories_removed, 1);
        assert!(!fx.mock.has_dir("/dev/Artist/A"));
        assert!(fx.mock.has_dir("/dev/Artist"));
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (sender, receiver) = mpsc::channel();
        let sink = ChannelSink::new(sender);
        sink.label("1 files to copy and 0 to delete");
        sink.progress(1.0, true);
        drop(sink);

        let events: Vec<SyncEvent> = receiver.iter().collect();
        assert_eq!(
            events,
            vec![
                SyncEvent::Label("1 files to copy and 0 to delete".to_string()),
                SyncEvent::Progress {
                    fraction: 1.0,
                    done: true
                }
            ]
        );
    }

    #[test]
    fn test_empty_queue_completes() {
        let mut fx = fixture();
        fx.mock.set_storage(StorageSpace::unknown());
        let sink = RecordingSink::default();
        let report = BatchExecutor::new(
            OperationQueue::new(),
            Box::new(sink.clone()),
            CancellationToken::new(),
        )
        .run(&mut fx.device)
        .expect("run");

        assert_eq!(report.state, ExecutorState::Completed);
        assert_eq!(sink.progress_values(), vec![(1.0, true)]);
    }
}
