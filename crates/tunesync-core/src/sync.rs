//! Reconciliation of library playlists against a device.
//!
//! A [`Syncer`] compares the playlists the user wants on a device with the
//! device's last playlist scan and plans the copies and deletions that make
//! them agree. Planning happens on the caller's thread; execution happens on
//! a dedicated worker started by [`Syncer::execute`] or
//! [`Syncer::sync_device`].
//!
//! Before any deletion is queued, the set of device files still required is
//! computed across every wanted playlist and every device playlist that has
//! no library counterpart. Files in that set are never deleted, so removing
//! one playlist cannot take files away from another.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut syncer = Syncer::new(DirectoryLibrary::from_config(&config.library))?;
//! syncer.scan_device(&mut device)?;
//! let wanted = vec![true, false];
//! let handle = syncer.sync_device(device, &wanted, Box::new(NoopSink));
//! let outcome = handle.join();
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::executor::{BatchExecutor, CancellationToken, ExecutionReport, ProgressSink};
use crate::library::{Library, LibraryPlaylist};
use crate::queue::OperationQueue;
use crate::transport::StorageSpace;

// =============================================================================
// Sync handle
// =============================================================================

/// Result of a finished sync run.
#[derive(Debug)]
pub struct SyncOutcome {
    /// The device, handed back for re-scanning. `None` if the worker panicked.
    pub device: Option<Device>,
    /// What the run did, or why it stopped.
    pub result: Result<ExecutionReport>,
}

enum Worker {
    Running(JoinHandle<(Device, Result<ExecutionReport>)>),
    Finished(Device, Error),
}

/// A sync run in progress.
pub struct SyncHandle {
    worker: Worker,
    cancel: CancellationToken,
}

impl SyncHandle {
    /// Ask the worker to stop after the operation in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The token the worker observes.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the worker has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        match &self.worker {
            Worker::Running(handle) => handle.is_finished(),
            Worker::Finished(..) => true,
        }
    }

    /// Wait for the run to end.
    #[must_use]
    pub fn join(self) -> SyncOutcome {
        match self.worker {
            Worker::Running(handle) => match handle.join() {
                Ok((device, result)) => SyncOutcome {
                    device: Some(device),
                    result,
                },
                Err(_) => {
                    error!("Sync worker panicked");
                    SyncOutcome {
                        device: None,
                        result: Err(Error::WorkerPanicked),
                    }
                }
            },
            Worker::Finished(device, err) => SyncOutcome {
                device: Some(device),
                result: Err(err),
            },
        }
    }
}

// =============================================================================
// Syncer
// =============================================================================

/// Plans and runs playlist syncs from one library.
pub struct Syncer<L: Library> {
    library: L,
    playlists: Vec<LibraryPlaylist>,
    on_device: Vec<bool>,
    scratch: TempDir,
}

impl<L: Library> Syncer<L> {
    /// Create a syncer and read the library's playlist list.
    ///
    /// # Errors
    ///
    /// Fails if the scratch directory can't be created or the library can't
    /// be listed.
    pub fn new(library: L) -> Result<Self> {
        let scratch = tempfile::Builder::new().prefix("tunesync-").tempdir()?;
        let mut syncer = Self {
            library,
            playlists: Vec::new(),
            on_device: Vec::new(),
            scratch,
        };
        syncer.scan_library()?;
        Ok(syncer)
    }

    /// Re-read the library's playlist list. Every playlist is marked absent
    /// until the next device scan.
    ///
    /// # Errors
    ///
    /// Fails if the library can't be listed.
    pub fn scan_library(&mut self) -> Result<()> {
        self.playlists = self.library.playlists()?;
        self.on_device = vec![false; self.playlists.len()];
        debug!("Library has {} playlists", self.playlists.len());
        Ok(())
    }

    /// The library.
    #[must_use]
    pub fn library(&self) -> &L {
        &self.library
    }

    /// Library playlists, in the order `wanted` flags refer to.
    #[must_use]
    pub fn playlists(&self) -> &[LibraryPlaylist] {
        &self.playlists
    }

    /// Whether each library playlist was on the device at the last scan.
    #[must_use]
    pub fn on_device(&self) -> &[bool] {
        &self.on_device
    }

    /// Scan the device and refresh [`on_device`](Self::on_device).
    ///
    /// # Errors
    ///
    /// Propagates the scan failure; the flags are all cleared in that case.
    pub fn scan_device(&mut self, device: &mut Device) -> Result<StorageSpace> {
        let scanned = device.scan();
        self.on_device = self
            .playlists
            .iter()
            .map(|playlist| device.playlist(&Device::playlist_name_for(&playlist.name)).is_some())
            .collect();
        scanned
    }

    /// Work out the operations that bring `device` to the wanted state.
    ///
    /// `wanted[i]` refers to the `i`th entry of [`playlists`](Self::playlists);
    /// missing flags count as not wanted. Uses the device's last scan.
    ///
    /// # Errors
    ///
    /// Fails if the library can't be read or a playlist can't be rendered.
    pub fn plan(&self, device: &Device, wanted: &[bool]) -> Result<OperationQueue> {
        let is_wanted = |index: usize| wanted.get(index).copied().unwrap_or(false);
        let owners = self.device_playlist_owners(&is_wanted);
        let owns = |index: usize, device_name: &str| owners.get(device_name) == Some(&index);

        // required entries of every wanted playlist, by library index
        let mut required = Vec::new();
        let mut still_required = HashSet::new();
        for (index, playlist) in self.playlists.iter().enumerate() {
            if !is_wanted(index) || !owns(index, &Device::playlist_name_for(&playlist.name)) {
                continue;
            }
            let entries = self.playlist_entries(device, playlist)?;
            still_required.extend(
                entries
                    .iter()
                    .filter_map(|(entry, _)| device.actual_path_from_playlist_entry(entry)),
            );
            required.push((index, entries));
        }

        for (name, members) in device.playlist_files() {
            if !owners.contains_key(name) {
                debug!("Keeping members of unmanaged device playlist {}", name);
                still_required.extend(
                    members
                        .iter()
                        .filter_map(|entry| device.actual_path_from_playlist_entry(entry)),
                );
            }
        }

        let mut queue = OperationQueue::new();
        let mut required = required.into_iter().peekable();
        for (index, playlist) in self.playlists.iter().enumerate() {
            let device_name = Device::playlist_name_for(&playlist.name);
            if !owns(index, &device_name) {
                warn!(
                    "Skipping playlist {}: device playlist {} belongs to another library playlist",
                    playlist.id, device_name
                );
                continue;
            }
            let playlist_file = device.playlist_file(&device_name);
            let existing = device.playlist(&device_name);

            let entries = required
                .next_if(|(wanted_index, _)| *wanted_index == index)
                .map(|(_, entries)| entries);

            let Some(entries) = entries else {
                if let Some(members) = existing {
                    info!("Removing playlist {} from {}", playlist.name, device.name());
                    let mut members: Vec<&String> = members.iter().collect();
                    members.sort();
                    queue_deletions(&mut queue, device, &still_required, members);
                    queue.delete_playlist(&playlist_file);
                }
                continue;
            };

            for (entry, source) in &entries {
                if device.all_songs().contains(entry) {
                    continue;
                }
                if let Some(destination) = device.actual_path_from_playlist_entry(entry) {
                    queue.copy(source, &destination);
                }
            }

            let new_set: HashSet<&String> = entries.iter().map(|(entry, _)| entry).collect();
            let rewrite = match existing {
                None => true,
                Some(old) => {
                    let mut dropped: Vec<&String> =
                        old.iter().filter(|entry| !new_set.contains(entry)).collect();
                    dropped.sort();
                    queue_deletions(&mut queue, device, &still_required, dropped);
                    old.len() != new_set.len() || old.iter().any(|entry| !new_set.contains(entry))
                }
            };

            if rewrite {
                let rendered = self.render_playlist(index, &entries)?;
                queue.copy_playlist(&rendered, &playlist_file);
            }
        }

        info!("Planned sync of {}: {}", device.name(), queue.label());
        Ok(queue)
    }

    /// Which library playlist manages each device playlist name. Names can
    /// collide; the first wanted playlist wins, then the first in order.
    fn device_playlist_owners(
        &self,
        is_wanted: &impl Fn(usize) -> bool,
    ) -> HashMap<String, usize> {
        let mut owners: HashMap<String, usize> = HashMap::new();
        for (index, playlist) in self.playlists.iter().enumerate() {
            match owners.entry(Device::playlist_name_for(&playlist.name)) {
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
                Entry::Occupied(mut slot) => {
                    let owner = *slot.get();
                    warn!(
                        "Library playlists {} and {} both map to device playlist {}",
                        self.playlists[owner].id,
                        playlist.id,
                        slot.key()
                    );
                    if is_wanted(index) && !is_wanted(owner) {
                        slot.insert(index);
                    }
                }
            }
        }
        owners
    }

    /// Run `queue` against `device` on a worker thread.
    pub fn execute(
        &self,
        mut device: Device,
        queue: OperationQueue,
        sink: Box<dyn ProgressSink>,
    ) -> SyncHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let worker = thread::spawn(move || {
            let mut executor = BatchExecutor::new(queue, sink, token);
            let result = executor.run(&mut device);
            (device, result)
        });
        SyncHandle {
            worker: Worker::Running(worker),
            cancel,
        }
    }

    /// Plan on this thread, then execute on a worker.
    ///
    /// A planning failure is reported through the handle, which still returns
    /// the device.
    pub fn sync_device(
        &self,
        device: Device,
        wanted: &[bool],
        sink: Box<dyn ProgressSink>,
    ) -> SyncHandle {
        match self.plan(&device, wanted) {
            Ok(queue) => self.execute(device, queue, sink),
            Err(err) => {
                error!("Planning sync of {} failed: {}", device.name(), err);
                SyncHandle {
                    worker: Worker::Finished(device, err),
                    cancel: CancellationToken::new(),
                }
            }
        }
    }

    /// Re-scan the device after a run so the next plan starts from what is
    /// actually there.
    ///
    /// # Errors
    ///
    /// Propagates the scan failure.
    pub fn sync_completed(
        &mut self,
        device: &mut Device,
        report: &ExecutionReport,
    ) -> Result<StorageSpace> {
        let space = self.scan_device(device)?;
        info!(
            "{}% done, you may safely remove your device",
            (report.progress * 100.0).round()
        );
        Ok(space)
    }

    /// Playlist entry and source file of every member of `playlist`, in
    /// library order. The first member mapping to an entry wins.
    fn playlist_entries(
        &self,
        device: &Device,
        playlist: &LibraryPlaylist,
    ) -> Result<Vec<(String, PathBuf)>> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for track in self.library.tracks(playlist)? {
            let track = track?;
            let entry = device
                .music_file_playlist_entry(&device.music_file_device_path(&track.relative_path));
            if seen.insert(entry.clone()) {
                entries.push((entry, track.source_path));
            }
        }
        Ok(entries)
    }

    fn render_playlist(&self, index: usize, entries: &[(String, PathBuf)]) -> Result<PathBuf> {
        let path = self.scratch.path().join(format!("{index}.m3u"));
        write_playlist(&path, entries)?;
        Ok(path)
    }
}

/// Queue removal of each entry that resolves inside the device root and is
/// not still required.
fn queue_deletions<'a>(
    queue: &mut OperationQueue,
    device: &Device,
    still_required: &HashSet<String>,
    entries: impl IntoIterator<Item = &'a String>,
) {
    for entry in entries {
        match device.actual_path_from_playlist_entry(entry) {
            Some(path) if !still_required.contains(&path) => queue.delete(&path),
            Some(_) => {}
            None => warn!("Not deleting {}: outside {}", entry, device.root()),
        }
    }
}

fn write_playlist(path: &Path, entries: &[(String, PathBuf)]) -> Result<()> {
    let mut file = BufWriter::new(fs::File::create(path)?);
    for (entry, _) in entries {
        writeln!(file, "{entry}")?;
    }
    file.flush()?;
    Ok(())
}
