//! In-memory transport for testing.
//!
//! Clones share state, so a test can keep a handle while the transport itself
//! is moved into a [`Device`](crate::device::Device) or a worker thread.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{DirRemoval, StorageSpace, Transport, TransportResult, split_lines};
use crate::error::TransportError;
use crate::paths;

#[derive(Debug, Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    calls: Vec<String>,
    failing_removals: HashSet<String>,
    failing_uploads: HashSet<String>,
    storage: StorageSpace,
    open: bool,
}

/// In-memory transport that records every operation it receives.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an empty mock device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Add a directory and all of its ancestors.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.lock();
        let mut current = path.to_string();
        while !current.is_empty() && current != "/" {
            state.dirs.insert(current.clone());
            current = paths::parent(&current).to_string();
        }
    }

    /// Add a file with text contents, creating parent directories.
    pub fn add_file(&self, path: &str, contents: &str) {
        self.add_dir(paths::parent(path));
        self.lock()
            .files
            .insert(path.to_string(), contents.as_bytes().to_vec());
    }

    /// Make removal of `path` fail.
    pub fn fail_removal_of(&self, path: &str) {
        self.lock().failing_removals.insert(path.to_string());
    }

    /// Make uploads to `path` fail.
    pub fn fail_upload_to(&self, path: &str) {
        self.lock().failing_uploads.insert(path.to_string());
    }

    /// Set the storage figures reported.
    pub fn set_storage(&self, storage: StorageSpace) {
        self.lock().storage = storage;
    }

    /// Whether a directory exists.
    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// Whether a file exists.
    pub fn has_file(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    /// Text contents of a file.
    pub fn file_text(&self, path: &str) -> Option<String> {
        self.lock()
            .files
            .get(path)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Every file path currently stored.
    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Operations received so far, e.g. `"upload /dev/a.mp3"`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    fn record(&self, call: String) {
        self.lock().calls.push(call);
    }

    fn exists(state: &MockState, path: &str) -> bool {
        state.files.contains_key(path) || state.dirs.contains(path)
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> TransportResult<()> {
        self.record("open".to_string());
        self.lock().open = true;
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> TransportResult<bool> {
        let state = self.lock();
        Ok(Self::exists(&state, path) || path == "/")
    }

    fn make_dir(&mut self, path: &str) -> TransportResult<()> {
        self.record(format!("make_dir {path}"));
        let mut state = self.lock();
        let parent = paths::parent(path);
        if !parent.is_empty() && parent != "/" && !state.dirs.contains(parent) {
            return Err(TransportError::at("mkdir", path, "parent missing"));
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()> {
        self.record(format!("upload {remote_path}"));
        let contents = std::fs::read(local_path)?;
        let mut state = self.lock();
        if state.failing_uploads.contains(remote_path) {
            return Err(TransportError::at("upload", remote_path, "disk full"));
        }
        let parent = paths::parent(remote_path);
        if !parent.is_empty() && !state.dirs.contains(parent) {
            return Err(TransportError::at("upload", remote_path, "no such directory"));
        }
        state.files.insert(remote_path.to_string(), contents);
        Ok(())
    }

    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let state = self.lock();
        state
            .files
            .get(path)
            .map(|bytes| split_lines(&String::from_utf8_lossy(bytes)))
            .ok_or_else(|| TransportError::at("read", path, "no such file"))
    }

    fn remove_file(&mut self, path: &str) -> TransportResult<()> {
        self.record(format!("remove_file {path}"));
        let mut state = self.lock();
        if state.failing_removals.contains(path) {
            return Err(TransportError::at("remove", path, "permission denied"));
        }
        state
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| TransportError::at("remove", path, "no such file"))
    }

    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval {
        self.record(format!("remove_dir {path}"));
        let mut state = self.lock();
        if !state.dirs.contains(path) {
            return DirRemoval::Failed(format!("{path}: no such directory"));
        }
        let prefix = format!("{path}/");
        let occupied = state.files.keys().any(|f| f.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix));
        if occupied {
            return DirRemoval::NotEmpty;
        }
        state.dirs.remove(path);
        DirRemoval::Removed
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let state = self.lock();
        if !state.dirs.contains(path) {
            return Err(TransportError::at("list", path, "no such directory"));
        }
        let names = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|entry| paths::parent(entry) == path)
            .map(|entry| paths::file_name(entry).to_string())
            .collect();
        Ok(names)
    }

    fn storage_space(&mut self, _path: &str) -> TransportResult<StorageSpace> {
        Ok(self.lock().storage)
    }

    fn flush(&mut self, root: &str) -> TransportResult<()> {
        self.record(format!("flush {root}"));
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.record("close".to_string());
        self.lock().open = false;
        Ok(())
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}
