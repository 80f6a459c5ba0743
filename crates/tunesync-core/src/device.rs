//! Sync targets and their on-device layout.
//!
//! A [`DeviceProfile`] is what gets persisted: name, root, layout policy and
//! transport settings. A [`Device`] pairs a profile with a live transport and
//! the transient playlist snapshot taken by [`Device::scan`].
//!
//! Playlists live in [`PLAYLIST_DIRECTORY`] directly below the device root,
//! so their entries refer to music files one directory up (`../Artist/a.mp3`).

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::paths;
use crate::transport::{StorageSpace, Transport, TransportConfig};

/// Subdirectory of the device root holding device playlists.
pub const PLAYLIST_DIRECTORY: &str = "Playlists";

/// File extension of device playlists.
pub const PLAYLIST_EXTENSION: &str = "m3u";

/// Persisted description of a sync target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Display name.
    pub name: String,
    /// Music root on the device, as seen through the transport.
    pub root: String,
    /// Collapse library directories into single file names.
    #[serde(default)]
    pub flatten: bool,
    /// How to reach the device.
    #[serde(default)]
    pub transport: TransportConfig,
}

impl DeviceProfile {
    /// Create a profile that preserves the library's directory layout.
    pub fn new(name: impl Into<String>, root: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            flatten: false,
            transport,
        }
    }

    /// Set the flatten policy.
    #[must_use]
    pub const fn with_flatten(mut self, flatten: bool) -> Self {
        self.flatten = flatten;
        self
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} at {}{})",
            self.name,
            self.transport,
            self.root,
            if self.flatten { ", flattened" } else { "" }
        )
    }
}

/// A sync target with a live transport.
pub struct Device {
    profile: DeviceProfile,
    transport: Box<dyn Transport>,
    /// Members of each device playlist, keyed by playlist name.
    playlist_files: HashMap<String, HashSet<String>>,
    /// Union of every playlist's members.
    all_songs: HashSet<String>,
}

impl Device {
    /// Build the transport described by the profile.
    #[must_use]
    pub fn new(profile: DeviceProfile) -> Self {
        let transport = profile.transport.build();
        Self::with_transport(profile, transport)
    }

    /// Use an already constructed transport.
    #[must_use]
    pub fn with_transport(profile: DeviceProfile, transport: Box<dyn Transport>) -> Self {
        Self {
            profile,
            transport,
            playlist_files: HashMap::new(),
            all_songs: HashSet::new(),
        }
    }

    /// The persisted profile.
    #[must_use]
    pub const fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Music root on the device.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.profile.root
    }

    /// Whether library paths are flattened.
    #[must_use]
    pub const fn flatten(&self) -> bool {
        self.profile.flatten
    }

    /// The transport, for executing operations.
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Absolute path of the playlist directory.
    #[must_use]
    pub fn playlist_directory(&self) -> String {
        paths::join(&self.profile.root, PLAYLIST_DIRECTORY)
    }

    /// Device-relative path of a playlist file.
    #[must_use]
    pub fn playlist_file(&self, playlist_name: &str) -> String {
        format!("{PLAYLIST_DIRECTORY}/{playlist_name}.{PLAYLIST_EXTENSION}")
    }

    /// Turn a library playlist name into a device playlist name usable as a
    /// single file name.
    #[must_use]
    pub fn playlist_name_for(display_name: &str) -> String {
        display_name.replace('/', "_")
    }

    /// Where a library-relative music file is stored, relative to the root.
    #[must_use]
    pub fn music_file_device_path(&self, library_relative: &str) -> String {
        if self.profile.flatten {
            paths::flattened(library_relative)
        } else {
            library_relative.to_string()
        }
    }

    /// How a device-relative music file is referenced from inside a playlist.
    #[must_use]
    pub fn music_file_playlist_entry(&self, device_path: &str) -> String {
        paths::join("..", device_path)
    }

    /// Resolve a playlist entry back to its device-relative location.
    ///
    /// `None` for absolute entries and entries that climb above the root.
    #[must_use]
    pub fn actual_path_from_playlist_entry(&self, entry: &str) -> Option<String> {
        let path = paths::normalize(&paths::join(PLAYLIST_DIRECTORY, entry));
        Some(path).filter(|path| paths::is_strictly_within(path, ""))
    }

    /// Absolute device path of a device-relative path.
    #[must_use]
    pub fn absolute_path(&self, device_relative: &str) -> String {
        paths::join(&self.profile.root, device_relative)
    }

    /// Playlist snapshot from the last scan.
    #[must_use]
    pub const fn playlist_files(&self) -> &HashMap<String, HashSet<String>> {
        &self.playlist_files
    }

    /// Entries of one device playlist, if present.
    #[must_use]
    pub fn playlist(&self, playlist_name: &str) -> Option<&HashSet<String>> {
        self.playlist_files.get(playlist_name)
    }

    /// Union of all playlist entries from the last scan.
    #[must_use]
    pub const fn all_songs(&self) -> &HashSet<String> {
        &self.all_songs
    }

    /// Forget the scan snapshot.
    pub fn clear_scan_state(&mut self) {
        self.playlist_files.clear();
        self.all_songs.clear();
    }

    /// Read every device playlist, replacing the snapshot.
    ///
    /// Opens and closes the transport. A missing playlist directory means no
    /// playlists. On failure the snapshot is left empty.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure.
    pub fn scan(&mut self) -> Result<StorageSpace> {
        self.clear_scan_state();
        self.transport.open()?;

        let scanned = self.read_playlists();
        let closed = self.transport.close();

        match (scanned, closed) {
            (Ok(space), Ok(())) => {
                info!(
                    "Scanned {}: {} playlists, {} songs, {}",
                    self.profile.name,
                    self.playlist_files.len(),
                    self.all_songs.len(),
                    space
                );
                Ok(space)
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!("Closing {} after failed scan: {}", self.profile.name, close_err);
                }
                self.clear_scan_state();
                Err(e)
            }
            (Ok(_), Err(e)) => {
                self.clear_scan_state();
                Err(e.into())
            }
        }
    }

    fn read_playlists(&mut self) -> Result<StorageSpace> {
        let space = self.transport.storage_space(&self.profile.root)?;
        let directory = self.playlist_directory();
        if !self.transport.path_exists(&directory)? {
            debug!("No playlist directory at {}", directory);
            return Ok(space);
        }

        let suffix = format!(".{PLAYLIST_EXTENSION}");
        for file_name in self.transport.list(&directory)? {
            let Some(name) = file_name.strip_suffix(&suffix) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let entries: HashSet<String> = self
                .transport
                .read_lines(&paths::join(&directory, &file_name))?
                .into_iter()
                .collect();
            debug!("Device playlist {} has {} entries", name, entries.len());
            self.all_songs.extend(entries.iter().cloned());
            self.playlist_files.insert(name.to_string(), entries);
        }
        Ok(space)
    }

    /// Make the session's writes durable, then close the transport.
    ///
    /// # Errors
    ///
    /// Returns the flush failure, or the close failure if flushing succeeded.
    pub fn flush(&mut self) -> Result<()> {
        let flushed = self.transport.flush(&self.profile.root);
        let closed = self.transport.close();
        flushed?;
        closed?;
        Ok(())
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("profile", &self.profile)
            .field("transport", &self.transport.describe())
            .field("playlists", &self.playlist_files.len())
            .field("songs", &self.all_songs.len())
            .finish()
    }
}
