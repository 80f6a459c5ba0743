//! Transport for devices mounted into the local file system.

use std::fs;
use std::io;
use std::path::Path;
use std::process::Command;

use sysinfo::Disks;
use tracing::{debug, warn};

use super::{DirRemoval, StorageSpace, Transport, TransportResult, split_lines};
use crate::error::TransportError;

/// Direct `std::fs` access to a mounted device.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemTransport;

impl FilesystemTransport {
    /// Create a new filesystem transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Find the disk whose mount point is the longest prefix of `path`.
fn storage_for(disks: &Disks, path: &Path) -> Option<StorageSpace> {
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| StorageSpace::from_bytes(disk.available_space(), disk.total_space()))
}

impl Transport for FilesystemTransport {
    fn open(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> TransportResult<bool> {
        Path::new(path)
            .try_exists()
            .map_err(|e| TransportError::at("stat", path, e))
    }

    fn make_dir(&mut self, path: &str) -> TransportResult<()> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && Path::new(path).is_dir() => Ok(()),
            Err(e) => Err(TransportError::at("mkdir", path, e)),
        }
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()> {
        fs::copy(local_path, remote_path)
            .map(|bytes| debug!("Copied {} bytes to {}", bytes, remote_path))
            .map_err(|e| {
                TransportError::new(format!(
                    "copy {} to {}: {e}",
                    local_path.display(),
                    remote_path
                ))
            })
    }

    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let bytes = fs::read(path).map_err(|e| TransportError::at("read", path, e))?;
        Ok(split_lines(&String::from_utf8_lossy(&bytes)))
    }

    fn remove_file(&mut self, path: &str) -> TransportResult<()> {
        fs::remove_file(path).map_err(|e| TransportError::at("remove", path, e))
    }

    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval {
        match fs::remove_dir(path) {
            Ok(()) => DirRemoval::Removed,
            Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => DirRemoval::NotEmpty,
            Err(e) => DirRemoval::Failed(format!("{path}: {e}")),
        }
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let entries = fs::read_dir(path).map_err(|e| TransportError::at("list", path, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TransportError::at("list", path, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn storage_space(&mut self, path: &str) -> TransportResult<StorageSpace> {
        let disks = Disks::new_with_refreshed_list();
        let space = storage_for(&disks, Path::new(path)).unwrap_or_else(StorageSpace::unknown);
        debug!("Storage at {}: {}", path, space);
        Ok(space)
    }

    fn flush(&mut self, root: &str) -> TransportResult<()> {
        if cfg!(unix) {
            match Command::new("sync").status() {
                Ok(status) if status.success() => debug!("Synced file systems for {}", root),
                Ok(status) => warn!("sync exited with {}", status),
                Err(e) => warn!("Could not run sync: {}", e),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "filesystem".to_string()
    }
}
