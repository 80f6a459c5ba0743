//! Persisted list of configured devices.
//!
//! The whole registry is written after every mutation. It may hold FTP
//! passwords, so the file is kept readable by its owner only. A file that no
//! longer parses is moved aside to `<file>.old` and the registry starts empty.
//!
//! Observers subscribe through [`DeviceRegistry::subscribe`] and receive
//! [`RegistryEvent`]s synchronously, after the mutation has been saved.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::device::DeviceProfile;
use crate::error::{Error, Result};

/// Change notifications emitted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device was added or removed.
    DeviceListChanged,
    /// The current device changed, or was edited.
    CurrentDeviceChanged,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    devices: Vec<DeviceProfile>,
    #[serde(default)]
    current_device: Option<usize>,
}

/// Ordered device profiles plus the current selection.
#[derive(Debug)]
pub struct DeviceRegistry {
    path: PathBuf,
    devices: Vec<DeviceProfile>,
    current: Option<usize>,
    subscribers: Vec<Sender<RegistryEvent>>,
}

impl DeviceRegistry {
    /// Load the registry at `path`.
    ///
    /// A missing file gives an empty registry. A corrupt one is renamed to
    /// `<file>.old` and also gives an empty registry.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut registry = Self {
            path,
            devices: Vec::new(),
            current: None,
            subscribers: Vec::new(),
        };

        match registry.read() {
            Ok(Some(file)) => {
                registry.devices = file.devices;
                registry.current = file
                    .current_device
                    .filter(|&index| index < registry.devices.len());
                info!(
                    "Loaded {} devices from {}",
                    registry.devices.len(),
                    registry.path.display()
                );
            }
            Ok(None) => debug!("No device registry at {}", registry.path.display()),
            Err(e) => registry.set_aside(&e),
        }
        registry
    }

    fn read(&self) -> Result<Option<RegistryFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| Error::registry(&self.path, e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::registry(&self.path, e))
    }

    fn set_aside(&self, cause: &Error) {
        let old = backup_path(&self.path);
        warn!(
            "Load settings failed: {}, renaming {} as {}",
            cause,
            self.path.display(),
            old.display()
        );
        if let Err(e) = fs::rename(&self.path, &old) {
            error!("Could not rename {}: {}", self.path.display(), e);
        }
    }

    /// Write the registry file, owner read/write only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let file = RegistryFile {
            devices: self.devices.clone(),
            current_device: self.current,
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| Error::registry(parent, e))?;
        }
        write_private(&self.path, content.as_bytes()).map_err(|e| Error::registry(&self.path, e))?;

        debug!("Saved {} devices to {}", self.devices.len(), self.path.display());
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            error!("Save settings failed: {}", e);
        }
    }

    /// Registry file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Configured devices, in order.
    #[must_use]
    pub fn devices(&self) -> &[DeviceProfile] {
        &self.devices
    }

    /// Index of the current device.
    #[must_use]
    pub const fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// The current device.
    #[must_use]
    pub fn current_device(&self) -> Option<&DeviceProfile> {
        self.current.and_then(|index| self.devices.get(index))
    }

    /// Receive change notifications.
    pub fn subscribe(&mut self) -> Receiver<RegistryEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.push(sender);
        receiver
    }

    fn notify(&mut self, event: RegistryEvent) {
        self.subscribers.retain(|sender| sender.send(event).is_ok());
    }

    /// Append a device (`index` of `None`) or replace the one at `index`,
    /// making it current. Returns its index.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeviceIndex`] if `index` is out of range.
    pub fn store_device(&mut self, profile: DeviceProfile, index: Option<usize>) -> Result<usize> {
        let (index, appended) = match index {
            None => {
                self.devices.push(profile);
                (self.devices.len() - 1, true)
            }
            Some(index) => {
                let len = self.devices.len();
                let slot = self
                    .devices
                    .get_mut(index)
                    .ok_or(Error::InvalidDeviceIndex { index, len })?;
                *slot = profile;
                (index, false)
            }
        };
        self.current = Some(index);
        info!("Stored device {} at index {}", self.devices[index].name, index);

        self.persist();
        if appended {
            self.notify(RegistryEvent::DeviceListChanged);
        }
        self.notify(RegistryEvent::CurrentDeviceChanged);
        Ok(index)
    }

    /// Remove the device at `index`, returning it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeviceIndex`] if `index` is out of range.
    pub fn delete_device(&mut self, index: usize) -> Result<DeviceProfile> {
        if index >= self.devices.len() {
            return Err(Error::InvalidDeviceIndex {
                index,
                len: self.devices.len(),
            });
        }
        let removed = self.devices.remove(index);
        self.current = match self.current {
            None => None,
            Some(_) if self.devices.is_empty() => None,
            Some(current) if current == index => Some(0),
            Some(current) if current > index => Some(current - 1),
            Some(current) => Some(current),
        };
        info!("Deleted device {}", removed.name);

        self.persist();
        self.notify(RegistryEvent::CurrentDeviceChanged);
        self.notify(RegistryEvent::DeviceListChanged);
        Ok(removed)
    }

    /// Select the current device without changing the list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeviceIndex`] if `index` is out of range.
    pub fn select_device(&mut self, index: usize) -> Result<()> {
        if index >= self.devices.len() {
            return Err(Error::InvalidDeviceIndex {
                index,
                len: self.devices.len(),
            });
        }
        self.current = Some(index);
        self.persist();
        self.notify(RegistryEvent::CurrentDeviceChanged);
        Ok(())
    }
}

/// `<file>.old` next to `path`.
fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".old");
    PathBuf::from(name)
}

#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(content)?;
    file.sync_all()
}
