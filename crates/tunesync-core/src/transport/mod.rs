//! Pluggable transports that move files onto a device.
//!
//! Every backend implements the [`Transport`] trait with the same observable
//! behavior, whatever the failure modes underneath:
//! - [`FilesystemTransport`]: a locally mounted device, direct `std::fs` calls
//! - [`FtpTransport`]: an FTP server on the device
//! - [`SftpTransport`]: SSH file transfer with key-agent authentication
//! - [`AdbTransport`]: an Android device driven through the `adb` tool
//!
//! Backends are built from a persisted [`TransportConfig`] via
//! [`TransportConfig::build`]. All remote paths are `/`-separated strings.

pub mod adb;
pub mod filesystem;
pub mod ftp;
#[cfg(test)]
pub mod mock;
pub mod sftp;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::paths;

pub use adb::{AdbTransport, CommandOutput, CommandRunner, SystemCommandRunner};
pub use filesystem::FilesystemTransport;
pub use ftp::FtpTransport;
pub use sftp::SftpTransport;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Free and total storage of a device, in gigabytes, where knowable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSpace {
    /// Available space in GB.
    pub available_gb: Option<f64>,
    /// Total capacity in GB.
    pub total_gb: Option<f64>,
}

impl StorageSpace {
    /// Storage usage that the backend cannot report.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            available_gb: None,
            total_gb: None,
        }
    }

    /// Build from byte counts.
    #[must_use]
    pub fn from_bytes(available_bytes: u64, total_bytes: u64) -> Self {
        Self {
            available_gb: Some(available_bytes as f64 / BYTES_PER_GB),
            total_gb: Some(total_bytes as f64 / BYTES_PER_GB),
        }
    }

    /// Whether both figures are known.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        self.available_gb.is_some() && self.total_gb.is_some()
    }
}

impl fmt::Display for StorageSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.available_gb, self.total_gb) {
            (Some(available), Some(total)) => {
                write!(f, "{available:.1} GB free of {total:.1} GB")
            }
            _ => write!(f, "storage space unknown"),
        }
    }
}

/// Outcome of a best-effort directory removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirRemoval {
    /// The directory was empty and is gone.
    Removed,
    /// The directory still holds entries and was left alone.
    NotEmpty,
    /// Removal failed for another reason.
    Failed(String),
}

/// File and directory operations against one device storage medium.
///
/// A session is bracketed by [`open`](Transport::open) and
/// [`close`](Transport::close); callers close at most once per open.
pub trait Transport: Send {
    /// Establish the session.
    fn open(&mut self) -> TransportResult<()>;

    /// Whether `path` exists. Only communication failures are errors.
    fn path_exists(&mut self, path: &str) -> TransportResult<bool>;

    /// Create a single directory whose parent already exists.
    fn make_dir(&mut self, path: &str) -> TransportResult<()>;

    /// Create `path` and any missing ancestors. No-op if it already exists.
    fn make_dirs(&mut self, path: &str) -> TransportResult<()> {
        if path.is_empty() || self.path_exists(path)? {
            return Ok(());
        }
        let parent = paths::parent(path);
        if !parent.is_empty() && parent != path {
            self.make_dirs(parent)?;
        }
        self.make_dir(path)
    }

    /// Copy a local file to `remote_path`, overwriting whatever is there.
    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()>;

    /// Read a small text file as lines, line endings stripped, blank lines dropped.
    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>>;

    /// Remove a file.
    fn remove_file(&mut self, path: &str) -> TransportResult<()>;

    /// Remove a directory if it is empty.
    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval;

    /// List the base names of the entries in a directory.
    fn list(&mut self, path: &str) -> TransportResult<Vec<String>>;

    /// Free and total storage backing `path`, unknown where the backend can't tell.
    fn storage_space(&mut self, path: &str) -> TransportResult<StorageSpace>;

    /// Make writes under `root` durable or visible on the device.
    fn flush(&mut self, root: &str) -> TransportResult<()>;

    /// Release the session.
    fn close(&mut self) -> TransportResult<()>;

    /// Short human-readable description, without secrets.
    fn describe(&self) -> String;
}

/// Split text into lines, normalizing `\r\n` and dropping blank lines.
pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

const fn default_ftp_port() -> u16 {
    21
}

const fn default_sftp_port() -> u16 {
    22
}

fn default_adb_program() -> String {
    "adb".to_string()
}

fn default_android_root() -> String {
    "/sdcard".to_string()
}

/// Persisted choice of transport and its backend parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Locally mounted storage.
    #[default]
    Filesystem,
    /// FTP server.
    Ftp {
        /// Host name or address.
        host: String,
        /// Login user.
        user: String,
        /// Login password, stored in plain text.
        password: String,
        /// Control connection port.
        #[serde(default = "default_ftp_port")]
        port: u16,
    },
    /// SFTP over SSH, authenticated by the single identity held in the key agent.
    Sftp {
        /// Host name or address.
        host: String,
        /// Login user.
        user: String,
        /// SSH port.
        #[serde(default = "default_sftp_port")]
        port: u16,
    },
    /// Android device through the `adb` command-line tool.
    Adb {
        /// Device serial; `None` lets adb pick the only attached device.
        #[serde(default)]
        serial: Option<String>,
        /// Storage root on the device, the target of media rescans.
        #[serde(default = "default_android_root")]
        device_root: String,
        /// Program to invoke.
        #[serde(default = "default_adb_program")]
        adb_program: String,
    },
}

impl TransportConfig {
    /// FTP settings with the default port.
    pub fn ftp(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::Ftp {
            host: host.into(),
            user: user.into(),
            password: password.into(),
            port: default_ftp_port(),
        }
    }

    /// SFTP settings with the default port.
    pub fn sftp(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self::Sftp {
            host: host.into(),
            user: user.into(),
            port: default_sftp_port(),
        }
    }

    /// adb settings for a device serial.
    pub fn adb(serial: Option<String>) -> Self {
        Self::Adb {
            serial,
            device_root: default_android_root(),
            adb_program: default_adb_program(),
        }
    }

    /// The persisted kind tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Ftp { .. } => "ftp",
            Self::Sftp { .. } => "sftp",
            Self::Adb { .. } => "adb",
        }
    }

    /// Construct the transport this configuration describes. Nothing connects
    /// until [`Transport::open`].
    #[must_use]
    pub fn build(&self) -> Box<dyn Transport> {
        match self {
            Self::Filesystem => Box::new(FilesystemTransport::new()),
            Self::Ftp {
                host,
                user,
                password,
                port,
            } => Box::new(FtpTransport::new(host, user, password, *port)),
            Self::Sftp { host, user, port } => Box::new(SftpTransport::new(host, user, *port)),
            Self::Adb {
                serial,
                device_root,
                adb_program,
            } => Box::new(AdbTransport::new(
                adb_program,
                serial.clone(),
                device_root,
                Box::new(SystemCommandRunner),
            )),
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Ftp { host, user, port, .. } => write!(f, "ftp://{user}@{host}:{port}"),
            Self::Sftp { host, user, port } => write!(f, "sftp://{user}@{host}:{port}"),
            Self::Adb { serial, .. } => match serial {
                Some(serial) => write!(f, "adb:{serial}"),
                None => write!(f, "adb"),
            },
        }
    }
}
