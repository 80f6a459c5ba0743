//! `Tunesync` Core Library
//!
//! This crate keeps portable music players in step with a desktop library's
//! playlists:
//! - Pluggable transports (mounted filesystem, FTP, SFTP, adb)
//! - Device playlist scanning and on-device path layout
//! - Reconciliation of wanted playlists into copy and delete operations
//! - A background batch executor with progress reporting and cancellation
//! - A persisted device registry with change notifications
//! - Application configuration and structured logging
//!
//! # Error Handling
//!
//! Transport backends report every failure as a [`TransportError`]; the
//! crate-wide [`Error`] wraps it together with library, registry and
//! configuration failures. See the [`error`] module.
//!
//! ```rust,ignore
//! use tunesync_core::{Device, DirectoryLibrary, NoopSink, Result, Syncer};
//!
//! fn sync(mut device: Device, library: DirectoryLibrary) -> Result<()> {
//!     let mut syncer = Syncer::new(library)?;
//!     syncer.scan_device(&mut device)?;
//!     let wanted = vec![true; syncer.playlists().len()];
//!     let outcome = syncer.sync_device(device, &wanted, Box::new(NoopSink)).join();
//!     outcome.result.map(|_| ())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod library;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod registry;
pub mod sync;
pub mod transport;

pub use config::{AppConfig, LibraryConfig, default_playlist_directory, default_registry_path};
pub use device::{Device, DeviceProfile, PLAYLIST_DIRECTORY, PLAYLIST_EXTENSION};
pub use error::{Error, Result, TransportError};
pub use executor::{
    BatchExecutor, CancellationToken, ChannelSink, ExecutionReport, ExecutorState, NoopSink,
    ProgressSink, SyncEvent,
};
pub use library::{DirectoryLibrary, Library, LibraryPlaylist, LibraryTrack, Tracks};
pub use logging::{LogRotation, LoggingConfig, LoggingError, LoggingGuard};
pub use queue::{CopyOperation, DeleteOperation, Operation, OperationQueue};
pub use registry::{DeviceRegistry, RegistryEvent};
pub use sync::{SyncHandle, SyncOutcome, Syncer};
pub use transport::{
    AdbTransport, CommandOutput, CommandRunner, DirRemoval, FilesystemTransport, FtpTransport,
    SftpTransport, StorageSpace, SystemCommandRunner, Transport, TransportConfig,
    TransportResult,
};
