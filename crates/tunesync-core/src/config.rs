//! Application configuration management.
//!
//! Handles loading and saving the settings that locate the music library and
//! the device registry.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

const APP_DIRECTORY: &str = "tunesync";

/// Where the desktop library keeps its playlists and music.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryConfig {
    /// Directory with one file per library playlist.
    #[serde(default = "default_playlist_directory")]
    pub playlist_directory: PathBuf,
    /// Directories under which music files count as part of the library.
    #[serde(default)]
    pub music_roots: Vec<PathBuf>,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            playlist_directory: default_playlist_directory(),
            music_roots: Vec::new(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Library locations.
    #[serde(default)]
    pub library: LibraryConfig,
    /// Device registry file, when not in the default place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, or defaults if there is no file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Configuration(format!("Failed to parse {}: {e}", path.display()))
        })?;

        info!("Loaded config from {}", path.display());
        debug!(
            "Library playlists at {}, {} music roots",
            config.library.playlist_directory.display(),
            config.library.music_roots.len()
        );
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Configuration(format!(
                    "Failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|e| {
            Error::Configuration(format!("Failed to write {}: {e}", path.display()))
        })?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Check that every configured path is absolute.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] naming the first relative path.
    pub fn validate(&self) -> Result<()> {
        require_absolute("Playlist directory", &self.library.playlist_directory)?;
        for root in &self.library.music_roots {
            require_absolute("Music root", root)?;
        }
        if let Some(registry) = &self.registry_path {
            require_absolute("Registry path", registry)?;
        }
        Ok(())
    }

    /// The registry file to use.
    #[must_use]
    pub fn registry_file(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(default_registry_path)
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

fn require_absolute(what: &str, path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(Error::Configuration(format!(
            "{what} must be an absolute path: {}",
            path.display()
        )))
    }
}

fn app_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIRECTORY)
}

/// Get the default library playlist directory.
#[must_use]
pub fn default_playlist_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quodlibet")
        .join("playlists")
}

/// Get the default device registry file.
#[must_use]
pub fn default_registry_path() -> PathBuf {
    app_config_dir().join("devices.json")
}

/// Get the path to the config file.
fn config_file_path() -> PathBuf {
    app_config_dir().join("config.json")
}
