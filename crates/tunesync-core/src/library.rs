//! Read access to the desktop music library's playlists.
//!
//! The library keeps one text file per playlist in a playlist directory, each
//! line the absolute path of a music file. File names may be percent-encoded
//! (`Road%20Trip`); the encoded form stays the identifier and the decoded
//! form is for display.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace};

use crate::config::LibraryConfig;
use crate::error::{Error, Result};

/// A playlist in the library.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibraryPlaylist {
    /// File name in the playlist directory, as stored.
    pub id: String,
    /// Percent-decoded name for display.
    pub name: String,
}

impl LibraryPlaylist {
    /// Create a playlist from its stored file name.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let name = decode_name(&id);
        Self { id, name }
    }
}

fn decode_name(id: &str) -> String {
    urlencoding::decode(id).map_or_else(|_| id.to_string(), std::borrow::Cow::into_owned)
}

/// One playlist member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryTrack {
    /// Path below the music root it was found in, `/`-separated.
    pub relative_path: String,
    /// Absolute path of the source file.
    pub source_path: PathBuf,
}

/// Lazily produced members of a playlist, in playlist order.
pub type Tracks<'a> = Box<dyn Iterator<Item = Result<LibraryTrack>> + 'a>;

/// Source of playlists to sync.
pub trait Library {
    /// All playlists, sorted by identifier.
    fn playlists(&self) -> Result<Vec<LibraryPlaylist>>;

    /// Members of `playlist` that lie inside a music root, in order.
    fn tracks(&self, playlist: &LibraryPlaylist) -> Result<Tracks<'_>>;
}

/// Library backed by a playlist directory on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLibrary {
    playlist_directory: PathBuf,
    music_roots: Vec<PathBuf>,
}

impl DirectoryLibrary {
    /// Create a library reader.
    pub fn new(playlist_directory: impl Into<PathBuf>, music_roots: Vec<PathBuf>) -> Self {
        Self {
            playlist_directory: playlist_directory.into(),
            music_roots,
        }
    }

    /// Create a library reader from configuration.
    #[must_use]
    pub fn from_config(config: &LibraryConfig) -> Self {
        Self::new(config.playlist_directory.clone(), config.music_roots.clone())
    }

    /// The playlist directory.
    #[must_use]
    pub fn playlist_directory(&self) -> &Path {
        &self.playlist_directory
    }

    /// Path of `source` below the first music root containing it.
    #[must_use]
    pub fn relativise(&self, source: &Path) -> Option<String> {
        self.music_roots.iter().find_map(|root| {
            let relative = source.strip_prefix(root).ok()?;
            to_slash_path(relative)
        })
    }
}

/// Render a relative path with `/` separators. Only plain components are allowed.
fn to_slash_path(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

impl Library for DirectoryLibrary {
    fn playlists(&self) -> Result<Vec<LibraryPlaylist>> {
        let entries = fs::read_dir(&self.playlist_directory)
            .map_err(|e| Error::library(&self.playlist_directory, e))?;

        let mut playlists = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::library(&self.playlist_directory, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            playlists.push(LibraryPlaylist::from_id(id));
        }
        playlists.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(
            "Found {} playlists in {}",
            playlists.len(),
            self.playlist_directory.display()
        );
        Ok(playlists)
    }

    fn tracks(&self, playlist: &LibraryPlaylist) -> Result<Tracks<'_>> {
        let path = self.playlist_directory.join(&playlist.id);
        let file = File::open(&path).map_err(|e| Error::library(&path, e))?;
        Ok(Box::new(TrackReader {
            library: self,
            path,
            lines: BufReader::new(file).lines(),
        }))
    }
}

struct TrackReader<'a> {
    library: &'a DirectoryLibrary,
    path: PathBuf,
    lines: Lines<BufReader<File>>,
}

impl Iterator for TrackReader<'_> {
    type Item = Result<LibraryTrack>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(Error::library(&self.path, e))),
            };
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let source_path = PathBuf::from(line);
            match self.library.relativise(&source_path) {
                Some(relative_path) => {
                    return Some(Ok(LibraryTrack {
                        relative_path,
                        source_path,
                    }));
                }
                None => trace!("Skipping {} outside the music roots", line),
            }
        }
    }
}
