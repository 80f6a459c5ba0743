//! FTP transport.
//!
//! FTP has no stat command, so existence is answered from a listing of the
//! parent directory. Replies with an error status from the server are read
//! as "not there"; only broken connections are transport errors.

use std::fs::File;
use std::path::Path;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info};

use super::{DirRemoval, StorageSpace, Transport, TransportResult, split_lines};
use crate::error::TransportError;
use crate::paths;

/// Transport over an FTP control connection.
pub struct FtpTransport {
    host: String,
    user: String,
    password: String,
    port: u16,
    stream: Option<FtpStream>,
}

impl FtpTransport {
    /// Create an unconnected FTP transport.
    pub fn new(host: &str, user: &str, password: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            port,
            stream: None,
        }
    }

    fn stream(&mut self) -> TransportResult<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| TransportError::new(format!("not connected to {}", self.host)))
    }

    /// List `dir`, reducing server replies to base names.
    fn names_in(&mut self, dir: &str) -> Result<Vec<String>, FtpError> {
        let stream = self.stream().map_err(|e| {
            FtpError::ConnectionError(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                e.message,
            ))
        })?;
        let target = if dir.is_empty() { None } else { Some(dir) };
        let entries = stream.nlst(target)?;
        // servers answer with relative or absolute names
        Ok(entries
            .iter()
            .map(|entry| paths::file_name(entry).to_string())
            .collect())
    }
}

fn ftp_error(operation: &str, path: &str, err: FtpError) -> TransportError {
    TransportError::at(operation, path, err)
}

impl Transport for FtpTransport {
    fn open(&mut self) -> TransportResult<()> {
        let mut stream = FtpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| ftp_error("connect", &self.host, e))?;
        stream
            .login(self.user.as_str(), self.password.as_str())
            .map_err(|e| ftp_error("login", &self.user, e))?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| ftp_error("binary mode", &self.host, e))?;
        info!("Connected to ftp://{}@{}:{}", self.user, self.host, self.port);
        self.stream = Some(stream);
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> TransportResult<bool> {
        match self.names_in(paths::parent(path)) {
            Ok(names) => Ok(names.iter().any(|name| name == paths::file_name(path))),
            Err(FtpError::UnexpectedResponse(_)) => {
                debug!("Listing parent of {} refused", path);
                Ok(false)
            }
            Err(e) => Err(ftp_error("list", path, e)),
        }
    }

    fn make_dir(&mut self, path: &str) -> TransportResult<()> {
        self.stream()?
            .mkdir(path)
            .map_err(|e| ftp_error("mkdir", path, e))
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()> {
        let mut file = File::open(local_path)
            .map_err(|e| TransportError::at("open", &local_path.display().to_string(), e))?;
        let bytes = self
            .stream()?
            .put_file(remote_path, &mut file)
            .map_err(|e| ftp_error("store", remote_path, e))?;
        debug!("Stored {} bytes at {}", bytes, remote_path);
        Ok(())
    }

    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let buffer = self
            .stream()?
            .retr_as_buffer(path)
            .map_err(|e| ftp_error("retrieve", path, e))?;
        Ok(split_lines(&String::from_utf8_lossy(buffer.get_ref())))
    }

    fn remove_file(&mut self, path: &str) -> TransportResult<()> {
        self.stream()?
            .rm(path)
            .map_err(|e| ftp_error("delete", path, e))
    }

    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval {
        let stream = match self.stream() {
            Ok(stream) => stream,
            Err(e) => return DirRemoval::Failed(e.message),
        };
        match stream.rmdir(path) {
            Ok(()) => DirRemoval::Removed,
            // a refused RMD almost always means the directory still has entries
            Err(FtpError::UnexpectedResponse(_)) => DirRemoval::NotEmpty,
            Err(e) => DirRemoval::Failed(format!("{path}: {e}")),
        }
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        self.names_in(path).map_err(|e| ftp_error("list", path, e))
    }

    fn storage_space(&mut self, _path: &str) -> TransportResult<StorageSpace> {
        Ok(StorageSpace::unknown())
    }

    fn flush(&mut self, _root: &str) -> TransportResult<()> {
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.quit().map_err(|e| ftp_error("quit", &self.host, e))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ftp(host={},user={},port={})", self.host, self.user, self.port)
    }
}
