//! SFTP transport over SSH, authenticated through the key agent.

use std::fs::File;
use std::io::{self, Read};
use std::net::TcpStream;
use std::path::Path;

use ssh2::{ErrorCode, Session, Sftp};
use tracing::{debug, info};

use super::{DirRemoval, StorageSpace, Transport, TransportResult, split_lines};
use crate::error::TransportError;

const FX_NO_SUCH_FILE: i32 = 2;
const FX_FAILURE: i32 = 4;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_DIR_NOT_EMPTY: i32 = 18;

/// Transport over an SFTP channel.
pub struct SftpTransport {
    host: String,
    user: String,
    port: u16,
    session: Option<(Session, Sftp)>,
}

impl SftpTransport {
    /// Create an unconnected SFTP transport.
    pub fn new(host: &str, user: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            port,
            session: None,
        }
    }

    fn sftp(&self) -> TransportResult<&Sftp> {
        self.session
            .as_ref()
            .map(|(_, sftp)| sftp)
            .ok_or_else(|| TransportError::new(format!("not connected to {}", self.host)))
    }

    fn connect(&self) -> Result<(Session, Sftp), TransportError> {
        let mut session = Session::new().map_err(|e| TransportError::at("session", &self.host, e))?;

        let mut agent = session
            .agent()
            .map_err(|e| TransportError::at("ssh-agent", &self.host, e))?;
        agent
            .connect()
            .map_err(|e| TransportError::at("ssh-agent", &self.host, e))?;
        agent
            .list_identities()
            .map_err(|e| TransportError::at("ssh-agent", &self.host, e))?;
        let identities = agent
            .identities()
            .map_err(|e| TransportError::at("ssh-agent", &self.host, e))?;
        let [identity] = identities.as_slice() else {
            return Err(TransportError::new("Failed to get a private key from ssh-agent"));
        };

        let address = format!("{}:{}", self.host, self.port);
        let tcp = TcpStream::connect(&address).map_err(|e| TransportError::at("connect", &address, e))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| TransportError::at("handshake", &address, e))?;
        agent
            .userauth(&self.user, identity)
            .map_err(|e| TransportError::at("authenticate", &self.user, e))?;
        let sftp = session
            .sftp()
            .map_err(|e| TransportError::at("sftp", &address, e))?;
        Ok((session, sftp))
    }
}

fn sftp_code(err: &ssh2::Error) -> Option<i32> {
    match err.code() {
        ErrorCode::SFTP(code) => Some(code),
        _ => None,
    }
}

impl Transport for SftpTransport {
    fn open(&mut self) -> TransportResult<()> {
        let connected = self.connect()?;
        info!("Connected to sftp://{}@{}:{}", self.user, self.host, self.port);
        self.session = Some(connected);
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> TransportResult<bool> {
        match self.sftp()?.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            Err(e) if matches!(sftp_code(&e), Some(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH)) => Ok(false),
            Err(e) => Err(TransportError::at("stat", path, e)),
        }
    }

    fn make_dir(&mut self, path: &str) -> TransportResult<()> {
        self.sftp()?
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| TransportError::at("mkdir", path, e))
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()> {
        let mut source = File::open(local_path)
            .map_err(|e| TransportError::at("open", &local_path.display().to_string(), e))?;
        let mut remote = self
            .sftp()?
            .create(Path::new(remote_path))
            .map_err(|e| TransportError::at("create", remote_path, e))?;
        let bytes = io::copy(&mut source, &mut remote)
            .map_err(|e| TransportError::at("write", remote_path, e))?;
        debug!("Wrote {} bytes to {}", bytes, remote_path);
        Ok(())
    }

    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let mut file = self
            .sftp()?
            .open(Path::new(path))
            .map_err(|e| TransportError::at("open", path, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| TransportError::at("read", path, e))?;
        Ok(split_lines(&String::from_utf8_lossy(&bytes)))
    }

    fn remove_file(&mut self, path: &str) -> TransportResult<()> {
        self.sftp()?
            .unlink(Path::new(path))
            .map_err(|e| TransportError::at("unlink", path, e))
    }

    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval {
        let sftp = match self.sftp() {
            Ok(sftp) => sftp,
            Err(e) => return DirRemoval::Failed(e.message),
        };
        match sftp.rmdir(Path::new(path)) {
            Ok(()) => DirRemoval::Removed,
            // most servers report a non-empty directory as a generic failure
            Err(e) if matches!(sftp_code(&e), Some(FX_FAILURE | FX_DIR_NOT_EMPTY)) => {
                DirRemoval::NotEmpty
            }
            Err(e) => DirRemoval::Failed(format!("{path}: {e}")),
        }
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|e| TransportError::at("readdir", path, e))?;
        Ok(entries
            .iter()
            .filter_map(|(entry, _)| entry.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    fn storage_space(&mut self, _path: &str) -> TransportResult<StorageSpace> {
        Ok(StorageSpace::unknown())
    }

    fn flush(&mut self, _root: &str) -> TransportResult<()> {
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        if let Some((session, sftp)) = self.session.take() {
            drop(sftp);
            session
                .disconnect(None, "closing", None)
                .map_err(|e| TransportError::at("disconnect", &self.host, e))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sftp(host={},user={},port={})", self.host, self.user, self.port)
    }
}
