//! Android transport driving the `adb` command-line tool.
//!
//! Every operation is one subprocess. Its exit status and standard error
//! decide success, so the process launch sits behind [`CommandRunner`].

use std::io;
use std::path::Path;
use std::process::Command;

use tracing::{debug, info, warn};

use super::{DirRemoval, StorageSpace, Transport, TransportResult, split_lines};
use crate::error::TransportError;

const MEDIA_SCANNER_ACTION: &str = "android.intent.action.MEDIA_SCANNER_SCAN_FILE";
const KILOBYTE: u64 = 1024;

/// Captured result of one finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited successfully.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a process that exited with `code`.
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: code == 0,
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// Launches external programs and waits for them to finish.
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send {
    /// Run `program` with `args`, capturing its output.
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Quote `arg` for the device's POSIX shell.
fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Transport for an Android device reached through `adb`.
pub struct AdbTransport {
    program: String,
    serial: Option<String>,
    device_root: String,
    runner: Box<dyn CommandRunner>,
}

impl AdbTransport {
    /// Create a transport. `serial` selects the device when several are attached.
    pub fn new(
        program: &str,
        serial: Option<String>,
        device_root: &str,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        Self {
            program: program.to_string(),
            serial,
            device_root: device_root.to_string(),
            runner,
        }
    }

    fn invoke(&self, args: &[&str]) -> TransportResult<CommandOutput> {
        let mut full: Vec<String> = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|arg| (*arg).to_string()));
        debug!("Running {} {}", self.program, full.join(" "));
        self.runner
            .run(&self.program, &full)
            .map_err(|e| TransportError::at("run", &self.program, e))
    }

    /// Run a shell command on the device, quoting each word.
    fn shell(&self, words: &[&str]) -> TransportResult<CommandOutput> {
        let command = words
            .iter()
            .enumerate()
            .map(|(i, word)| if i == 0 { (*word).to_string() } else { shell_quote(word) })
            .collect::<Vec<_>>()
            .join(" ");
        self.invoke(&["shell", &command])
    }

    /// Run a command and fail unless it exits cleanly.
    fn checked(operation: &str, path: &str, output: CommandOutput) -> TransportResult<CommandOutput> {
        if output.success {
            Ok(output)
        } else {
            let reason = match output.stderr.trim() {
                "" => match output.code {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                },
                stderr => stderr.to_string(),
            };
            Err(TransportError::at(operation, path, reason))
        }
    }
}

/// Parse the last line of `df -k` output: total in column 1, available in column 3.
fn parse_df(stdout: &str) -> Option<StorageSpace> {
    let line = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let columns: Vec<&str> = line.split_whitespace().collect();
    let total: u64 = columns.get(1)?.parse().ok()?;
    let available: u64 = columns.get(3)?.parse().ok()?;
    Some(StorageSpace::from_bytes(available * KILOBYTE, total * KILOBYTE))
}

impl Transport for AdbTransport {
    fn open(&mut self) -> TransportResult<()> {
        let output = Self::checked("get-state", &self.describe(), self.invoke(&["get-state"])?)?;
        let state = output.stdout.trim();
        if state != "device" {
            return Err(TransportError::at(
                "get-state",
                &self.describe(),
                format!("device is {state}"),
            ));
        }
        info!("Connected to {}", self.describe());
        Ok(())
    }

    fn path_exists(&mut self, path: &str) -> TransportResult<bool> {
        let output = self.shell(&["test", "-e", path])?;
        if !output.stderr.trim().is_empty() {
            return Err(TransportError::at("test", path, output.stderr.trim()));
        }
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            other => Err(TransportError::at("test", path, format!("exit status {other:?}"))),
        }
    }

    fn make_dir(&mut self, path: &str) -> TransportResult<()> {
        Self::checked("mkdir", path, self.shell(&["mkdir", path])?).map(|_| ())
    }

    fn upload_file(&mut self, local_path: &Path, remote_path: &str) -> TransportResult<()> {
        let local = local_path.to_string_lossy();
        Self::checked("push", remote_path, self.invoke(&["push", &local, remote_path])?)?;
        debug!("Pushed {} to {}", local, remote_path);
        Ok(())
    }

    fn read_lines(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let output = Self::checked("cat", path, self.shell(&["cat", path])?)?;
        Ok(split_lines(&output.stdout))
    }

    fn remove_file(&mut self, path: &str) -> TransportResult<()> {
        Self::checked("rm", path, self.shell(&["rm", path])?).map(|_| ())
    }

    fn remove_dir_if_empty(&mut self, path: &str) -> DirRemoval {
        match self.shell(&["rmdir", path]) {
            Ok(output) if output.success => DirRemoval::Removed,
            Ok(output) if output.stderr.to_lowercase().contains("not empty") => DirRemoval::NotEmpty,
            Ok(output) => DirRemoval::Failed(format!("{path}: {}", output.stderr.trim())),
            Err(e) => DirRemoval::Failed(e.message),
        }
    }

    fn list(&mut self, path: &str) -> TransportResult<Vec<String>> {
        let output = Self::checked("ls", path, self.shell(&["ls", "-1", path])?)?;
        Ok(split_lines(&output.stdout)
            .into_iter()
            .map(|line| line.trim_end().to_string())
            .collect())
    }

    fn storage_space(&mut self, path: &str) -> TransportResult<StorageSpace> {
        let output = self.shell(&["df", "-k", path])?;
        if !output.success {
            debug!("df failed for {}: {}", path, output.stderr.trim());
            return Ok(StorageSpace::unknown());
        }
        Ok(parse_df(&output.stdout).unwrap_or_else(StorageSpace::unknown))
    }

    fn flush(&mut self, root: &str) -> TransportResult<()> {
        Self::checked("sync", root, self.invoke(&["shell", "sync"])?)?;
        let uri = format!("file://{}", self.device_root);
        let broadcast = self.shell(&["am", "broadcast", "-a", MEDIA_SCANNER_ACTION, "-d", &uri])?;
        if broadcast.success {
            info!("Requested media rescan of {}", self.device_root);
        } else {
            warn!("Media rescan of {} failed: {}", self.device_root, broadcast.stderr.trim());
        }
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("adb(serial={})", self.serial.as_deref().unwrap_or("any"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    fn transport(runner: MockCommandRunner) -> AdbTransport {
        AdbTransport::new("adb", Some("R58M".to_string()), "/sdcard", Box::new(runner))
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("Guns N' Roses"), r"'Guns N'\'' Roses'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn test_open_requires_device_state() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("adb"), eq(args(&["-s", "R58M", "get-state"])))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::exited(0, "device\n", "")));
        assert!(transport(runner).open().is_ok());
    }

    #[test]
    fn test_open_rejects_offline_device() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::exited(0, "offline\n", "")));
        let err = transport(runner).open().expect_err("offline");
        assert!(err.message.contains("device is offline"));
    }

    #[test]
    fn test_path_exists_maps_exit_codes() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|_, a| a.last().is_some_and(|c| c == "test '-e' '/sdcard/Music/a.mp3'"))
            .returning(|_, _| Ok(CommandOutput::exited(0, "", "")));
        runner
            .expect_run()
            .withf(|_, a| a.last().is_some_and(|c| c == "test '-e' '/sdcard/Music/gone.mp3'"))
            .returning(|_, _| Ok(CommandOutput::exited(1, "", "")));
        let mut adb = transport(runner);

        assert!(adb.path_exists("/sdcard/Music/a.mp3").expect("exists"));
        assert!(!adb.path_exists("/sdcard/Music/gone.mp3").expect("exists"));
    }

    #[test]
    fn test_path_exists_stderr_is_communication_failure() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::exited(1, "", "error: device not found")));
        let err = transport(runner).path_exists("/sdcard").expect_err("failure");
        assert!(err.message.contains("device not found"));
    }

    #[test]
    fn test_push_failure_reports_stderr() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(
                eq("adb"),
                eq(args(&["-s", "R58M", "push", "/tmp/a.mp3", "/sdcard/Music/a.mp3"])),
            )
            .returning(|_, _| Ok(CommandOutput::exited(1, "", "remote No space left on device")));
        let err = transport(runner)
            .upload_file(Path::new("/tmp/a.mp3"), "/sdcard/Music/a.mp3")
            .expect_err("push fails");
        assert_eq!(
            err.to_string(),
            "Error: push /sdcard/Music/a.mp3: remote No space left on device"
        );
    }

    #[test]
    fn test_spawn_failure_is_transport_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Err(io::Error::new(io::ErrorKind::NotFound, "no adb")));
        assert!(transport(runner).remove_file("/sdcard/a.mp3").is_err());
    }

    #[test]
    fn test_remove_dir_distinguishes_not_empty() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Ok(CommandOutput::exited(
                1,
                "",
                "rmdir failed for /sdcard/Music, Directory not empty",
            ))
        });
        assert_eq!(
            transport(runner).remove_dir_if_empty("/sdcard/Music"),
            DirRemoval::NotEmpty
        );

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::exited(1, "", "Permission denied")));
        assert!(matches!(
            transport(runner).remove_dir_if_empty("/sdcard/Music"),
            DirRemoval::Failed(_)
        ));
    }

    #[test]
    fn test_list_without_serial() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("adb"), eq(args(&["shell", "ls '-1' '/sdcard/Playlists'"])))
            .returning(|_, _| Ok(CommandOutput::exited(0, "A.m3u\r\nB.m3u\r\n", "")));
        let mut adb = AdbTransport::new("adb", None, "/sdcard", Box::new(runner));

        assert_eq!(adb.list("/sdcard/Playlists").expect("list"), vec!["A.m3u", "B.m3u"]);
        assert_eq!(adb.describe(), "adb(serial=any)");
    }

    #[test]
    fn test_storage_space_parses_df() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, _| {
            Ok(CommandOutput::exited(
                0,
                "Filesystem     1K-blocks    Used Available Use% Mounted on\n\
                 /dev/fuse       8388608 6291456   2097152  75% /storage/emulated\n",
                "",
            ))
        });
        let space = transport(runner).storage_space("/sdcard").expect("storage");
        assert_eq!(space.total_gb, Some(8.0));
        assert_eq!(space.available_gb, Some(2.0));
    }

    #[test]
    fn test_storage_space_unknown_when_df_fails() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| Ok(CommandOutput::exited(1, "", "df: not found")));
        assert!(!transport(runner).storage_space("/sdcard").expect("storage").is_known());
    }

    #[test]
    fn test_flush_syncs_then_broadcasts_rescan() {
        let mut seq = mockall::Sequence::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .with(eq("adb"), eq(args(&["-s", "R58M", "shell", "sync"])))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::exited(0, "", "")));
        runner
            .expect_run()
            .withf(|_, a| {
                a.last().is_some_and(|c| {
                    c.starts_with("am 'broadcast'") && c.ends_with("'-d' 'file:///sdcard'")
                })
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(CommandOutput::exited(255, "", "Security exception")));

        assert!(transport(runner).flush("/sdcard/Music").is_ok());
    }
}
