//! PID file handling for daemon running detection.
//!
//! The PID file is stored at:
//! - `$XDG_DATA_HOME/ptygate/daemon.pid` if XDG_DATA_HOME is set
//! - `~/.local/share/ptygate/daemon.pid` otherwise
//!
//! ```rust
//! use daemon::ipc::pidfile::{is_daemon_running, get_daemon_pid};
//!
//! if is_daemon_running() {
//!     if let Some(pid) = get_daemon_pid() {
//!         println!("Daemon is already running with PID {}", pid);
//!     }
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Get the path to the daemon PID file.
pub fn get_pid_file_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local/share")
        });
    data_dir.join("ptygate").join("daemon.pid")
}

/// Check if a daemon process is currently running.
///
/// Cleans up stale PID files as a side effect.
pub fn is_daemon_running() -> bool {
    get_daemon_pid().is_some()
}

/// Get the PID of the running daemon, if any.
pub fn get_daemon_pid() -> Option<u32> {
    read_live_pid(&get_pid_file_path())
}

/// Reads the PID stored at `path` and returns it if that process is alive.
///
/// Unparseable files and files naming a dead process are removed.
fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            cleanup_stale_pid_file(path);
            None
        }
    }
}

/// Check if a process with the given PID exists.
///
/// Sends the null signal; EPERM still means the process exists.
fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn cleanup_stale_pid_file(path: &Path) {
    if fs::remove_file(path).is_ok() {
        tracing::debug!(path = %path.display(), "Removed stale PID file");
    }
}

/// Guard that owns the daemon PID file for the life of the process.
///
/// The file is written on [`PidFile::create`] and removed on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current process id to `path`.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if the file names another
    /// live process. A stale file is replaced.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let own_pid = std::process::id();

        if let Some(pid) = read_live_pid(&path) {
            if pid != own_pid {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("daemon already running with PID {}", pid),
                ));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", own_pid))?;

        tracing::debug!(path = %path.display(), pid = own_pid, "PID file written");
        Ok(Self { path })
    }

    /// Returns the PID file location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
