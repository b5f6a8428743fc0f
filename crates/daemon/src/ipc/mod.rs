//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! The CLI uses this channel to query and control a running gateway: status,
//! session listing, killing sessions and stopping the daemon.
//!
//! ## Overview
//!
//! The IPC system uses a JSON newline-delimited protocol. Each message is a
//! single JSON object followed by a newline.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptygate/daemon.sock`
//! - Fallback: `/tmp/ptygate-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{IpcClient, get_socket_path};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!
//!     if client.ping().await? {
//!         println!("Daemon is running");
//!     }
//!
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::IpcClient;
pub use messages::{IpcRequest, IpcResponse};
pub use pidfile::{get_daemon_pid, get_pid_file_path, is_daemon_running, PidFile};
pub use server::{IpcConnection, IpcError, IpcServer};

use std::path::PathBuf;

/// Name of the per-user runtime directory.
const APP_DIR: &str = "ptygate";

/// Get the socket path for IPC communication.
///
/// 1. If `$XDG_RUNTIME_DIR` is set: `$XDG_RUNTIME_DIR/ptygate/daemon.sock`
/// 2. Otherwise: `/tmp/ptygate-$UID/daemon.sock`
pub fn get_socket_path() -> PathBuf {
    match std::env::var("XDG_RUNTIME_DIR") {
        Ok(runtime_dir) if !runtime_dir.is_empty() => {
            PathBuf::from(runtime_dir).join(APP_DIR).join("daemon.sock")
        }
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/{}-{}", APP_DIR, uid)).join("daemon.sock")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_get_socket_path_with_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        let path = get_socket_path();
        assert_eq!(path, PathBuf::from("/run/user/1000/ptygate/daemon.sock"));

        match original {
            Some(val) => std::env::set_var("XDG_RUNTIME_DIR", val),
            None => std::env::remove_var("XDG_RUNTIME_DIR"),
        }
    }

    #[test]
    #[serial]
    fn test_get_socket_path_without_xdg_runtime_dir() {
        let original = std::env::var("XDG_RUNTIME_DIR").ok();

        std::env::remove_var("XDG_RUNTIME_DIR");
        let path = get_socket_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.starts_with("/tmp/ptygate-"));
        assert!(path_str.ends_with("/daemon.sock"));

        if let Some(val) = original {
            std::env::set_var("XDG_RUNTIME_DIR", val);
        }
    }

    #[test]
    #[serial]
    fn test_socket_path_shape() {
        let path = get_socket_path();
        assert!(path.is_absolute());
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("sock"));
    }
}
