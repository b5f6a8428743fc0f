//! Session metadata and lifecycle state.
//!
//! A [`Session`] pairs one [`PtyProcess`] with the data needed to address and
//! own it. The process handle never leaves the session: callers go through
//! the session's own write, resize and kill operations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::multiplexer::SubscriberStats;
use super::pty::{PtyError, PtyProcess};

/// Caller-chosen session identifier.
pub type SessionId = String;

/// Identifier of the user owning a session.
pub type OwnerId = String;

/// Addresses one incarnation of a session.
///
/// Replacing a session keeps its id but bumps the instance, so anything bound
/// to the old incarnation cannot reach the new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Session identifier.
    pub id: SessionId,
    /// Registry-wide generation number.
    pub instance: u64,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.instance)
    }
}

/// Lifecycle of a session. Transitions only move forward out of `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The shell is running.
    Active,
    /// The shell exited on its own, with its exit code when known.
    Exited(Option<i32>),
    /// The shell was force-terminated.
    Killed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Active => write!(f, "active"),
            SessionState::Exited(Some(code)) => write!(f, "exited({})", code),
            SessionState::Exited(None) => write!(f, "exited"),
            SessionState::Killed => write!(f, "killed"),
        }
    }
}

/// Snapshot of a session, safe to hand out and serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier.
    pub id: SessionId,
    /// Owner of the session.
    pub owner_id: OwnerId,
    /// Generation number of this incarnation.
    pub instance: u64,
    /// Directory the shell started in.
    pub cwd: String,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Lifecycle state.
    pub state: SessionState,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Seconds since the last input or output.
    pub idle_secs: u64,
    /// Delivery statistics per subscriber, when requested.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<SubscriberStats>,
}

/// One live shell bound to a pseudo-terminal.
pub struct Session {
    key: SessionKey,
    owner_id: OwnerId,
    cwd: PathBuf,
    created_at: SystemTime,
    process: PtyProcess,
    state: Mutex<SessionState>,
    /// Last input or output, Unix epoch milliseconds.
    last_activity: AtomicU64,
}

impl Session {
    pub(crate) fn new(key: SessionKey, owner_id: OwnerId, cwd: PathBuf, process: PtyProcess) -> Self {
        Self {
            key,
            owner_id,
            cwd,
            created_at: SystemTime::now(),
            process,
            state: Mutex::new(SessionState::Active),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.key.id
    }

    /// Returns the incarnation key.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Returns the generation number.
    pub fn instance(&self) -> u64 {
        self.key.instance
    }

    /// Returns the owner.
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Returns the working directory the shell started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the creation time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Returns the process ID of the shell.
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.process.size()
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns whether the session is `Active`.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Time since the last input or output.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Records activity on the session.
    pub(crate) fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    /// Forwards bytes to the shell's stdin.
    pub(crate) async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.touch();
        self.process.write(data).await
    }

    /// Resizes the terminal.
    pub(crate) fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.process.resize(cols, rows)
    }

    /// Signals the shell (default `SIGKILL`) and moves to `Killed`.
    ///
    /// Returns false if the session had already left `Active`. The shell may
    /// survive a catchable signal; see [`Session::force_kill`].
    pub(crate) fn kill(&self, signal: Option<i32>) -> Result<bool, PtyError> {
        if !self.transition(SessionState::Killed) {
            return Ok(false);
        }
        self.process.kill(signal)?;
        Ok(true)
    }

    /// Sends `SIGKILL` regardless of the lifecycle state.
    pub(crate) fn force_kill(&self) -> Result<(), PtyError> {
        self.process.kill(None)
    }

    /// Returns whether the shell process has not been reaped yet.
    pub fn is_running(&self) -> bool {
        self.process.is_running()
    }

    /// Moves to `Exited(code)`.
    ///
    /// Returns false if the session had already left `Active`, e.g. because
    /// it was killed first.
    pub(crate) fn mark_exited(&self, code: Option<i32>) -> bool {
        self.transition(SessionState::Exited(code))
    }

    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != SessionState::Active {
            return false;
        }
        *state = next;
        true
    }

    /// Returns a serializable snapshot.
    pub fn info(&self) -> SessionInfo {
        let (cols, rows) = self.size();
        SessionInfo {
            id: self.key.id.clone(),
            owner_id: self.owner_id.clone(),
            instance: self.key.instance,
            cwd: self.cwd.display().to_string(),
            pid: self.pid(),
            cols,
            rows,
            state: self.state(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            idle_secs: self.idle_for().as_secs(),
            subscribers: Vec::new(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("owner_id", &self.owner_id)
            .field("cwd", &self.cwd)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pty::SpawnOptions;

    fn spawn_session(id: &str) -> Session {
        let cwd = std::env::temp_dir();
        let opts = SpawnOptions::new(cwd.clone(), 80, 24).with_shell("/bin/sh");
        let (process, _rx) = PtyProcess::spawn(opts).unwrap();
        let key = SessionKey {
            id: id.to_string(),
            instance: 1,
        };
        Session::new(key, "owner-1".to_string(), cwd, process)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Active.to_string(), "active");
        assert_eq!(SessionState::Exited(Some(3)).to_string(), "exited(3)");
        assert_eq!(SessionState::Exited(None).to_string(), "exited");
        assert_eq!(SessionState::Killed.to_string(), "killed");
    }

    #[test]
    fn test_key_display() {
        let key = SessionKey {
            id: "s1".to_string(),
            instance: 7,
        };
        assert_eq!(key.to_string(), "s1#7");
    }

    #[tokio::test]
    async fn test_new_session_is_active() {
        let session = spawn_session("state-active");
        assert!(session.is_active());
        assert_eq!(session.owner_id(), "owner-1");
        assert_eq!(session.instance(), 1);
        assert!(session.pid().is_some());

        let _ = session.kill(None);
    }

    #[tokio::test]
    async fn test_kill_transitions_once() {
        let session = spawn_session("state-kill");

        assert!(session.kill(None).unwrap());
        assert_eq!(session.state(), SessionState::Killed);

        // No resurrection and no second transition.
        assert!(!session.kill(None).unwrap());
        assert!(!session.mark_exited(Some(0)));
        assert_eq!(session.state(), SessionState::Killed);
    }

    #[tokio::test]
    async fn test_force_kill_after_ignored_signal() {
        let session = spawn_session("state-force");

        // Signal 0 never terminates anything, yet the session has left
        // `Active`; only force_kill can end the shell now.
        assert!(session.kill(Some(0)).is_err());
        assert_eq!(session.state(), SessionState::Killed);
        assert!(session.is_running());

        session.force_kill().unwrap();
        for _ in 0..50 {
            if !session.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_exit_then_kill_is_noop() {
        let session = spawn_session("state-exit");

        assert!(session.mark_exited(Some(0)));
        assert_eq!(session.state(), SessionState::Exited(Some(0)));
        assert!(!session.kill(None).unwrap());

        let _ = session.process.kill(None);
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let session = spawn_session("state-info");
        let info = session.info();

        assert_eq!(info.id, "state-info");
        assert_eq!(info.owner_id, "owner-1");
        assert_eq!((info.cols, info.rows), (80, 24));
        assert_eq!(info.state, SessionState::Active);
        assert!(info.created_at > 0);

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"state\":\"active\""));

        let _ = session.kill(None);
    }
}
