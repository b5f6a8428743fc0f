//! PTY process adapter.
//!
//! This module hides pseudo-terminal allocation and shell spawning behind a
//! small handle: write, resize and kill, plus an ordered event channel that
//! carries output chunks followed by exactly one exit notification.
//!
//! Every process owns three OS threads: a reader (blocking PTY reads), a
//! writer (drains the input queue in order) and a waiter (reaps the child).
//! A slow or wedged session therefore never stalls another one.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the per-process event channel (output chunks + exit).
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the per-process input queue.
const INPUT_QUEUE_CAPACITY: usize = 256;

/// How long the waiter lets the reader drain after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Value of `TERM` exported to every shell.
const TERM: &str = "xterm-256color";

/// Errors raised while creating a PTY process.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The shell executable could not be located.
    #[error("shell not found: {0}")]
    ShellNotFound(String),

    /// The working directory does not exist or is not a directory.
    #[error("invalid working directory: {0}")]
    InvalidWorkingDirectory(String),

    /// The OS refused to create more processes or terminals.
    #[error("system resources exhausted: {0}")]
    ResourcesExhausted(String),

    /// Failed to allocate the pseudo-terminal.
    #[error("failed to open PTY: {0}")]
    Pty(String),

    /// Failed to start the shell process.
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// I/O error while wiring up the process threads.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by operations on a running PTY process.
#[derive(Error, Debug)]
pub enum PtyError {
    /// The process has exited; its terminal no longer accepts operations.
    #[error("process has exited")]
    Closed,

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Failed to signal the process.
    #[error("failed to kill process: {0}")]
    Kill(String),
}

/// How a process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal number, when known.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Status of a process that exited on its own with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Status of a process terminated by `signal`.
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

/// Events emitted by a PTY process, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of terminal output. Chunk boundaries are arbitrary.
    Output(Bytes),
    /// The process exited. Always the last event, emitted exactly once.
    Exit(ExitStatus),
}

/// Parameters for spawning a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell command. If None, uses $SHELL or /bin/sh.
    pub shell: Option<String>,
    /// Working directory for the shell.
    pub cwd: PathBuf,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    /// Options for `shell` started in `cwd` with the given geometry.
    pub fn new(cwd: impl Into<PathBuf>, cols: u16, rows: u16) -> Self {
        Self {
            shell: None,
            cwd: cwd.into(),
            cols,
            rows,
            env: Vec::new(),
        }
    }

    /// Set the shell command.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Sender slot shared by the reader and waiter threads.
///
/// Whoever emits the exit event takes the sender out, so no output can be
/// queued after it.
type EventSlot = Arc<Mutex<Option<mpsc::Sender<PtyEvent>>>>;

/// A shell process bound to a pseudo-terminal.
pub struct PtyProcess {
    /// Process ID of the shell.
    pid: Option<u32>,

    /// The PTY master handle, used for resizing.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Handle able to terminate the child without owning it.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Input queue drained by the writer thread.
    input_tx: mpsc::Sender<Bytes>,

    /// Set once the child has been reaped.
    exited: Arc<AtomicBool>,

    /// Current terminal size.
    cols: AtomicU32,
    rows: AtomicU32,
}

impl PtyProcess {
    /// Spawns a shell attached to a fresh pseudo-terminal.
    ///
    /// Returns the process handle and the receiver for its events. Never
    /// retries; retry policy belongs to the caller.
    pub fn spawn(opts: SpawnOptions) -> Result<(Self, mpsc::Receiver<PtyEvent>), SpawnError> {
        let shell = detect_shell(opts.shell);
        let shell_path =
            which::which(&shell).map_err(|_| SpawnError::ShellNotFound(shell.clone()))?;

        if !opts.cwd.is_dir() {
            return Err(SpawnError::InvalidWorkingDirectory(
                opts.cwd.display().to_string(),
            ));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| classify_error(e, SpawnError::Pty))?;

        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.cwd(&opts.cwd);
        cmd.env("TERM", TERM);
        for (key, value) in opts.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| classify_error(e, SpawnError::Spawn))?;

        // The reader only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Pty(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let slot: EventSlot = Arc::new(Mutex::new(Some(event_tx)));
        let exited = Arc::new(AtomicBool::new(false));

        let label = pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", label))
            .spawn({
                let slot = Arc::clone(&slot);
                move || {
                    read_loop(reader, slot);
                    let _ = done_tx.send(());
                }
            })?;

        std::thread::Builder::new()
            .name(format!("pty-writer-{}", label))
            .spawn(move || write_loop(writer, input_rx))?;

        std::thread::Builder::new()
            .name(format!("pty-waiter-{}", label))
            .spawn({
                let exited = Arc::clone(&exited);
                move || {
                    let exit = wait_for_exit(pid, child);
                    exited.store(true, Ordering::SeqCst);

                    if done_rx.recv_timeout(DRAIN_TIMEOUT).is_err() {
                        tracing::debug!(pid = ?pid, "PTY still open after exit, closing output");
                    }

                    let tx = lock(&slot).take();
                    if let Some(tx) = tx {
                        let _ = tx.blocking_send(PtyEvent::Exit(exit));
                    }
                }
            })?;

        tracing::debug!(
            pid = ?pid,
            shell = %shell_path.display(),
            cwd = %opts.cwd.display(),
            cols = opts.cols,
            rows = opts.rows,
            "Spawned PTY process"
        );

        let process = PtyProcess {
            pid,
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            exited,
            cols: AtomicU32::new(opts.cols as u32),
            rows: AtomicU32::new(opts.rows as u32),
        };

        Ok((process, event_rx))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::Relaxed) as u16,
            self.rows.load(Ordering::Relaxed) as u16,
        )
    }

    /// Returns whether the process has not been reaped yet.
    pub fn is_running(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Queues bytes for the shell's stdin.
    ///
    /// Writes are delivered in call order. Waits only when the input queue is
    /// full.
    pub async fn write(&self, data: Bytes) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Closed);
        }
        self.input_tx.send(data).await.map_err(|_| PtyError::Closed)
    }

    /// Informs the terminal of its new geometry.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.is_running() {
            return Err(PtyError::Closed);
        }

        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Resize(e.to_string()))?;

        self.cols.store(cols as u32, Ordering::Relaxed);
        self.rows.store(rows as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Terminates the process.
    ///
    /// Sends `signal` (default `SIGKILL`) to the shell's process group. Does
    /// not wait for the process to go away. Killing an exited process is a
    /// no-op.
    pub fn kill(&self, signal: Option<i32>) -> Result<(), PtyError> {
        if !self.is_running() {
            return Ok(());
        }

        let signal = match signal {
            Some(raw) => {
                Signal::try_from(raw).map_err(|e| PtyError::Kill(format!("signal {}: {}", raw, e)))?
            }
            None => Signal::SIGKILL,
        };

        let Some(pid) = self.pid else {
            return match lock(&self.killer).kill() {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(PtyError::Kill(e.to_string())),
            };
        };

        let pid = Pid::from_raw(pid as i32);

        // The shell leads its own session, so its pid is also the group id.
        match killpg(pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) | Err(Errno::EPERM) => match kill(pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(PtyError::Kill(e.to_string())),
            },
            Err(e) => Err(PtyError::Kill(e.to_string())),
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Reaps the shell and reports how it actually terminated.
fn wait_for_exit(pid: Option<u32>, mut child: Box<dyn portable_pty::Child + Send + Sync>) -> ExitStatus {
    let Some(raw) = pid else {
        return match child.wait() {
            Ok(status) => ExitStatus::code(status.exit_code() as i32),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to wait for shell");
                ExitStatus {
                    code: None,
                    signal: None,
                }
            }
        };
    };

    let pid = Pid::from_raw(raw as i32);
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return ExitStatus::code(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return ExitStatus::signaled(signal as i32),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(pid = raw, error = %e, "Failed to wait for shell");
                return ExitStatus {
                    code: None,
                    signal: None,
                };
            }
        }
    }
}

/// Reads the PTY until EOF and forwards every chunk, in order.
fn read_loop(mut reader: Box<dyn Read + Send>, slot: EventSlot) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO once the slave side is gone.
            Err(_) => break,
        };

        let chunk = Bytes::copy_from_slice(&buffer[..n]);
        let guard = lock(&slot);
        match guard.as_ref() {
            Some(tx) => {
                if tx.blocking_send(PtyEvent::Output(chunk)).is_err() {
                    break;
                }
            }
            None => break,
        }
    }
}

/// Drains the input queue into the PTY.
fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!(error = %e, "PTY writer closed");
            break;
        }
    }
}

/// Locks a mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Maps a portable-pty failure onto a spawn error, singling out resource
/// exhaustion.
fn classify_error(err: anyhow::Error, fallback: fn(String) -> SpawnError) -> SpawnError {
    let exhausted = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<std::io::Error>())
        .filter_map(|io| io.raw_os_error())
        .any(|code| {
            [Errno::EAGAIN, Errno::ENOMEM, Errno::EMFILE, Errno::ENFILE]
                .iter()
                .any(|errno| *errno as i32 == code)
        });

    if exhausted {
        SpawnError::ResourcesExhausted(err.to_string())
    } else {
        fallback(err.to_string())
    }
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_options() -> SpawnOptions {
        SpawnOptions::new(std::env::temp_dir(), 80, 24).with_shell("/bin/sh")
    }

    /// Collects output until `marker` shows up or the deadline passes.
    async fn read_until(rx: &mut mpsc::Receiver<PtyEvent>, marker: &str) -> (String, bool) {
        let mut output = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(PtyEvent::Output(data))) => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.contains(marker) {
                        return (output, true);
                    }
                }
                Ok(Some(PtyEvent::Exit(_))) | Ok(None) => break,
                Err(_) => {}
            }
        }
        (output, false)
    }

    /// Waits for the exit event, discarding output.
    async fn wait_exit(rx: &mut mpsc::Receiver<PtyEvent>) -> Option<ExitStatus> {
        let deadline = Duration::from_secs(5);
        timeout(deadline, async {
            while let Some(event) = rx.recv().await {
                if let PtyEvent::Exit(status) = event {
                    return Some(status);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_from_env() {
        let shell = detect_shell(None);
        assert!(!shell.is_empty());
    }

    #[tokio::test]
    async fn test_spawn() {
        let result = PtyProcess::spawn(sh_options());
        assert!(result.is_ok(), "Failed to spawn: {:?}", result.err());

        let (process, _rx) = result.unwrap();
        assert!(process.is_running());
        assert!(process.pid().is_some());
        assert_eq!(process.size(), (80, 24));

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_shell() {
        let opts = sh_options().with_shell("/definitely/not/a/shell");
        let result = PtyProcess::spawn(opts);
        assert!(matches!(result, Err(SpawnError::ShellNotFound(_))));
    }

    #[tokio::test]
    async fn test_spawn_invalid_cwd() {
        let mut opts = sh_options();
        opts.cwd = PathBuf::from("/definitely/not/a/directory");
        let result = PtyProcess::spawn(opts);
        assert!(matches!(result, Err(SpawnError::InvalidWorkingDirectory(_))));
    }

    #[tokio::test]
    async fn test_output_roundtrip() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process
            .write(Bytes::from_static(b"echo out$((6*7))\n"))
            .await
            .unwrap();

        let (output, found) = read_until(&mut rx, "out42").await;
        assert!(found, "Did not receive expected output: {:?}", output);

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_input_order_preserved() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process
            .write(Bytes::from_static(b"echo A$((1+1))\n"))
            .await
            .unwrap();
        process
            .write(Bytes::from_static(b"echo B$((2+1))\n"))
            .await
            .unwrap();

        let (output, found) = read_until(&mut rx, "B3").await;
        assert!(found, "Did not receive expected output: {:?}", output);
        let first = output.find("A2").expect("first command output missing");
        let second = output.find("B3").unwrap();
        assert!(first < second);

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_env_vars() {
        let opts = sh_options().with_env("PTYGATE_TEST_VAR", "test_value");
        let (process, mut rx) = PtyProcess::spawn(opts).unwrap();

        process
            .write(Bytes::from_static(b"echo \"[$PTYGATE_TEST_VAR]\"\n"))
            .await
            .unwrap();

        let (_, found) = read_until(&mut rx, "[test_value]").await;
        assert!(found, "Did not receive expected environment variable value");

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_term_exported() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process
            .write(Bytes::from_static(b"echo \"<$TERM>\"\n"))
            .await
            .unwrap();

        let (_, found) = read_until(&mut rx, "<xterm-256color>").await;
        assert!(found);

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_resize() {
        let (process, _rx) = PtyProcess::spawn(sh_options()).unwrap();

        let result = process.resize(160, 40);
        assert!(result.is_ok(), "Failed to resize: {:?}", result.err());
        assert_eq!(process.size(), (160, 40));

        process.kill(None).unwrap();
    }

    #[tokio::test]
    async fn test_natural_exit_reports_code() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process.write(Bytes::from_static(b"exit 42\n")).await.unwrap();

        let status = wait_exit(&mut rx).await.expect("no exit event");
        assert_eq!(status, ExitStatus::code(42));
        assert!(!process.is_running());

        // Nothing follows the exit event.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process.kill(None).unwrap();

        let status = wait_exit(&mut rx).await.expect("no exit event");
        assert_eq!(status.signal, Some(Signal::SIGKILL as i32));
        assert_eq!(status.code, None);
    }

    #[tokio::test]
    async fn test_hangup_reports_signal() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process.kill(Some(Signal::SIGHUP as i32)).unwrap();

        let status = wait_exit(&mut rx).await.expect("no exit event");
        assert_eq!(status, ExitStatus::signaled(Signal::SIGHUP as i32));
    }

    #[tokio::test]
    async fn test_ignored_signal_does_not_mask_exit_code() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process
            .write(Bytes::from_static(b"trap '' TERM; echo trap-$((1+1))\n"))
            .await
            .unwrap();
        let (_, found) = read_until(&mut rx, "trap-2").await;
        assert!(found, "trap was not installed");

        process.kill(Some(Signal::SIGTERM as i32)).unwrap();
        assert!(process.is_running());

        process.write(Bytes::from_static(b"exit 3\n")).await.unwrap();
        let status = wait_exit(&mut rx).await.expect("no exit event");
        assert_eq!(status, ExitStatus::code(3));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process.kill(None).unwrap();
        let _ = wait_exit(&mut rx).await;

        assert!(process.kill(None).is_ok());
        assert!(process.kill(Some(15)).is_ok());
    }

    #[tokio::test]
    async fn test_operations_after_exit_fail() {
        let (process, mut rx) = PtyProcess::spawn(sh_options()).unwrap();

        process.kill(None).unwrap();
        let _ = wait_exit(&mut rx).await;

        let result = process.write(Bytes::from_static(b"hello\n")).await;
        assert!(matches!(result, Err(PtyError::Closed)));

        let result = process.resize(100, 50);
        assert!(matches!(result, Err(PtyError::Closed)));
    }

    #[tokio::test]
    async fn test_kill_rejects_invalid_signal() {
        let (process, _rx) = PtyProcess::spawn(sh_options()).unwrap();

        let result = process.kill(Some(4242));
        assert!(matches!(result, Err(PtyError::Kill(_))));

        process.kill(None).unwrap();
    }
}
