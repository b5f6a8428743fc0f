//! IPC client side: talks to a running daemon over its Unix socket.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;
use crate::session::SessionInfo;

/// Default timeout for client operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A request/response client for the daemon's IPC socket.
pub struct IpcClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails if nothing listens there, which usually means the daemon is not
    /// running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    /// Connect with a custom timeout for the connect and every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| IpcError::Timeout)??;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request and wait for its response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    async fn exchange(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.send(IpcRequest::Ping).await?, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    /// List live sessions.
    ///
    /// Returns an empty list if the daemon answers with anything else.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => {
                tracing::debug!(response = ?other, "Unexpected response to ListSessions");
                Ok(Vec::new())
            }
        }
    }

    /// Kill a session, optionally with a specific signal.
    pub async fn kill_session(
        &mut self,
        session_id: impl Into<String>,
        signal: Option<i32>,
    ) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillSession {
            session_id: session_id.into(),
            signal,
        })
        .await
    }

    /// Kill every session held by `owner_id`.
    pub async fn kill_owner_sessions(&mut self, owner_id: impl Into<String>) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::KillOwnerSessions {
            owner_id: owner_id.into(),
        })
        .await
    }
}
