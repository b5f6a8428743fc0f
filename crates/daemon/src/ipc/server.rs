//! IPC server side: accepts CLI connections on a Unix Domain Socket.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer did not answer in time.
    #[error("operation timed out")]
    Timeout,
}

/// A server that listens for IPC connections on a Unix Domain Socket.
///
/// The socket file is removed when the server is dropped.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Creates missing parent directories (mode 0700) and replaces a leftover
    /// socket file. The socket itself is made accessible to the owner only.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Returns the socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A connection to an IPC client, speaking newline-delimited JSON.
pub struct IpcConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(line.trim())?))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_bind_creates_private_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
        assert_eq!(server.path(), socket_path.as_path());

        let mode = std::fs::metadata(&socket_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_bind_replaces_existing_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_drop_removes_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_request_response_exchange() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let client = tokio::spawn({
            let socket_path = socket_path.clone();
            async move {
                let stream = UnixStream::connect(&socket_path).await.unwrap();
                let (read_half, mut write_half) = stream.into_split();
                let mut reader = BufReader::new(read_half);

                write_half.write_all(b"\"ListSessions\"\n").await.unwrap();

                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                serde_json::from_str::<IpcResponse>(line.trim()).unwrap()
            }
        });

        let mut conn = server.accept().await.unwrap();
        let request = conn.read_request().await.unwrap().unwrap();
        assert_eq!(request, IpcRequest::ListSessions);

        conn.send_response(&IpcResponse::Sessions { sessions: Vec::new() })
            .await
            .unwrap();

        let response = client.await.unwrap();
        assert_eq!(response, IpcResponse::Sessions { sessions: Vec::new() });
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let _client = tokio::spawn({
            let socket_path = socket_path.clone();
            async move {
                let mut stream = UnixStream::connect(&socket_path).await.unwrap();
                stream.write_all(b"{bogus\n").await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        });

        let mut conn = server.accept().await.unwrap();
        assert!(matches!(conn.read_request().await, Err(IpcError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_returns_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("test.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        tokio::spawn({
            let socket_path = socket_path.clone();
            async move {
                let _stream = UnixStream::connect(&socket_path).await.unwrap();
            }
        });

        let mut conn = server.accept().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(conn.read_request().await.unwrap().is_none());
    }
}
