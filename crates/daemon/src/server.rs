//! WebSocket transport for the gateway.
//!
//! Each accepted connection gets its own task driving a [`Gateway`]: inbound
//! frames go to the handler, session events come back out as JSON text
//! frames. Ping/pong is answered by `tokio-tungstenite` itself.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::gateway::Gateway;
use crate::session::SessionRegistry;

/// Errors raised while setting up the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Live connection count, shared with the orchestrator for status reports.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    /// Returns the number of open connections.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(self.clone())
    }
}

struct ConnectionGuard(ConnectionCounter);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Accepts WebSocket connections and runs one gateway per connection.
pub struct GatewayServer {
    listener: TcpListener,
    registry: SessionRegistry,
    config: ServerConfig,
    connections: ConnectionCounter,
}

impl GatewayServer {
    /// Binds the listener on `config.bind_addr`.
    pub async fn bind(config: ServerConfig, registry: SessionRegistry) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;

        Ok(Self {
            listener,
            registry,
            config,
            connections: ConnectionCounter::default(),
        })
    }

    /// Returns the address actually bound, useful with port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns a handle on the live connection count.
    pub fn connections(&self) -> ConnectionCounter {
        self.connections.clone()
    }

    /// Accepts connections until `shutdown` is cancelled, then waits for
    /// every connection task to finish.
    ///
    /// Cancelling closes each connection, which kills the session it owns.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        let local_addr = self
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| self.config.bind_addr.clone());
        info!(addr = %local_addr, "Gateway listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = self.registry.clone();
                        let config = self.config.clone();
                        let guard = self.connections.enter();
                        let shutdown = shutdown.child_token();

                        tracker.spawn(async move {
                            let _guard = guard;
                            if let Err(e) = serve_connection(stream, peer, registry, &config, shutdown).await {
                                debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        // Usually EMFILE; give descriptors a moment to free up.
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Gateway stopped");
    }
}

fn websocket_config(config: &ServerConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);
    ws_config
}

fn unauthorized(header: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("missing {} header", header)));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Runs one connection from handshake to close.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: SessionRegistry,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<(), WsError> {
    let _ = stream.set_nodelay(true);

    let mut identity: Option<String> = None;
    let header = config.identity_header.as_deref();
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(name) = header else {
            return Ok(response);
        };
        match request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        {
            Some(value) => {
                identity = Some(value.to_string());
                Ok(response)
            }
            None => Err(unauthorized(name)),
        }
    };

    let ws = match accept_hdr_async_with_config(stream, callback, Some(websocket_config(config))).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake rejected");
            return Err(e);
        }
    };

    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(connection_id = %connection_id, peer = %peer, "Connection opened");

    let (mut sink, mut frames) = ws.split();
    let mut gateway = Gateway::new(registry, connection_id.clone()).with_identity(identity);

    let result = loop {
        let replies = tokio::select! {
            _ = shutdown.cancelled() => {
                gateway.close().await;
                let _ = sink.close().await;
                break Ok(());
            }
            frame = frames.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => gateway.handle_text(&text).await,
                Some(Ok(WsMessage::Binary(data))) => gateway.handle_binary(Bytes::from(data)).await,
                Some(Ok(WsMessage::Close(_))) | None => {
                    gateway.close().await;
                    break Ok(());
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    gateway.close().await;
                    break Err(e);
                }
            },
            Some(event) = gateway.next_event(), if gateway.has_events() => vec![event],
        };

        let mut send_failed = None;
        for reply in replies {
            let json = match reply.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(connection_id = %connection_id, error = %e, "Failed to serialize reply");
                    continue;
                }
            };
            if let Err(e) = sink.send(WsMessage::Text(json)).await {
                send_failed = Some(e);
                break;
            }
        }

        if let Some(e) = send_failed {
            gateway.close().await;
            break Err(e);
        }

        if gateway.is_closed() && !gateway.has_events() {
            let _ = sink.close().await;
            break Ok(());
        }
    };

    info!(connection_id = %connection_id, "Connection closed");
    result
}
