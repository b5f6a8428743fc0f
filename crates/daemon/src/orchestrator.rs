//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session registry and starts the
//! WebSocket gateway, the idle reaper and the admin IPC listener. Stopping it
//! cancels every task and kills every remaining session.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::ipc::{get_socket_path, IpcConnection, IpcError, IpcRequest, IpcResponse, IpcServer};
use crate::server::{ConnectionCounter, GatewayServer};
use crate::session::{RegistryEvent, SessionManager, SessionRegistry};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A registry lifecycle event.
    Session(RegistryEvent),
    /// A stop was requested over IPC.
    StopRequested,
    /// Error occurred.
    Error { message: String },
}

/// Shared state the IPC handlers need.
#[derive(Clone)]
struct IpcContext {
    registry: SessionRegistry,
    connections: ConnectionCounter,
    started_at: Instant,
    bind_addr: String,
    stop_requested: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    registry: SessionRegistry,
    connections: ConnectionCounter,
    socket_path: PathBuf,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    /// Cancels the listeners, the reaper and every connection.
    shutdown_token: CancellationToken,
    /// Cancelled when a client asks the daemon to stop.
    stop_requested: CancellationToken,
    tasks: TaskTracker,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                config.daemon.data_dir.display()
            )
        })?;

        let registry = SessionRegistry::new(config.session.clone());
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            connections: ConnectionCounter::default(),
            socket_path: get_socket_path(),
            local_addr: None,
            started_at: None,
            shutdown_token: CancellationToken::new(),
            stop_requested: CancellationToken::new(),
            tasks: TaskTracker::new(),
            event_tx,
        })
    }

    /// Overrides the IPC socket location.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Gets the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Subscribes to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the gateway listener, the reaper and the IPC listener.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        // Nothing is spawned until both listeners are bound.
        if let Err(e) = self.spawn_components().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::Error {
                message: format!("{:#}", e),
            });
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn spawn_components(&mut self) -> Result<()> {
        let server = GatewayServer::bind(self.config.server.clone(), self.registry.clone())
            .await
            .context("Failed to start gateway listener")?;
        let local_addr = server
            .local_addr()
            .context("Failed to read gateway address")?;
        self.connections = server.connections();
        self.local_addr = Some(local_addr);

        let ipc = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "IPC listening");

        let started_at = Instant::now();
        self.started_at = Some(started_at);

        self.tasks.spawn(server.run(self.shutdown_token.clone()));

        let reaper = self.registry.spawn_reaper(self.shutdown_token.clone());
        self.tasks.spawn(async move {
            if let Err(e) = reaper.await {
                error!("Idle reaper task failed: {}", e);
            }
        });
        debug!("Started idle reaper");

        self.tasks.spawn(Self::forward_registry_events(
            self.registry.subscribe_events(),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        ));

        let context = IpcContext {
            registry: self.registry.clone(),
            connections: self.connections.clone(),
            started_at,
            bind_addr: local_addr.to_string(),
            stop_requested: self.stop_requested.clone(),
            event_tx: self.event_tx.clone(),
        };
        self.tasks.spawn(Self::ipc_accept_loop(
            ipc,
            context,
            self.shutdown_token.clone(),
            self.tasks.clone(),
        ));

        Ok(())
    }

    /// Relays registry events to subscribers and the log.
    async fn forward_registry_events(
        mut events: broadcast::Receiver<RegistryEvent>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        match &event {
                            RegistryEvent::Created { key, owner_id } => {
                                info!(session_id = %key.id, instance = key.instance, owner_id = %owner_id, "Session created");
                            }
                            RegistryEvent::Killed { key } => {
                                info!(session_id = %key.id, instance = key.instance, "Session killed");
                            }
                            RegistryEvent::Exited { key, status } => {
                                info!(
                                    session_id = %key.id,
                                    instance = key.instance,
                                    exit_code = ?status.code,
                                    signal = ?status.signal,
                                    "Session exited"
                                );
                            }
                            RegistryEvent::CapacityDegraded { reason } => {
                                error!(reason = %reason, "Host is out of process or terminal capacity");
                            }
                        }
                        let _ = event_tx.send(OrchestratorEvent::Session(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Registry event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn ipc_accept_loop(
        server: IpcServer,
        context: IpcContext,
        shutdown_token: CancellationToken,
        tasks: TaskTracker,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                accepted = server.accept() => match accepted {
                    Ok(connection) => {
                        let context = context.clone();
                        let shutdown_token = shutdown_token.clone();
                        tasks.spawn(async move {
                            if let Err(e) = Self::serve_ipc(connection, &context, shutdown_token).await {
                                debug!("IPC connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept IPC connection: {}", e);
                    }
                },
            }
        }
    }

    async fn serve_ipc(
        mut connection: IpcConnection,
        context: &IpcContext,
        shutdown_token: CancellationToken,
    ) -> Result<(), IpcError> {
        loop {
            let request = tokio::select! {
                _ = shutdown_token.cancelled() => return Ok(()),
                request = connection.read_request() => request,
            };

            let response = match request {
                Ok(Some(request)) => Self::handle_ipc_request(context, request).await,
                Ok(None) => return Ok(()),
                Err(IpcError::Json(e)) => IpcResponse::Error {
                    message: format!("invalid request: {}", e),
                },
                Err(e) => return Err(e),
            };
            connection.send_response(&response).await?;
        }
    }

    async fn handle_ipc_request(context: &IpcContext, request: IpcRequest) -> IpcResponse {
        debug!(request = ?request, "IPC request");

        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: context.started_at.elapsed().as_secs(),
                session_count: context.registry.count(),
                connection_count: context.connections.get(),
                bind_addr: context.bind_addr.clone(),
                protocol_version: protocol::PROTOCOL_VERSION,
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                let _ = context.event_tx.send(OrchestratorEvent::StopRequested);
                context.stop_requested.cancel();
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: context.registry.list_with_stats().await,
            },
            IpcRequest::KillSession { session_id, signal } => {
                match context.registry.kill_with_signal(&session_id, signal).await {
                    Ok(true) => IpcResponse::SessionKilled { session_id },
                    Ok(false) => IpcResponse::Error {
                        message: format!("session not found: {}", session_id),
                    },
                    Err(e) => IpcResponse::Error { message: e.to_string() },
                }
            }
            IpcRequest::KillOwnerSessions { owner_id } => {
                let count = context.registry.kill_owner_sessions(&owner_id).await;
                info!(owner_id = %owner_id, count, "Killed owner sessions over IPC");
                IpcResponse::SessionsKilled { count }
            }
        }
    }

    /// Stops the orchestrator.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let killed = self.registry.shutdown().await;
        if killed > 0 {
            info!(killed, "Killed remaining sessions");
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Gets the session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Address the gateway is listening on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Gets the IPC socket location.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Gets the number of open gateway connections.
    pub fn connection_count(&self) -> usize {
        self.connections.get()
    }

    /// Seconds since the orchestrator started, zero when not running.
    pub fn uptime_secs(&self) -> u64 {
        self.started_at
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0)
    }

    /// Gets the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Token cancelled when a client sends `Stop` over IPC.
    pub fn stop_requested(&self) -> CancellationToken {
        self.stop_requested.clone()
    }
}
