//! Session registry for managing multiple PTY sessions.
//!
//! This module provides a thread-safe registry that owns every live session,
//! keyed by caller-chosen id. It is the single source of truth for whether a
//! session exists and who owns it.
//!
//! Mutations of one id (create, kill, removal on exit) are serialized by a
//! per-id async lock, so unrelated sessions never contend. Lookups take no
//! lock at all.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use nix::sys::signal::Signal;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::multiplexer::{EventMultiplexer, SessionEvent, Subscription};
use super::pty::{ExitStatus, PtyError, PtyEvent, PtyProcess, SpawnError, SpawnOptions};
use super::state::{OwnerId, Session, SessionId, SessionInfo, SessionKey};
use crate::config::SessionConfig;

/// Capacity of the registry event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to spawn the shell.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// Failed to operate on the shell's terminal.
    #[error(transparent)]
    Pty(#[from] PtyError),

    /// Session not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The id is taken by a session of another owner.
    #[error("session {0} is owned by another user")]
    OwnedByOtherUser(SessionId),

    /// The owner reached its session quota.
    #[error("owner {owner_id} already has {limit} sessions")]
    QuotaExceeded { owner_id: OwnerId, limit: usize },

    /// The registry reached its global session limit.
    #[error("session limit reached ({0})")]
    AtCapacity(usize),

    /// The request itself is unusable.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Lifecycle notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A session was created.
    Created { key: SessionKey, owner_id: OwnerId },
    /// A session was force-terminated.
    Killed { key: SessionKey },
    /// A session's shell exited on its own.
    Exited { key: SessionKey, status: ExitStatus },
    /// The OS refused to create more processes or terminals.
    CapacityDegraded { reason: String },
}

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    /// Caller-chosen session id.
    pub id: SessionId,
    /// Owner of the new session.
    pub owner_id: OwnerId,
    /// Working directory (default: configured directory).
    pub cwd: Option<PathBuf>,
    /// Terminal geometry (default: configured geometry).
    pub size: Option<(u16, u16)>,
}

impl CreateRequest {
    /// Request with default geometry.
    pub fn new(id: impl Into<SessionId>, owner_id: impl Into<OwnerId>, cwd: Option<PathBuf>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            cwd,
            size: None,
        }
    }

    /// Set the initial terminal geometry.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Some((cols, rows));
        self
    }
}

/// Trait for session registry operations.
///
/// Lookups on unknown ids return `false`/`None`/empty rather than errors:
/// absence of a session is an expected condition.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a session, first killing and removing any session with the
    /// same id.
    async fn create_session(&self, request: CreateRequest) -> Result<Arc<Session>, SessionError>;

    /// Looks up a session.
    fn get_session(&self, session_id: &str) -> Option<Arc<Session>>;

    /// Forwards input to a session. Returns false if it does not exist.
    async fn write(&self, session_id: &str, data: Bytes) -> bool;

    /// Resizes a session's terminal. Returns false if it does not exist.
    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool;

    /// Force-terminates and removes a session. Returns false if it did not
    /// exist.
    async fn kill_session(&self, session_id: &str) -> bool;

    /// Lists the sessions of one owner.
    fn sessions_for_owner(&self, owner_id: &str) -> Vec<Arc<Session>>;

    /// Kills every session of one owner, returning how many were killed.
    async fn kill_owner_sessions(&self, owner_id: &str) -> usize;

    /// Lists all live sessions.
    fn list(&self) -> Vec<SessionInfo>;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;
}

struct Shared {
    config: SessionConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    multiplexer: EventMultiplexer,
    events: broadcast::Sender<RegistryEvent>,
    next_instance: AtomicU64,
    /// Live sessions plus creations in flight.
    reserved: AtomicUsize,
    /// Same as `reserved`, per owner. Owners at zero are absent.
    owners: DashMap<OwnerId, usize>,
    /// Pending `SIGKILL` escalations of shells sent a catchable signal.
    escalations: TaskTracker,
}

/// Thread-safe session registry built on DashMap.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<Shared>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(config: SessionConfig) -> Self {
        let multiplexer = EventMultiplexer::new(
            config.output_queue_capacity,
            config.subscriber_send_timeout(),
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                config,
                sessions: DashMap::new(),
                locks: DashMap::new(),
                multiplexer,
                events,
                next_instance: AtomicU64::new(1),
                reserved: AtomicUsize::new(0),
                owners: DashMap::new(),
                escalations: TaskTracker::new(),
            }),
        }
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Subscribes to registry lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    fn key_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.shared
                .locks
                .entry(session_id.to_string())
                .or_default()
                .value(),
        )
    }

    fn prune_lock(&self, session_id: &str) {
        self.shared
            .locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Claims one slot of the owner's quota and one of the global limit.
    ///
    /// The owner check and increment happen under one map entry, so
    /// concurrent creates for the same owner cannot both take the last slot.
    fn try_reserve(&self, owner_id: &str) -> Result<(), SessionError> {
        let limit = self.shared.config.max_sessions_per_owner;
        {
            let mut owned = self.shared.owners.entry(owner_id.to_string()).or_insert(0);
            if *owned >= limit {
                return Err(SessionError::QuotaExceeded {
                    owner_id: owner_id.to_string(),
                    limit,
                });
            }
            *owned += 1;
        }

        let max = self.shared.config.max_sessions;
        let previous = self.shared.reserved.fetch_add(1, Ordering::SeqCst);
        if previous >= max {
            self.release(owner_id);
            return Err(SessionError::AtCapacity(max));
        }
        Ok(())
    }

    fn release(&self, owner_id: &str) {
        self.shared.reserved.fetch_sub(1, Ordering::SeqCst);
        self.shared.owners.remove_if_mut(owner_id, |_, owned| {
            *owned = owned.saturating_sub(1);
            *owned == 0
        });
    }

    /// Looks up the session currently registered under `key.id`, if it is
    /// still the `key.instance` incarnation.
    fn get_bound(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.get_session(&key.id)
            .filter(|session| session.instance() == key.instance)
    }

    /// Creates a session and subscribes the caller to it before any output
    /// can be published.
    ///
    /// An existing session with the same id is killed and removed first, as
    /// long as it belongs to the same owner.
    pub async fn create_attached(
        &self,
        request: CreateRequest,
    ) -> Result<(Arc<Session>, Subscription), SessionError> {
        if request.id.is_empty() {
            return Err(SessionError::InvalidRequest("session id must not be empty".into()));
        }
        if request.owner_id.is_empty() {
            return Err(SessionError::InvalidRequest("owner id must not be empty".into()));
        }

        let id = request.id.clone();
        let lock = self.key_lock(&id);
        let result = {
            let _guard = lock.lock().await;
            self.replace_locked(request).await
        };
        drop(lock);
        self.prune_lock(&id);
        result
    }

    async fn replace_locked(
        &self,
        request: CreateRequest,
    ) -> Result<(Arc<Session>, Subscription), SessionError> {
        if let Some(existing) = self.get_session(&request.id) {
            if existing.owner_id() != request.owner_id {
                tracing::warn!(
                    session_id = %request.id,
                    owner_id = %request.owner_id,
                    "Refusing to replace session of another owner"
                );
                return Err(SessionError::OwnedByOtherUser(request.id));
            }
        }

        if self.kill_if_present_locked(&request.id, None).await {
            tracing::info!(session_id = %request.id, "Replaced existing session");
        }

        let owner_id = request.owner_id.clone();
        self.try_reserve(&owner_id)?;
        match self.spawn_locked(request).await {
            Ok((session, events)) => {
                // Subscribe before the pump starts so no output is missed.
                let subscription = self
                    .shared
                    .multiplexer
                    .subscribe(session.key())
                    .await
                    .ok_or_else(|| SessionError::NotFound(session.id().clone()))?;

                let registry = self.clone();
                let pumped = Arc::clone(&session);
                tokio::spawn(async move { registry.pump(pumped, events).await });

                Ok((session, subscription))
            }
            Err(e) => {
                self.release(&owner_id);
                Err(e)
            }
        }
    }

    /// Spawns the shell and registers the session. Caller holds the id lock.
    async fn spawn_locked(
        &self,
        request: CreateRequest,
    ) -> Result<(Arc<Session>, mpsc::Receiver<PtyEvent>), SessionError> {
        let config = &self.shared.config;
        let cwd = request.cwd.unwrap_or_else(|| config.cwd());
        let (cols, rows) = request
            .size
            .unwrap_or((config.default_cols, config.default_rows));

        let mut opts = SpawnOptions::new(cwd.clone(), cols, rows);
        opts.shell = config.shell();
        opts.env = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Shell lookup, openpty and fork/exec block; keep them off the workers.
        let spawned = tokio::task::spawn_blocking(move || PtyProcess::spawn(opts))
            .await
            .map_err(|e| SpawnError::Spawn(e.to_string()))?;

        let (process, events) = match spawned {
            Ok(spawned) => spawned,
            Err(SpawnError::ResourcesExhausted(reason)) => {
                tracing::error!(
                    session_id = %request.id,
                    reason = %reason,
                    "Cannot spawn shell, system resources exhausted"
                );
                self.emit(RegistryEvent::CapacityDegraded {
                    reason: reason.clone(),
                });
                return Err(SpawnError::ResourcesExhausted(reason).into());
            }
            Err(e) => return Err(e.into()),
        };

        let key = SessionKey {
            id: request.id,
            instance: self.shared.next_instance.fetch_add(1, Ordering::SeqCst),
        };
        let session = Arc::new(Session::new(
            key.clone(),
            request.owner_id.clone(),
            cwd,
            process,
        ));

        self.shared.multiplexer.open(&key);
        self.shared
            .sessions
            .insert(key.id.clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %key.id,
            instance = key.instance,
            owner_id = %request.owner_id,
            pid = ?session.pid(),
            cols = cols,
            rows = rows,
            "Created new session"
        );

        self.emit(RegistryEvent::Created {
            key,
            owner_id: request.owner_id,
        });

        Ok((session, events))
    }

    /// Kills and removes the session registered under `session_id`, if any.
    /// Caller holds the id lock.
    async fn kill_if_present_locked(&self, session_id: &str, signal: Option<i32>) -> bool {
        let Some((_, session)) = self.shared.sessions.remove(session_id) else {
            return false;
        };
        self.release(session.owner_id());
        self.terminate(&session, signal).await;
        true
    }

    /// Kills a removed session and notifies its subscribers.
    ///
    /// The shell always ends: a catchable signal is followed by `SIGKILL`
    /// once the grace period passes, and a failed signal by `SIGKILL` at once.
    async fn terminate(&self, session: &Arc<Session>, signal: Option<i32>) {
        let sigkill = Signal::SIGKILL as i32;
        let requested = signal.unwrap_or(sigkill);

        match session.kill(signal) {
            Ok(true) if requested != sigkill => {
                self.escalate_after_grace(Arc::clone(session), requested);
            }
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(session = %session.key(), "Session already finished");
            }
            Err(e) => {
                tracing::warn!(
                    session = %session.key(),
                    signal = requested,
                    error = %e,
                    "Failed to signal session, sending SIGKILL"
                );
                if let Err(e) = session.force_kill() {
                    tracing::error!(session = %session.key(), error = %e, "Failed to kill session");
                }
            }
        }

        self.shared
            .multiplexer
            .publish(session.key(), SessionEvent::Killed)
            .await;

        tracing::info!(
            session_id = %session.id(),
            instance = session.instance(),
            owner_id = %session.owner_id(),
            signal = requested,
            "Killed session"
        );

        self.emit(RegistryEvent::Killed {
            key: session.key().clone(),
        });
    }

    /// Sends `SIGKILL` to a shell still running once the grace period passed.
    fn escalate_after_grace(&self, session: Arc<Session>, signal: i32) {
        let grace = self.shared.config.kill_grace();
        self.shared.escalations.spawn(async move {
            tokio::time::sleep(grace).await;
            if !session.is_running() {
                return;
            }

            tracing::warn!(
                session = %session.key(),
                pid = ?session.pid(),
                signal = signal,
                grace_ms = grace.as_millis() as u64,
                "Shell survived kill signal, sending SIGKILL"
            );
            if let Err(e) = session.force_kill() {
                tracing::error!(session = %session.key(), error = %e, "Failed to kill session");
            }
        });
    }

    /// Routes one session's PTY events into the multiplexer until exit.
    async fn pump(self, session: Arc<Session>, mut events: mpsc::Receiver<PtyEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                PtyEvent::Output(data) => {
                    session.touch();
                    self.shared
                        .multiplexer
                        .publish(session.key(), SessionEvent::Output(data))
                        .await;
                }
                PtyEvent::Exit(status) => {
                    self.handle_exit(&session, status).await;
                    return;
                }
            }
        }

        tracing::debug!(session = %session.key(), "PTY event channel closed without exit");
    }

    /// Removes a session whose shell exited on its own. A no-op if the
    /// session was killed first.
    async fn handle_exit(&self, session: &Session, status: ExitStatus) {
        let key = session.key();
        let lock = self.key_lock(&key.id);
        {
            let _guard = lock.lock().await;
            if session.mark_exited(status.code) {
                self.remove_exited(key, session.owner_id(), status).await;
            }
        }
        drop(lock);
        self.prune_lock(&key.id);
    }

    /// Caller holds the id lock.
    async fn remove_exited(&self, key: &SessionKey, owner_id: &str, status: ExitStatus) {
        let removed = self
            .shared
            .sessions
            .remove_if(&key.id, |_, s| s.instance() == key.instance);
        if removed.is_some() {
            self.release(owner_id);
        }

        self.shared
            .multiplexer
            .publish(key, SessionEvent::Exit(status))
            .await;

        tracing::info!(
            session_id = %key.id,
            instance = key.instance,
            exit_code = ?status.code,
            signal = ?status.signal,
            "Session exited"
        );

        self.emit(RegistryEvent::Exited {
            key: key.clone(),
            status,
        });
    }

    /// Forwards input to one incarnation. Returns false if it is gone.
    pub async fn write_bound(&self, key: &SessionKey, data: Bytes) -> bool {
        let Some(session) = self.get_bound(key) else {
            return false;
        };
        match session.write(data).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(session = %key, error = %e, "Write failed");
                false
            }
        }
    }

    /// Resizes one incarnation. Returns false if it is gone.
    pub fn resize_bound(&self, key: &SessionKey, cols: u16, rows: u16) -> bool {
        let Some(session) = self.get_bound(key) else {
            return false;
        };
        match session.resize(cols, rows) {
            Ok(()) => {
                tracing::debug!(session = %key, cols = cols, rows = rows, "Resized session");
                true
            }
            Err(e) => {
                tracing::debug!(session = %key, error = %e, "Resize failed");
                false
            }
        }
    }

    /// Kills one incarnation. Returns false if it is gone or was replaced.
    pub async fn kill_bound(&self, key: &SessionKey, signal: Option<i32>) -> bool {
        let lock = self.key_lock(&key.id);
        let killed = {
            let _guard = lock.lock().await;
            match self
                .shared
                .sessions
                .remove_if(&key.id, |_, s| s.instance() == key.instance)
            {
                Some((_, session)) => {
                    self.release(session.owner_id());
                    self.terminate(&session, signal).await;
                    true
                }
                None => false,
            }
        };
        drop(lock);
        self.prune_lock(&key.id);
        killed
    }

    /// Kills a session with a specific signal (default `SIGKILL`).
    ///
    /// Returns false if it did not exist. A signal the shell survives is
    /// followed by `SIGKILL` after the configured grace period.
    pub async fn kill_with_signal(
        &self,
        session_id: &str,
        signal: Option<i32>,
    ) -> Result<bool, SessionError> {
        if let Some(raw) = signal {
            Signal::try_from(raw)
                .map_err(|_| SessionError::InvalidRequest(format!("invalid signal: {}", raw)))?;
        }
        Ok(self.kill_by_id(session_id, signal).await)
    }

    async fn kill_by_id(&self, session_id: &str, signal: Option<i32>) -> bool {
        let lock = self.key_lock(session_id);
        let killed = {
            let _guard = lock.lock().await;
            self.kill_if_present_locked(session_id, signal).await
        };
        drop(lock);
        self.prune_lock(session_id);
        killed
    }

    /// Kills every session idle for longer than the configured timeout.
    ///
    /// Returns the number of sessions reaped.
    pub async fn reap_idle(&self) -> usize {
        let Some(timeout) = self.shared.config.idle_timeout() else {
            return 0;
        };

        let idle: Vec<SessionKey> = self
            .shared
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= timeout)
            .map(|entry| entry.value().key().clone())
            .collect();

        let mut reaped = 0;
        for key in idle {
            if self.kill_bound(&key, None).await {
                tracing::info!(session_id = %key.id, "Reaped idle session");
                reaped += 1;
            }
        }
        reaped
    }

    /// Starts the idle reaper, running until `cancel` fires.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.shared.config.reap_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Idle reaper stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        let reaped = registry.reap_idle().await;
                        if reaped > 0 {
                            tracing::info!(reaped = reaped, "Idle reaper pass");
                        }
                    }
                }
            }
        })
    }

    /// Kills every live session.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut killed = 0;
        for id in ids {
            if self.kill_session(&id).await {
                killed += 1;
            }
        }

        if killed > 0 {
            tracing::info!(count = killed, "Killed remaining sessions");
        }

        // Shells still inside their grace period must not outlive us.
        self.shared.escalations.close();
        self.shared.escalations.wait().await;
        self.shared.escalations.reopen();
        killed
    }

    /// Lists all live sessions together with the delivery statistics of
    /// their subscribers.
    pub async fn list_with_stats(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            let mut info = session.info();
            info.subscribers = self
                .shared
                .multiplexer
                .stats(session.key())
                .await
                .into_iter()
                .map(|(_, stats)| stats)
                .collect();
            infos.push(info);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionManager for SessionRegistry {
    async fn create_session(&self, request: CreateRequest) -> Result<Arc<Session>, SessionError> {
        let (session, _subscription) = self.create_attached(request).await?;
        Ok(session)
    }

    fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.shared
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    async fn write(&self, session_id: &str, data: Bytes) -> bool {
        let Some(session) = self.get_session(session_id) else {
            return false;
        };
        self.write_bound(session.key(), data).await
    }

    fn resize(&self, session_id: &str, cols: u16, rows: u16) -> bool {
        let Some(session) = self.get_session(session_id) else {
            return false;
        };
        self.resize_bound(session.key(), cols, rows)
    }

    async fn kill_session(&self, session_id: &str) -> bool {
        self.kill_by_id(session_id, None).await
    }

    fn sessions_for_owner(&self, owner_id: &str) -> Vec<Arc<Session>> {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().owner_id() == owner_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn kill_owner_sessions(&self, owner_id: &str) -> usize {
        let mut killed = 0;
        for session in self.sessions_for_owner(owner_id) {
            if self.kill_bound(session.key(), None).await {
                killed += 1;
            }
        }
        killed
    }

    fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    fn count(&self) -> usize {
        self.shared.sessions.len()
    }
}
