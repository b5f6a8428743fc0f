//! Per-connection gateway protocol handler.
//!
//! A [`Gateway`] translates one client's inbound control messages into
//! registry operations and turns the bound session's events into outbound
//! messages. It is transport-agnostic: the WebSocket server feeds it text and
//! binary frames and drains [`Gateway::next_event`].
//!
//! ```text
//! Unbound --create--> Bound(session) --kill / exit / disconnect--> Closed
//! ```

use std::collections::VecDeque;
use std::path::PathBuf;

use bytes::Bytes;
use nix::sys::signal::Signal;
use protocol::{ClientMessage, CreateSession, ErrorCode, ProtocolError, ServerMessage, SessionResize};
use tracing::{debug, info, warn};

use crate::session::{
    CreateRequest, ExitStatus, SessionError, SessionEvent, SessionKey, SessionRegistry,
    SpawnError, Subscription,
};

/// Errors reported to the client as `error` messages.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The frame could not be parsed or failed validation.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// The message is not accepted in the connection's current state.
    #[error("'{message}' is not allowed while {state}")]
    InvalidState {
        message: &'static str,
        state: &'static str,
    },

    /// A registry operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The bound session no longer exists.
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// The request names a user other than the authenticated one.
    #[error("user {0} does not match the authenticated identity")]
    Forbidden(String),

    /// The client fell too far behind the session's output.
    #[error("output overflow")]
    OutputOverflow,
}

impl GatewayError {
    /// Machine-readable classification of the error.
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Protocol(_) => ErrorCode::InvalidMessage,
            GatewayError::InvalidState { .. } => ErrorCode::InvalidState,
            GatewayError::Session(e) => match e {
                SessionError::Spawn(SpawnError::ResourcesExhausted(_)) => {
                    ErrorCode::CapacityExhausted
                }
                SessionError::Spawn(_) => ErrorCode::SpawnFailed,
                SessionError::Pty(_) => ErrorCode::Internal,
                SessionError::NotFound(_) => ErrorCode::UnknownSession,
                SessionError::OwnedByOtherUser(_) => ErrorCode::Forbidden,
                SessionError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
                SessionError::AtCapacity(_) => ErrorCode::CapacityExhausted,
                SessionError::InvalidRequest(_) => ErrorCode::InvalidMessage,
            },
            GatewayError::UnknownSession(_) => ErrorCode::UnknownSession,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::OutputOverflow => ErrorCode::Internal,
        }
    }

    /// Convert the error to a protocol `error` message.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

/// Connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayState {
    /// Waiting for `create`.
    Unbound,
    /// Attached to one session incarnation.
    Bound(SessionKey),
    /// Finished; the transport should be closed.
    Closed,
}

impl GatewayState {
    fn name(&self) -> &'static str {
        match self {
            GatewayState::Unbound => "unbound",
            GatewayState::Bound(_) => "bound",
            GatewayState::Closed => "closed",
        }
    }
}

/// Incremental UTF-8 decoder for terminal output.
///
/// Multi-byte sequences split across chunks are carried over to the next
/// chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether an incomplete sequence is buffered.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Decodes one chunk, holding back a trailing incomplete sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let joined;
        let mut input: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(chunk);
            joined = buf;
            &joined
        };

        let mut out = String::with_capacity(input.len());
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[len..];
                        }
                        None => {
                            self.pending = rest.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a buffered incomplete sequence as U+FFFD.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

/// Protocol handler for one client connection.
pub struct Gateway {
    registry: SessionRegistry,
    connection_id: String,
    /// Authenticated user id from the handshake, when enforced.
    identity: Option<String>,
    state: GatewayState,
    subscription: Option<Subscription>,
    decoder: Utf8Decoder,
    pending: VecDeque<ServerMessage>,
}

impl Gateway {
    /// Creates a handler in the `Unbound` state.
    pub fn new(registry: SessionRegistry, connection_id: impl Into<String>) -> Self {
        Self {
            registry,
            connection_id: connection_id.into(),
            identity: None,
            state: GatewayState::Unbound,
            subscription: None,
            decoder: Utf8Decoder::new(),
            pending: VecDeque::new(),
        }
    }

    /// Requires `create` requests to name this user.
    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    /// Returns the connection ID.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Returns the connection state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Returns whether the connection is finished.
    pub fn is_closed(&self) -> bool {
        self.state == GatewayState::Closed
    }

    /// Returns whether [`Gateway::next_event`] can yield anything.
    pub fn has_events(&self) -> bool {
        !self.pending.is_empty() || self.subscription.is_some()
    }

    /// Handles a text frame. Failures become `error` replies; the connection
    /// stays open.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match ClientMessage::from_json(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Rejected malformed message");
                vec![GatewayError::from(e).to_server_message()]
            }
        }
    }

    /// Handles a binary frame as raw input.
    pub async fn handle_binary(&mut self, data: Bytes) -> Vec<ServerMessage> {
        let result = match self.state.clone() {
            GatewayState::Bound(key) => self.handle_input(&key, data).await,
            state => Err(GatewayError::InvalidState {
                message: "binary input",
                state: state.name(),
            }),
        };
        self.replies(result)
    }

    /// Handles a parsed inbound message.
    pub async fn handle_message(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        let result = self.dispatch(message).await;
        self.replies(result)
    }

    fn replies(&self, result: Result<Vec<ServerMessage>, GatewayError>) -> Vec<ServerMessage> {
        match result {
            Ok(replies) => replies,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Request failed");
                vec![e.to_server_message()]
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Vec<ServerMessage>, GatewayError> {
        match (self.state.clone(), message) {
            (GatewayState::Unbound, ClientMessage::Create(request)) => {
                self.handle_create(request).await
            }
            (GatewayState::Bound(key), ClientMessage::Input(input)) => {
                self.handle_input(&key, Bytes::from(input.data)).await
            }
            (GatewayState::Bound(key), ClientMessage::Resize(resize)) => {
                self.handle_resize(&key, resize)
            }
            (GatewayState::Bound(key), ClientMessage::Kill) => self.handle_kill(&key).await,
            (state, message) => Err(GatewayError::InvalidState {
                message: message.kind(),
                state: state.name(),
            }),
        }
    }

    async fn handle_create(&mut self, create: CreateSession) -> Result<Vec<ServerMessage>, GatewayError> {
        if let Some(identity) = &self.identity {
            if *identity != create.user_id {
                warn!(
                    connection_id = %self.connection_id,
                    user_id = %create.user_id,
                    "Create for a user other than the authenticated one"
                );
                return Err(GatewayError::Forbidden(create.user_id));
            }
        }

        let mut request = CreateRequest::new(
            create.session_id.clone(),
            create.user_id.clone(),
            create.cwd.as_ref().map(PathBuf::from),
        );
        if create.cols.is_some() || create.rows.is_some() {
            let config = self.registry.config();
            request = request.with_size(
                create.cols.unwrap_or(config.default_cols),
                create.rows.unwrap_or(config.default_rows),
            );
        }

        let (session, subscription) = self.registry.create_attached(request).await?;

        info!(
            connection_id = %self.connection_id,
            session_id = %session.id(),
            owner_id = %session.owner_id(),
            "Connection bound to session"
        );

        self.state = GatewayState::Bound(session.key().clone());
        self.subscription = Some(subscription);
        self.decoder = Utf8Decoder::new();

        Ok(vec![
            ServerMessage::Created {
                session_id: session.id().clone(),
            },
            ServerMessage::Ready,
        ])
    }

    async fn handle_input(&mut self, key: &SessionKey, data: Bytes) -> Result<Vec<ServerMessage>, GatewayError> {
        if self.registry.write_bound(key, data).await {
            Ok(Vec::new())
        } else {
            Err(GatewayError::UnknownSession(key.id.clone()))
        }
    }

    fn handle_resize(&mut self, key: &SessionKey, resize: SessionResize) -> Result<Vec<ServerMessage>, GatewayError> {
        if self.registry.resize_bound(key, resize.cols, resize.rows) {
            Ok(Vec::new())
        } else {
            Err(GatewayError::UnknownSession(key.id.clone()))
        }
    }

    async fn handle_kill(&mut self, key: &SessionKey) -> Result<Vec<ServerMessage>, GatewayError> {
        let killed = self.registry.kill_bound(key, None).await;
        if killed {
            info!(connection_id = %self.connection_id, session_id = %key.id, "Client killed session");
        }

        // Whatever ended the session, its terminal event is queued by now.
        while let Some(event) = self.subscription.as_mut().and_then(Subscription::try_recv) {
            if let Some(message) = self.on_event(event) {
                self.pending.push_back(message);
            }
        }

        if !self.is_closed() {
            self.subscription = None;
            self.state = GatewayState::Closed;
            if !killed {
                self.pending.clear();
                return Err(GatewayError::UnknownSession(key.id.clone()));
            }
            self.finish(exit_message(ExitStatus::signaled(Signal::SIGKILL as i32)));
        }

        Ok(self.pending.drain(..).collect())
    }

    /// Waits for the next outbound message produced by the bound session.
    ///
    /// Returns `None` when nothing more can be produced. Output is forwarded
    /// as soon as it arrives, without batching.
    pub async fn next_event(&mut self) -> Option<ServerMessage> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(message);
            }

            let subscription = self.subscription.as_mut()?;
            match subscription.recv().await {
                Some(event) => {
                    if let Some(message) = self.on_event(event) {
                        return Some(message);
                    }
                }
                None => {
                    warn!(connection_id = %self.connection_id, "Client too slow, dropping connection");
                    if let GatewayState::Bound(key) = self.state.clone() {
                        self.registry.kill_bound(&key, None).await;
                    }
                    self.finish(GatewayError::OutputOverflow.to_server_message());
                }
            }
        }
    }

    /// Turns one session event into an outbound message. Terminal events
    /// queue their messages and close the connection instead.
    fn on_event(&mut self, event: SessionEvent) -> Option<ServerMessage> {
        match event {
            SessionEvent::Output(data) => {
                let text = self.decoder.decode(&data);
                (!text.is_empty()).then(|| ServerMessage::output(text))
            }
            SessionEvent::Exit(status) => {
                debug!(connection_id = %self.connection_id, "Session exited");
                self.finish(exit_message(status));
                None
            }
            SessionEvent::Killed => {
                debug!(connection_id = %self.connection_id, "Session killed");
                self.finish(exit_message(ExitStatus::signaled(Signal::SIGKILL as i32)));
                None
            }
        }
    }

    /// Flushes buffered output, queues the final message and closes.
    fn finish(&mut self, last: ServerMessage) {
        let rest = self.decoder.finish();
        if !rest.is_empty() {
            self.pending.push_back(ServerMessage::output(rest));
        }
        self.pending.push_back(last);
        self.subscription = None;
        self.state = GatewayState::Closed;
    }

    /// Handles transport closure. A bound session is killed rather than
    /// left orphaned.
    pub async fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, GatewayState::Closed);
        self.subscription = None;

        if let GatewayState::Bound(key) = state {
            if self.registry.kill_bound(&key, None).await {
                info!(
                    connection_id = %self.connection_id,
                    session_id = %key.id,
                    "Killed session of disconnected client"
                );
            }
        }
    }
}

fn exit_message(status: ExitStatus) -> ServerMessage {
    ServerMessage::Exit {
        exit_code: status.code,
        signal: status.signal,
    }
}
