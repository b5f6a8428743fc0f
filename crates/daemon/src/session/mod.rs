//! Session management module.
//!
//! This module provides PTY spawning, the session registry and the event
//! multiplexer that routes each session's output to its listeners.

pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod state;

pub use manager::{CreateRequest, RegistryEvent, SessionError, SessionManager, SessionRegistry};
pub use multiplexer::{EventMultiplexer, SessionEvent, SubscriberId, SubscriberStats, Subscription};
pub use pty::{ExitStatus, PtyError, PtyEvent, PtyProcess, SpawnError, SpawnOptions};
pub use state::{OwnerId, Session, SessionId, SessionInfo, SessionKey, SessionState};
