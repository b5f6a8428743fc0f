//! # ptygate Daemon Library
//!
//! Serves interactive shells to browser terminal views. Each WebSocket
//! connection binds to one named, owner-scoped session backed by a real
//! pseudo-terminal.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Daemon Orchestrator                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌────────────────┐   ┌──────────────────────────────────┐  │
//! │  │ WebSocket      │──▶│ Gateway (one per connection)     │  │
//! │  │ server         │   └───────────────┬──────────────────┘  │
//! │  └────────────────┘                   │                     │
//! │  ┌────────────────┐   ┌───────────────▼──────────────────┐  │
//! │  │ Admin IPC      │──▶│ Session Registry ── Multiplexer  │  │
//! │  └────────────────┘   └───────────────┬──────────────────┘  │
//! │                                       │                     │
//! │                       ┌───────────────▼──────────────────┐  │
//! │                       │ PTY processes                    │  │
//! │                       └──────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, the session registry and output fan-out
//! - [`gateway`]: Per-connection protocol state machine
//! - [`server`]: WebSocket listener
//! - [`ipc`]: Local admin socket used by the CLI
//! - [`orchestrator`]: Component wiring and lifecycle

pub mod config;
pub mod gateway;
pub mod ipc;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use gateway::{Gateway, GatewayError, GatewayState};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use server::{ConnectionCounter, GatewayServer, ServerError};
pub use session::{
    CreateRequest, Session, SessionError, SessionId, SessionInfo, SessionManager, SessionRegistry,
    SessionState,
};
