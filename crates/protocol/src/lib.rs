//! # ptygate Protocol Library
//!
//! This crate provides the wire protocol spoken between a browser terminal
//! view and the ptygate terminal gateway.
//!
//! ## Overview
//!
//! One WebSocket connection carries one terminal view. Every frame is a JSON
//! object tagged by `type`:
//!
//! ```text
//! client -> gateway:  create | input | resize | kill
//! gateway -> client:  created | ready | output | exit | error
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage};
//!
//! let msg = ClientMessage::from_json(
//!     r#"{"type":"create","sessionId":"s1","userId":"u1","cwd":"/tmp"}"#,
//! )
//! .unwrap();
//! assert_eq!(msg.kind(), "create");
//!
//! let reply = ServerMessage::Ready.to_json().unwrap();
//! assert_eq!(reply, r#"{"type":"ready"}"#);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Inbound/outbound message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, CreateSession, ErrorCode, ServerMessage, SessionInput, SessionResize,
    DEFAULT_COLS, DEFAULT_ROWS, PROTOCOL_VERSION,
};
