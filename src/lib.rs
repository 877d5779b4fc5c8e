//! Socklet - an embeddable RFC 6455 WebSocket client engine
//!
//! This library provides the protocol core beneath a WebSocket client:
//! upgrade handshake, frame codec, message reassembly, a monotonic
//! connection state machine and ordered event dispatch, driven by one
//! background worker per connection.

pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod protocol;

// Re-export main components
pub use crate::config::ClientConfig;
pub use crate::core::{Event, Message, ReadyState, WebSocket};
pub use crate::error::{Result, SockletError};
