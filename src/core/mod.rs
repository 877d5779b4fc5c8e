//! Connection lifecycle, events and message types

pub mod connection;
pub mod events;
pub mod message;
pub(crate) mod transport;

// Re-export main components for convenience
pub use connection::{ReadyState, WebSocket};
pub use events::Event;
pub use message::Message;
