//! Client configuration module
//! Handles tuning parameters for the WebSocket engine

use crate::constants::{
    DEFAULT_CLOSE_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_FRAME_SIZE,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE,
};
use crate::error::{Result, SockletError};
use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Connection tuning parameters
#[derive(Clone)]
pub struct ClientConfig {
    /// Bound on TCP connect plus the upgrade handshake
    pub connect_timeout: Duration,
    /// Bound on the close handshake before the connection is forced CLOSED
    pub close_timeout: Duration,
    /// Maximum payload size of a single frame
    pub max_frame_size: usize,
    /// Maximum size of a reassembled fragmented message
    pub max_message_size: usize,
    /// Read buffer growth increment for the worker
    pub read_buffer_size: usize,
    /// TLS configuration for wss:// targets; plain ws:// ignores this
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            close_timeout: Duration::from_secs(DEFAULT_CLOSE_TIMEOUT_SECS),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            tls: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("close_timeout", &self.close_timeout)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let connect_secs = env::var("SOCKLET_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);

        let close_secs = env::var("SOCKLET_CLOSE_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT_SECS);

        let max_frame_size = env::var("SOCKLET_MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);

        let max_message_size = env::var("SOCKLET_MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE);

        let read_buffer_size = env::var("SOCKLET_READ_BUFFER_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_READ_BUFFER_SIZE);

        let config = Self {
            connect_timeout: Duration::from_secs(connect_secs),
            close_timeout: Duration::from_secs(close_secs),
            max_frame_size,
            max_message_size,
            read_buffer_size,
            tls: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the TLS configuration used for wss:// targets
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(SockletError::Config(
                "read buffer size must be non-zero".to_string(),
            ));
        }
        if self.max_message_size < self.max_frame_size {
            return Err(SockletError::Config(format!(
                "max message size ({}) must be at least max frame size ({})",
                self.max_message_size, self.max_frame_size
            )));
        }
        Ok(())
    }
}
