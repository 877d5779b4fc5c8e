// Fundamental protocol constants (RFC 6455)
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WS_VERSION: &str = "13";
pub const MAX_CONTROL_PAYLOAD: usize = 125;

// Default engine tuning constants
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

// Upper bound on buffered HTTP handshake headers before the exchange is rejected
pub const MAX_HANDSHAKE_HEAD_SIZE: usize = 16 * 1024;
