//! Close handshake payloads and the RFC 6455 close-code registry

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SockletError};

/// Close status codes from the RFC 6455 registry (1000-1015)
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED: u16 = 1003;
    /// Reported locally when a close frame carried no status code
    pub const NO_STATUS: u16 = 1005;
    /// Reported locally on abnormal closure; never sent on the wire
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MISSING_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;
}

/// Codes 1005, 1006 and 1015 describe local conditions and must never
/// appear in a close frame on the wire
pub fn is_sendable(code: u16) -> bool {
    !matches!(
        code,
        close_code::NO_STATUS | close_code::ABNORMAL | close_code::TLS_HANDSHAKE
    )
}

/// Close frame body: a status code and a short UTF-8 reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }

    /// Encode as a close frame payload. The reason is truncated so the
    /// payload stays within the 125-byte control frame limit.
    pub fn to_payload(&self) -> Bytes {
        let mut reason = self.reason.as_str();
        while reason.len() > 123 {
            let mut cut = reason.len() - 1;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason = &reason[..cut];
        }
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(self.code);
        buf.put_slice(reason.as_bytes());
        buf.freeze()
    }

    /// Parse a received close frame payload.
    ///
    /// An empty payload is valid and yields `None` (reported as 1005).
    /// A one-byte payload, a reserved local-only code, or a non-UTF-8
    /// reason are protocol violations.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>> {
        if payload.is_empty() {
            return Ok(None);
        }
        if payload.len() == 1 {
            return Err(SockletError::Protocol(
                "close payload of one byte".to_string(),
            ));
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if code < 1000 || !is_sendable(code) {
            return Err(SockletError::Protocol(format!(
                "close code {} must not appear on the wire",
                code
            )));
        }
        let reason = std::str::from_utf8(&payload[2..])
            .map_err(|_| SockletError::Protocol("close reason is not valid UTF-8".to_string()))?
            .to_string();
        Ok(Some(Self { code, reason }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let frame = CloseFrame::new(close_code::NORMAL, "bye");
        let payload = frame.to_payload();
        let parsed = CloseFrame::parse(&payload).unwrap().unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_empty_payload_is_no_status() {
        assert!(CloseFrame::parse(&[]).unwrap().is_none());
    }

    #[test]
    fn test_one_byte_payload_rejected() {
        assert!(matches!(
            CloseFrame::parse(&[0x03]),
            Err(SockletError::Protocol(_))
        ));
    }

    #[test]
    fn test_local_only_codes_rejected_on_the_wire() {
        for code in [close_code::NO_STATUS, close_code::ABNORMAL, close_code::TLS_HANDSHAKE] {
            let payload = code.to_be_bytes();
            assert!(matches!(
                CloseFrame::parse(&payload),
                Err(SockletError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_invalid_utf8_reason_rejected() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        assert!(matches!(
            CloseFrame::parse(&payload),
            Err(SockletError::Protocol(_))
        ));
    }

    #[test]
    fn test_long_reason_truncated_to_control_limit() {
        let frame = CloseFrame::new(close_code::NORMAL, "x".repeat(200));
        let payload = frame.to_payload();
        assert!(payload.len() <= 125);
        assert!(CloseFrame::parse(&payload).unwrap().is_some());
    }

    #[test]
    fn test_sendability() {
        assert!(is_sendable(close_code::NORMAL));
        assert!(is_sendable(close_code::PROTOCOL_ERROR));
        assert!(!is_sendable(close_code::NO_STATUS));
        assert!(!is_sendable(close_code::ABNORMAL));
        assert!(!is_sendable(close_code::TLS_HANDSHAKE));
    }
}
