//! WebSocket frame codec (RFC 6455 section 5)
//! Encodes and decodes wire frames with role-aware masking

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_CONTROL_PAYLOAD;
use crate::error::{Result, SockletError};

/// Frame opcode (4 bits on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Close, ping and pong are control frames
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    pub const fn is_data(self) -> bool {
        matches!(self, Self::Continuation | Self::Text | Self::Binary)
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(SockletError::Protocol(format!(
                "reserved opcode 0x{:X}",
                other
            ))),
        }
    }
}

/// Which end of the connection this codec speaks for.
/// Client frames must be masked, server frames must not be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A single wire frame. Ephemeral: produced and consumed per I/O cycle.
#[derive(Debug, Clone)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    /// Masking key as seen on the wire; payload is always stored unmasked
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    fn data(opcode: Opcode, payload: Bytes) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload,
        }
    }

    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Text, payload.into())
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Binary, payload.into())
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Ping, payload.into())
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Pong, payload.into())
    }

    pub fn close(payload: impl Into<Bytes>) -> Self {
        Self::data(Opcode::Close, payload.into())
    }

    /// A fragment of a data message; fin marks the final fragment
    pub fn fragment(opcode: Opcode, fin: bool, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }
}

/// Role-aware frame encoder/decoder.
///
/// Decoding is resumable: `decode` consumes nothing until a complete frame
/// is buffered and returns `Ok(None)` when more bytes are needed.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_frame_size: crate::constants::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Encode a frame into `dst`. Client-role codecs mask the payload with a
    /// fresh random key per frame; server-role codecs write it unmasked.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
        let payload_len = frame.payload.len();

        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(SockletError::Protocol(
                    "control frames must not be fragmented".to_string(),
                ));
            }
            if payload_len > MAX_CONTROL_PAYLOAD {
                return Err(SockletError::Protocol(format!(
                    "control frame payload of {} bytes exceeds {} byte limit",
                    payload_len, MAX_CONTROL_PAYLOAD
                )));
            }
        }

        let should_mask = self.role == Role::Client;
        let mask_bit: u8 = if should_mask { 0x80 } else { 0x00 };

        let mut first_byte = frame.opcode as u8;
        if frame.fin {
            first_byte |= 0x80;
        }

        let extended_len = if payload_len > 65535 {
            8
        } else if payload_len > 125 {
            2
        } else {
            0
        };
        let mask_len = if should_mask { 4 } else { 0 };
        dst.reserve(2 + extended_len + mask_len + payload_len);

        dst.put_u8(first_byte);
        if payload_len <= 125 {
            dst.put_u8(mask_bit | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(payload_len as u64);
        }

        if should_mask {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            let mut masked = BytesMut::from(frame.payload.as_ref());
            apply_mask(&mut masked, key);
            dst.put_slice(&masked);
        } else {
            dst.put_slice(&frame.payload);
        }

        Ok(())
    }

    /// Decode one frame from `src` if fully buffered.
    ///
    /// Returns `Ok(None)` when the buffer holds only a partial frame; no
    /// bytes are consumed in that case, so the caller may retry after more
    /// data arrives.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }

        let first_byte = src[0];
        let second_byte = src[1];

        let fin = (first_byte & 0x80) != 0;
        if (first_byte & 0x70) != 0 {
            return Err(SockletError::Protocol(
                "reserved bits set without a negotiated extension".to_string(),
            ));
        }
        let opcode = Opcode::from_u8(first_byte & 0x0F)?;
        let masked = (second_byte & 0x80) != 0;
        let len7 = second_byte & 0x7F;

        // RFC 6455 section 5.1: client-to-server frames must be masked,
        // server-to-client frames must not be
        match self.role {
            Role::Server if !masked => {
                return Err(SockletError::Protocol(
                    "client frame is not masked".to_string(),
                ))
            }
            Role::Client if masked => {
                return Err(SockletError::Protocol(
                    "server frame is masked".to_string(),
                ))
            }
            _ => {}
        }

        if opcode.is_control() {
            if !fin {
                return Err(SockletError::Protocol(
                    "control frames must not be fragmented".to_string(),
                ));
            }
            if len7 as usize > MAX_CONTROL_PAYLOAD {
                return Err(SockletError::Protocol(format!(
                    "control frame payload of {} bytes exceeds {} byte limit",
                    len7, MAX_CONTROL_PAYLOAD
                )));
            }
        }

        let (header_len, payload_len) = match len7 {
            0..=125 => (2usize, u64::from(len7)),
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (4, u64::from(u16::from_be_bytes([src[2], src[3]])))
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len_bytes = [0u8; 8];
                len_bytes.copy_from_slice(&src[2..10]);
                let len = u64::from_be_bytes(len_bytes);
                if len & (1 << 63) != 0 {
                    return Err(SockletError::Protocol(
                        "64-bit payload length has most significant bit set".to_string(),
                    ));
                }
                (10, len)
            }
            _ => unreachable!(),
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(SockletError::Protocol(format!(
                "frame payload of {} bytes exceeds {} byte limit",
                payload_len, self.max_frame_size
            )));
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len as usize;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(header_len);
        let mask = if masked {
            let key_bytes = src.split_to(4);
            let mut key = [0u8; 4];
            key.copy_from_slice(&key_bytes);
            Some(key)
        } else {
            None
        };

        let mut payload = src.split_to(payload_len as usize);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

/// XOR the payload with the 4-byte key; symmetric for mask and unmask
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(encoder: &FrameCodec, decoder: &FrameCodec, frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        encoder.encode(&frame, &mut buf).unwrap();
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty(), "decode left bytes behind");
        decoded
    }

    #[test]
    fn test_encode_decode_identity_across_length_encodings() {
        let encoder = FrameCodec::client();
        let decoder = FrameCodec::server().with_max_frame_size(1 << 20);
        // Covers the 7-bit, 16-bit and 64-bit payload length encodings
        for size in [0usize, 1, 125, 126, 65535, 65536] {
            let payload = vec![0xAB; size];
            let frame = Frame::binary(payload.clone());
            let decoded = roundtrip(&encoder, &decoder, frame);
            assert!(decoded.fin);
            assert_eq!(decoded.opcode, Opcode::Binary);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_text_frame_roundtrip() {
        let decoded = roundtrip(
            &FrameCodec::client(),
            &FrameCodec::server(),
            Frame::text("Hello, WebSocket!"),
        );
        assert_eq!(decoded.opcode, Opcode::Text);
        assert_eq!(decoded.payload.as_ref(), b"Hello, WebSocket!");
    }

    #[test]
    fn test_client_frames_are_masked_on_the_wire() {
        let mut buf = BytesMut::new();
        FrameCodec::client()
            .encode(&Frame::text("masked"), &mut buf)
            .unwrap();
        assert_ne!(buf[1] & 0x80, 0);
        // Wire payload must differ from the plaintext unless the key is zero
        let decoded = FrameCodec::server().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"masked");
        assert!(decoded.mask.is_some());
    }

    #[test]
    fn test_server_frames_are_unmasked_on_the_wire() {
        let mut buf = BytesMut::new();
        FrameCodec::server()
            .encode(&Frame::text("plain"), &mut buf)
            .unwrap();
        assert_eq!(buf[1] & 0x80, 0);
        assert_eq!(&buf[2..], b"plain");
    }

    #[test]
    fn test_server_rejects_unmasked_client_frame() {
        // Server-role encoding produces an unmasked frame; feeding it back
        // to a server-role decoder must fail
        let mut buf = BytesMut::new();
        FrameCodec::server()
            .encode(&Frame::text("oops"), &mut buf)
            .unwrap();
        let result = FrameCodec::server().decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_client_rejects_masked_server_frame() {
        let mut buf = BytesMut::new();
        FrameCodec::client()
            .encode(&Frame::text("oops"), &mut buf)
            .unwrap();
        let result = FrameCodec::client().decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_partial_frame_consumes_nothing() {
        let mut buf = BytesMut::new();
        FrameCodec::client()
            .encode(&Frame::text("partial delivery"), &mut buf)
            .unwrap();
        let mut partial = buf.clone();
        partial.truncate(5);
        let before = partial.len();
        assert!(FrameCodec::server().decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), before);
        // The full buffer still decodes
        assert!(FrameCodec::server().decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let encoder = FrameCodec::server();
        let decoder = FrameCodec::client();
        let mut buf = BytesMut::new();
        encoder.encode(&Frame::text("first"), &mut buf).unwrap();
        encoder.encode(&Frame::text("second"), &mut buf).unwrap();

        let one = decoder.decode(&mut buf).unwrap().unwrap();
        let two = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(one.payload.as_ref(), b"first");
        assert_eq!(two.payload.as_ref(), b"second");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_control_frame_rejected_on_encode() {
        let frame = Frame::ping(vec![0u8; 126]);
        let mut buf = BytesMut::new();
        let result = FrameCodec::client().encode(&frame, &mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_fragmented_control_frame_rejected_on_encode() {
        let frame = Frame::fragment(Opcode::Ping, false, "data");
        let mut buf = BytesMut::new();
        let result = FrameCodec::client().encode(&frame, &mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_fragmented_control_frame_rejected_on_decode() {
        // Hand-built unmasked ping with FIN clear
        let mut buf = BytesMut::from(&[0x09u8, 0x00][..]);
        let result = FrameCodec::client().decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_reserved_opcode_rejected() {
        let mut buf = BytesMut::from(&[0x83u8, 0x00][..]);
        let result = FrameCodec::client().decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_reserved_bits_rejected() {
        let mut buf = BytesMut::from(&[0xC1u8, 0x00][..]);
        let result = FrameCodec::client().decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_frame_over_size_limit_rejected() {
        let codec = FrameCodec::server().with_max_frame_size(64);
        let mut buf = BytesMut::new();
        FrameCodec::client()
            .encode(&Frame::binary(vec![0u8; 65]), &mut buf)
            .unwrap();
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(SockletError::Protocol(_))));
    }

    #[test]
    fn test_apply_mask_is_symmetric() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let mut payload = b"Hello".to_vec();
        apply_mask(&mut payload, key);
        assert_ne!(payload.as_slice(), b"Hello");
        apply_mask(&mut payload, key);
        assert_eq!(payload.as_slice(), b"Hello");
    }
}
