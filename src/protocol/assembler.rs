//! Reassembly of fragmented data frames into complete messages
//!
//! A non-final text or binary frame opens a pending message, continuation
//! frames append, and the frame with FIN set finalizes it. Control frames
//! never pass through here; the connection worker dispatches them directly,
//! so interleaved ping/pong/close cannot disturb a pending message.

use bytes::BytesMut;

use crate::core::message::Message;
use crate::error::{Result, SockletError};
use crate::protocol::frame::{Frame, Opcode};

#[derive(Debug)]
struct Pending {
    opcode: Opcode,
    data: BytesMut,
}

#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    pending: Option<Pending>,
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            pending: None,
        }
    }

    /// True while a fragmented message is waiting for its final frame
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Consume one data frame; yields a message when one completes
    pub fn push_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => self.push_data(frame),
            Opcode::Continuation => self.push_continuation(frame),
            other => Err(SockletError::Protocol(format!(
                "control opcode 0x{:X} routed to the message assembler",
                other as u8
            ))),
        }
    }

    fn push_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        if self.pending.is_some() {
            self.pending = None;
            return Err(SockletError::Protocol(
                "new data frame while a fragmented message is pending".to_string(),
            ));
        }

        if frame.payload.len() > self.max_message_size {
            return Err(SockletError::Protocol(format!(
                "message of {} bytes exceeds {} byte limit",
                frame.payload.len(),
                self.max_message_size
            )));
        }

        if frame.fin {
            return finalize(frame.opcode, frame.payload.as_ref()).map(Some);
        }

        let mut data = BytesMut::with_capacity(frame.payload.len());
        data.extend_from_slice(&frame.payload);
        self.pending = Some(Pending {
            opcode: frame.opcode,
            data,
        });
        Ok(None)
    }

    fn push_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(SockletError::Protocol(
                "continuation frame without a pending message".to_string(),
            ));
        };

        pending.data.extend_from_slice(&frame.payload);
        if pending.data.len() > self.max_message_size {
            let size = pending.data.len();
            self.pending = None;
            return Err(SockletError::Protocol(format!(
                "message of {} bytes exceeds {} byte limit",
                size, self.max_message_size
            )));
        }

        if !frame.fin {
            return Ok(None);
        }

        let done = self.pending.take().expect("pending checked above");
        finalize(done.opcode, &done.data).map(Some)
    }
}

fn finalize(opcode: Opcode, data: &[u8]) -> Result<Message> {
    match opcode {
        Opcode::Text => {
            let text = std::str::from_utf8(data).map_err(|_| {
                SockletError::Protocol("text message is not valid UTF-8".to_string())
            })?;
            Ok(Message::Text(text.to_string()))
        }
        Opcode::Binary => Ok(Message::Binary(data.to_vec().into())),
        _ => Err(SockletError::Protocol(
            "only data opcodes can finalize a message".to_string(),
        )),
    }
}
