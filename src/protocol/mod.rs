//! RFC 6455 wire protocol: framing, handshake, close codes and
//! message reassembly

pub mod assembler;
pub mod close;
pub mod frame;
pub mod handshake;

// Re-export main components for convenience
pub use assembler::MessageAssembler;
pub use close::{close_code, CloseFrame};
pub use frame::{Frame, FrameCodec, Opcode, Role};
pub use handshake::Target;
