//! Stagger wire protocol
//!
//! Every message is an 8-byte header followed by a MessagePack body. See
//! [`codec`] for the frame layout and [`message`] for the message kinds.

mod codec;
mod error;
mod message;

pub use codec::{
    read_message, write_message, FrameHeader, StaggerCodec, DEFAULT_MAX_FRAME_BYTES,
    HEADER_SIZE, MAGIC_BYTE1, MAGIC_BYTE2, PROTOCOL_VERSION,
};
pub use error::ProtocolError;
pub use message::{
    Message, Method, RegisterProcess, ReportAll, StatCount, StatDist, StatValue, Stats,
};
