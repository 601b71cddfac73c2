use thiserror::Error;

/// Anything wrong with the bytes on a connection. Always fatal to the session.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic bytes {0:#04x} {1:#04x}")]
    BadMagic(u8, u8),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown method code {0:#04x}")]
    UnknownMethod(u8),

    /// A known message kind sent in the wrong direction.
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("body decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("body encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
