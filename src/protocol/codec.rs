//! Binary framing
//!
//! ```text
//! +--------+--------+---------+--------+----------------------+
//! | 0x83   | 0x84   | version | method | body length (u32 BE) |
//! +--------+--------+---------+--------+----------------------+
//! | body: `length` bytes of MessagePack                        |
//! +------------------------------------------------------------+
//! ```

use super::error::ProtocolError;
use super::message::{Message, Method};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC_BYTE1: u8 = 0x83;
pub const MAGIC_BYTE2: u8 = 0x84;
pub const PROTOCOL_VERSION: u8 = 0x00;

pub const HEADER_SIZE: usize = 8;

/// Default cap on a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub method: Method,
    pub body_len: u32,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let len = self.body_len.to_be_bytes();
        [
            MAGIC_BYTE1,
            MAGIC_BYTE2,
            PROTOCOL_VERSION,
            self.method.code(),
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }

    /// Validate magic, version and method code.
    pub fn parse(head: &[u8; HEADER_SIZE]) -> Result<Self, ProtocolError> {
        if head[0] != MAGIC_BYTE1 || head[1] != MAGIC_BYTE2 {
            return Err(ProtocolError::BadMagic(head[0], head[1]));
        }
        if head[2] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(head[2]));
        }
        let method = Method::try_from(head[3])?;
        let body_len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]);
        Ok(FrameHeader { method, body_len })
    }
}

/// Append one framed message to `dst`.
pub fn write_message(
    msg: &Message,
    dst: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<(), ProtocolError> {
    let body = msg.encode_body()?;
    if body.len() > max_frame_bytes || body.len() > u32::MAX as usize {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame_bytes,
        });
    }

    let header = FrameHeader {
        method: msg.method(),
        body_len: body.len() as u32,
    };
    dst.reserve(HEADER_SIZE + body.len());
    dst.put_slice(&header.to_bytes());
    dst.put_slice(&body);
    Ok(())
}

/// Take one complete message off the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched until a whole frame is
/// buffered. The header is validated as soon as it is available so garbage is
/// rejected without waiting for a body.
pub fn read_message(
    src: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Message>, ProtocolError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&src[..HEADER_SIZE]);
    let header = FrameHeader::parse(&head)?;

    let body_len = header.body_len as usize;
    if body_len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: max_frame_bytes,
        });
    }

    let frame_len = HEADER_SIZE + body_len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let body = src.split_to(body_len);
    Message::decode_body(header.method, &body).map(Some)
}

/// `tokio_util` codec over [`read_message`] / [`write_message`].
#[derive(Debug, Clone, Copy)]
pub struct StaggerCodec {
    max_frame_bytes: usize,
}

impl StaggerCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        StaggerCodec { max_frame_bytes }
    }
}

impl Default for StaggerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for StaggerCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        read_message(src, self.max_frame_bytes)
    }
}

impl Encoder<Message> for StaggerCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        write_message(&item, dst, self.max_frame_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RegisterProcess, StatCount, StatDist, StatValue, Stats};

    fn encode(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        write_message(msg, &mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap();
        buf
    }

    fn sample_stats() -> Stats {
        Stats {
            timestamp: 1_400_000_000,
            values: vec![StatValue::new("latency,host=a", 12.5)],
            counts: vec![StatCount::new("requests", 3.0)],
            dists: vec![StatDist::new("size", [2.0, 1.0, 9.0, 10.0, 82.0])],
        }
    }

    #[test]
    fn test_stats_complete_round_trip() {
        let mut buf = encode(&Message::StatsComplete(Stats::new(1337)));

        match read_message(&mut buf, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            Some(Message::StatsComplete(stats)) => assert_eq!(stats.timestamp, 1337),
            other => panic!("expected stats_complete, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_every_kind_re_encodes_to_identical_bytes() {
        let mut tags = RegisterProcess::default();
        tags.tags.insert("cmd".to_string(), "worker".to_string());
        tags.tags.insert("pid".to_string(), "4242".to_string());

        let messages = vec![
            Message::Ping,
            Message::Pong,
            Message::report_all(1_400_000_010),
            Message::RegisterProcess(tags),
            Message::StatsPartial(sample_stats()),
            Message::StatsComplete(sample_stats()),
        ];

        for msg in messages {
            let bytes = encode(&msg);
            let mut src = bytes.clone();
            let decoded = read_message(&mut src, DEFAULT_MAX_FRAME_BYTES)
                .unwrap()
                .unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(encode(&decoded), bytes, "{} not byte-exact", msg.method().as_str());
        }
    }

    #[test]
    fn test_nil_vectors_from_go_client_decode_empty() {
        // Go leaves unset slices nil, which msgpack writes as 0xc0
        #[derive(serde::Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct GoStats {
            timestamp: i64,
            values: Option<Vec<StatValue>>,
            counts: Option<Vec<StatCount>>,
            dists: Option<Vec<StatDist>>,
        }
        let body = rmp_serde::to_vec_named(&GoStats {
            timestamp: 1000,
            values: None,
            counts: Some(vec![StatCount::new("foo", 1.0)]),
            dists: None,
        })
        .unwrap();

        let mut src = BytesMut::new();
        src.put_slice(&[MAGIC_BYTE1, MAGIC_BYTE2, PROTOCOL_VERSION, 0x43]);
        src.put_u32(body.len() as u32);
        src.put_slice(&body);

        match read_message(&mut src, DEFAULT_MAX_FRAME_BYTES).unwrap() {
            Some(Message::StatsComplete(stats)) => {
                assert_eq!(stats.timestamp, 1000);
                assert!(stats.values.is_empty());
                assert!(stats.dists.is_empty());
                assert_eq!(stats.counts, vec![StatCount::new("foo", 1.0)]);
            }
            other => panic!("expected stats_complete, got {:?}", other),
        }
        assert!(src.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(&Message::report_all(1));
        let body_len = buf.len() - HEADER_SIZE;

        assert_eq!(buf[0], 0x83);
        assert_eq!(buf[1], 0x84);
        assert_eq!(buf[2], 0x00);
        assert_eq!(buf[3], 0x30);
        assert_eq!(&buf[4..8], &(body_len as u32).to_be_bytes());

        let ping = encode(&Message::Ping);
        assert_eq!(&ping[..], &[0x83, 0x84, 0x00, 0x28, 0, 0, 0, 0]);
    }

    #[test]
    fn test_partial_frames_wait_for_more() {
        let full = encode(&Message::StatsComplete(sample_stats()));

        let mut src = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            src.put_u8(*byte);
            let decoded = read_message(&mut src, DEFAULT_MAX_FRAME_BYTES).unwrap();
            if i + 1 < full.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(Message::StatsComplete(sample_stats())));
            }
        }
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut src = encode(&Message::Ping);
        src.extend_from_slice(&encode(&Message::report_all(5)));

        assert_eq!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES).unwrap(),
            Some(Message::Ping)
        );
        assert_eq!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES).unwrap(),
            Some(Message::report_all(5))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn test_bad_magic() {
        let mut src = BytesMut::from(&[0x00, 0x84, 0x00, 0x28, 0, 0, 0, 0][..]);
        assert!(matches!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtocolError::BadMagic(0x00, 0x84))
        ));
    }

    #[test]
    fn test_bad_version() {
        let mut src = BytesMut::from(&[0x83, 0x84, 0x07, 0x28, 0, 0, 0, 0][..]);
        assert!(matches!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtocolError::UnsupportedVersion(0x07))
        ));
    }

    #[test]
    fn test_unknown_method() {
        let mut src = BytesMut::from(&[0x83, 0x84, 0x00, 0x7f, 0, 0, 0, 0][..]);
        assert!(matches!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtocolError::UnknownMethod(0x7f))
        ));
    }

    #[test]
    fn test_frame_too_large_rejected_from_header() {
        let mut src = BytesMut::from(&[0x83, 0x84, 0x00, 0x43, 0, 0, 0x10, 0x01][..]);
        assert!(matches!(
            read_message(&mut src, 4096),
            Err(ProtocolError::FrameTooLarge { size: 4097, max: 4096 })
        ));
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let mut src = BytesMut::from(&[0x83, 0x84, 0x00, 0x43, 0, 0, 0, 2, 0xc1, 0xc1][..]);
        assert!(matches!(
            read_message(&mut src, DEFAULT_MAX_FRAME_BYTES),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_codec_trait_impls() {
        let mut codec = StaggerCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::report_all(99), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Message::report_all(99)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
