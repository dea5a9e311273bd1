// BitTorrent peer wire protocol implementation: handshake, framing, parsing.

use buffers::{ByteBuf, ByteBufOwned};
use byteorder::{BE, ByteOrder};
use bytes::Bytes;
use clone_to_owned::CloneToOwned;
use core_types::{constants::CHUNK_SIZE, hash_id::Id20, lengths::ChunkInfo};
use serde::{Deserialize, Serialize};

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;
const PIECE_MESSAGE_PREAMBLE_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 2;
pub const PIECE_MESSAGE_DEFAULT_LEN: usize = PIECE_MESSAGE_PREAMBLE_LEN + CHUNK_SIZE as usize;
pub const MAX_MSG_LEN: usize = PIECE_MESSAGE_DEFAULT_LEN;

const PSTR_BT1: &str = "BitTorrent protocol";

type MsgId = u8;

const MSGID_CHOKE: MsgId = 0;
const MSGID_UNCHOKE: MsgId = 1;
const MSGID_INTERESTED: MsgId = 2;
const MSGID_NOT_INTERESTED: MsgId = 3;
const MSGID_HAVE: MsgId = 4;
const MSGID_BITFIELD: MsgId = 5;
const MSGID_REQUEST: MsgId = 6;
const MSGID_PIECE: MsgId = 7;
const MSGID_CANCEL: MsgId = 8;

/// Bit offset within the 8 reserved handshake bytes (big-endian) that
/// advertises support for the extension protocol (BEP-10).
const RESERVED_EXTENSION_BIT: u64 = 1 << 20;
/// Bit offset advertising DHT support (BEP-5).
const RESERVED_DHT_BIT: u64 = 1;

#[derive(Clone, Copy)]
pub struct MsgIdDebug(MsgId);
impl MsgIdDebug {
    const fn name(&self) -> Option<&'static str> {
        let n = match self.0 {
            MSGID_CHOKE => "choke",
            MSGID_UNCHOKE => "unchoke",
            MSGID_INTERESTED => "interested",
            MSGID_NOT_INTERESTED => "not_interested",
            MSGID_HAVE => "have",
            MSGID_BITFIELD => "bitfield",
            MSGID_REQUEST => "request",
            MSGID_PIECE => "piece",
            MSGID_CANCEL => "cancel",
            _ => return None,
        };
        Some(n)
    }
}
impl core::fmt::Debug for MsgIdDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown msg_id {}>", self.0),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data (msgid={1:?}): expected at least {0} more bytes")]
    NotEnoughData(usize, Option<MsgIdDebug>),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("incorrect message length msg_id={msg_id:?}, expected={expected}, received={received}")]
    IncorrectMsgLen {
        received: u32,
        expected: u32,
        msg_id: MsgIdDebug,
    },
    #[error("pstr doesn't match {PSTR_BT1:?}")]
    HandshakePstrWrongContent,
    #[error("pstr should be 19 bytes long but got {0}")]
    HandshakePstrWrongLength(u8),
}

pub fn serialize_piece_preamble(chunk: &ChunkInfo, buf: &mut [u8]) -> usize {
    let len_prefix = MSGID_LEN as u32 + INTEGER_LEN as u32 * 2 + chunk.size;
    BE::write_u32(&mut buf[0..4], len_prefix);
    buf[4] = MSGID_PIECE;
    BE::write_u32(&mut buf[5..9], chunk.piece_index.get());
    BE::write_u32(&mut buf[9..13], chunk.offset);
    PIECE_MESSAGE_PREAMBLE_LEN
}

pub struct Piece<B> {
    pub index: u32,
    pub begin: u32,
    block: B,
}

impl<B: AsRef<[u8]>> std::fmt::Debug for Piece<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CloneToOwned for Piece<ByteBuf<'_>> {
    type Target = Piece<ByteBufOwned>;

    fn clone_to_owned(&self, within_buffer: Option<&Bytes>) -> Self::Target {
        Piece {
            index: self.index,
            begin: self.begin,
            block: self.block.clone_to_owned(within_buffer),
        }
    }
}

impl<B: AsRef<[u8]>> Piece<B> {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.block.as_ref().len()
    }

    pub fn data(&self) -> &[u8] {
        self.block.as_ref()
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        let b = self.block.as_ref();
        buf[8..8 + b.len()].copy_from_slice(b);
        8 + b.len()
    }
}

impl<'a> Piece<ByteBuf<'a>> {
    pub fn from_data(index: u32, begin: u32, block: &'a [u8]) -> Self {
        Piece {
            index,
            begin,
            block: ByteBuf(block),
        }
    }
}

#[derive(Debug)]
pub enum Message<'a> {
    Request(Request),
    Cancel(Request),
    Bitfield(ByteBuf<'a>),
    KeepAlive,
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Piece(Piece<ByteBuf<'a>>),
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("not enough space in buffer")]
    NoSpaceInBuffer,
}

impl From<std::io::Error> for SerializeError {
    fn from(_: std::io::Error) -> Self {
        Self::NoSpaceInBuffer
    }
}

impl Message<'_> {
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        macro_rules! check_len {
            ($l:expr) => {
                if out.len() < $l {
                    return Err(SerializeError::NoSpaceInBuffer);
                }
            };
        }

        macro_rules! write_preamble {
            ($msg_len:expr, $msg_id:expr) => {
                out[0..4].copy_from_slice(&(($msg_len + 1u32).to_be_bytes()));
                out[4] = $msg_id;
            };
        }

        match self {
            Message::Request(request) | Message::Cancel(request) => {
                const TOTAL_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 3;
                check_len!(TOTAL_LEN);
                let msg_id = if matches!(self, Message::Request(..)) {
                    MSGID_REQUEST
                } else {
                    MSGID_CANCEL
                };
                write_preamble!((INTEGER_LEN * 3) as u32, msg_id);
                request.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(TOTAL_LEN)
            }
            Message::Bitfield(b) => {
                let block_len = b.as_ref().len();
                let total_len: usize = PREAMBLE_LEN + block_len;
                check_len!(total_len);
                write_preamble!(block_len as u32, MSGID_BITFIELD);
                out[PREAMBLE_LEN..PREAMBLE_LEN + block_len].copy_from_slice(b.as_ref());
                Ok(total_len)
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                check_len!(PREAMBLE_LEN);
                let msg_id = match self {
                    Message::Choke => MSGID_CHOKE,
                    Message::Unchoke => MSGID_UNCHOKE,
                    Message::Interested => MSGID_INTERESTED,
                    Message::NotInterested => MSGID_NOT_INTERESTED,
                    _ => unreachable!(),
                };
                write_preamble!(0, msg_id);
                Ok(PREAMBLE_LEN)
            }
            Message::Piece(p) => {
                let block_len = p.len();
                let payload_len = INTEGER_LEN * 2 + block_len;
                let total_len = PREAMBLE_LEN + payload_len;
                check_len!(total_len);
                write_preamble!(payload_len as u32, MSGID_PIECE);
                p.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(total_len)
            }
            Message::KeepAlive => {
                check_len!(4);
                out[0..4].copy_from_slice(&0u32.to_be_bytes());
                Ok(4)
            }
            Message::Have(v) => {
                check_len!(PREAMBLE_LEN + INTEGER_LEN);
                write_preamble!(INTEGER_LEN as u32, MSGID_HAVE);
                out[5..9].copy_from_slice(&v.to_be_bytes());
                Ok(9)
            }
        }
    }
}

impl Message<'_> {
    /// Decodes one frame from a contiguous buffer. Returns the message and
    /// the number of bytes consumed, including the length prefix.
    ///
    /// Unknown message ids are tolerated per the wire spec: the caller gets
    /// `UnsupportedMessageId` and is expected to skip `total_len` bytes
    /// using the length prefix rather than treating it as a hard error.
    pub fn deserialize(buf: &[u8]) -> Result<(Message<'_>, usize), MessageDeserializeError> {
        if buf.len() < 4 {
            return Err(MessageDeserializeError::NotEnoughData(4 - buf.len(), None));
        }
        let len_prefix = BE::read_u32(&buf[0..4]);
        let total_len = len_prefix as usize + 4;
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, 4));
        }

        if buf.len() < 5 {
            return Err(MessageDeserializeError::NotEnoughData(
                5 - buf.len(),
                None,
            ));
        }
        let msg_id = buf[4];
        let msg_len = len_prefix as usize - 1;
        let body = &buf[5..];
        if body.len() < msg_len {
            return Err(MessageDeserializeError::NotEnoughData(
                msg_len - body.len(),
                Some(MsgIdDebug(msg_id)),
            ));
        }

        macro_rules! check_msg_len {
            ($expected:expr) => {{
                if msg_len != $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: len_prefix - 1,
                        expected: $expected,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
            (min $expected:expr) => {{
                if msg_len < $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: len_prefix - 1,
                        expected: $expected,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
        }

        match msg_id {
            MSGID_CHOKE => {
                check_msg_len!(0);
                Ok((Message::Choke, total_len))
            }
            MSGID_UNCHOKE => {
                check_msg_len!(0);
                Ok((Message::Unchoke, total_len))
            }
            MSGID_INTERESTED => {
                check_msg_len!(0);
                Ok((Message::Interested, total_len))
            }
            MSGID_NOT_INTERESTED => {
                check_msg_len!(0);
                Ok((Message::NotInterested, total_len))
            }
            MSGID_HAVE => {
                check_msg_len!(4);
                Ok((Message::Have(BE::read_u32(&body[0..4])), total_len))
            }
            MSGID_BITFIELD => {
                check_msg_len!(min 1);
                Ok((Message::Bitfield(ByteBuf(&body[..msg_len])), total_len))
            }
            MSGID_REQUEST | MSGID_CANCEL => {
                check_msg_len!(12);
                let request = Request {
                    index: BE::read_u32(&body[0..4]),
                    begin: BE::read_u32(&body[4..8]),
                    length: BE::read_u32(&body[8..12]),
                };
                let msg = if msg_id == MSGID_REQUEST {
                    Message::Request(request)
                } else {
                    Message::Cancel(request)
                };
                Ok((msg, total_len))
            }
            MSGID_PIECE => {
                const MIN_PAYLOAD: usize = 1;
                const MIN_LENGTH: usize = INTEGER_LEN * 2 + MIN_PAYLOAD;
                if msg_len < MIN_LENGTH {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        expected: MIN_LENGTH as u32,
                        received: msg_len as u32,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
                let index = BE::read_u32(&body[0..4]);
                let begin = BE::read_u32(&body[4..8]);
                let block = &body[8..msg_len];
                Ok((
                    Message::Piece(Piece {
                        index,
                        begin,
                        block: ByteBuf(block),
                    }),
                    total_len,
                ))
            }
            msg_id => Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        debug_assert_eq!(PSTR_BT1.len(), 19);
        Handshake {
            reserved: RESERVED_EXTENSION_BIT,
            info_hash,
            peer_id,
        }
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), MessageDeserializeError> {
        const LEN: usize = 1 + PSTR_BT1.len() + 8 + 20 + 20;
        if b.len() < LEN {
            return Err(MessageDeserializeError::NotEnoughData(LEN - b.len(), None));
        }
        if b[0] as usize != PSTR_BT1.len() {
            return Err(MessageDeserializeError::HandshakePstrWrongLength(b[0]));
        }
        if &b[1..20] != PSTR_BT1.as_bytes() {
            return Err(MessageDeserializeError::HandshakePstrWrongContent);
        }

        let h = Handshake {
            reserved: BE::read_u64(&b[20..28]),
            info_hash: Id20::new(b[28..48].try_into().unwrap()),
            peer_id: Id20::new(b[48..68].try_into().unwrap()),
        };
        Ok((h, LEN))
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved & RESERVED_EXTENSION_BIT > 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved & RESERVED_DHT_BIT > 0
    }

    /// The effective capability set for a connection is the bitwise OR of
    /// both sides' reserved bytes.
    pub fn combined_capabilities(ours: u64, theirs: u64) -> u64 {
        ours | theirs
    }

    #[must_use]
    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        debug_assert_eq!(PSTR_BT1.len(), 19);
        buf[0] = 19;
        buf[1..20].copy_from_slice(PSTR_BT1.as_bytes());
        buf[20..28].copy_from_slice(&self.reserved.to_be_bytes());
        buf[28..48].copy_from_slice(&self.info_hash.0);
        buf[48..68].copy_from_slice(&self.peer_id.0);
        68
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize() {
        let info_hash = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let peer_id = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let mut buf = [0u8; 100];
        let se = Handshake::new(info_hash, peer_id);
        let len = se.serialize_unchecked_len(&mut buf);
        assert_eq!(len, 20 + 20 + 8 + 19 + 1);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PSTR_BT1.as_bytes());
        assert_eq!(&buf[28..48], &info_hash.0);
        assert_eq!(&buf[48..68], &peer_id.0);

        let (de, dlen) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(dlen, len);
        assert_eq!(se, de);
        assert!(de.supports_extended());
    }

    #[test]
    fn test_handshake_wrong_pstr() {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(b"NotBitTorrent proto");
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageDeserializeError::HandshakePstrWrongContent)
        ));
    }

    #[test]
    fn test_deserialize_piece() {
        const LEN: usize = 100;
        const EXTRA: usize = 100;
        let mut buf = [0u8; LEN + EXTRA];

        #[allow(clippy::needless_range_loop)]
        for id in 0..buf.len() {
            buf[id] = id as u8;
        }

        let block_len = LEN - PREAMBLE_LEN - INTEGER_LEN * 2;
        let len_prefix: u32 = (block_len + INTEGER_LEN * 2 + MSGID_LEN) as u32;
        let index: u32 = 42;
        let begin: u32 = 43;

        buf[0..4].copy_from_slice(&len_prefix.to_be_bytes());
        buf[4] = MSGID_PIECE;
        buf[5..9].copy_from_slice(&index.to_be_bytes());
        buf[9..13].copy_from_slice(&begin.to_be_bytes());

        let (msg, len) = Message::deserialize(&buf).unwrap();
        let piece = match &msg {
            Message::Piece(piece) => piece,
            other => panic!("expected piece got {other:?}"),
        };
        assert_eq!(piece.len(), block_len);
        assert_eq!(piece.index, index);
        assert_eq!(piece.begin, begin);
        assert_eq!(len, LEN);

        let mut tmp = [0u8; 100];
        let slen = msg.serialize(&mut tmp).unwrap();
        assert_eq!(slen, len);
        assert_eq!(buf[..len], tmp[..len]);
        assert_eq!(piece.data(), &buf[13..13 + block_len]);
    }

    #[test]
    fn test_deserialize_request_and_cancel() {
        let mut buf = [0u8; 17];
        let len_prefix: u32 = (MSGID_LEN + INTEGER_LEN * 3) as u32;
        buf[0..4].copy_from_slice(&len_prefix.to_be_bytes());
        buf[4] = MSGID_REQUEST;
        buf[5..9].copy_from_slice(&42u32.to_be_bytes());
        buf[9..13].copy_from_slice(&43u32.to_be_bytes());
        buf[13..17].copy_from_slice(&44u32.to_be_bytes());

        let (msg, len) = Message::deserialize(&buf).unwrap();
        let request = match msg {
            Message::Request(req) => req,
            other => panic!("expected request got {other:?}"),
        };
        assert_eq!(request, Request::new(42, 43, 44));
        assert_eq!(len, 17);

        buf[4] = MSGID_CANCEL;
        let (msg, _) = Message::deserialize(&buf).unwrap();
        assert!(matches!(msg, Message::Cancel(_)));
    }

    #[test]
    fn test_keepalive() {
        let buf = [0u8; 4];
        let (msg, len) = Message::deserialize(&buf).unwrap();
        assert!(matches!(msg, Message::KeepAlive));
        assert_eq!(len, 4);
    }

    #[test]
    fn test_have() {
        let mut buf = [0u8; 9];
        buf[0..4].copy_from_slice(&5u32.to_be_bytes());
        buf[4] = MSGID_HAVE;
        buf[5..9].copy_from_slice(&42u32.to_be_bytes());

        let (msg, len) = Message::deserialize(&buf).unwrap();
        assert!(matches!(msg, Message::Have(42)));
        assert_eq!(len, 9);
    }

    #[test]
    fn test_bitfield() {
        let mut buf = [0u8; 47];
        buf[0..4].copy_from_slice(&43u32.to_be_bytes());
        buf[4] = MSGID_BITFIELD;
        for byte in buf[5..47].iter_mut() {
            *byte = 0b10101010;
        }

        let (msg, len) = Message::deserialize(&buf).unwrap();
        let bf = match &msg {
            Message::Bitfield(bf) => bf,
            other => panic!("expected bitfield, got {other:?}"),
        };
        assert_eq!(len, 47);
        assert_eq!(bf.as_ref().len(), 42);

        let mut tmp = [0u8; 47];
        let slen = msg.serialize(&mut tmp).unwrap();
        assert_eq!(slen, len);
        assert_eq!(buf[..len], tmp[..len]);
    }

    #[test]
    fn test_unknown_message_id_is_tolerated_by_skipping() {
        let mut buf = [0u8; 9];
        buf[0..4].copy_from_slice(&5u32.to_be_bytes());
        buf[4] = 200;
        buf[5..9].copy_from_slice(&[1, 2, 3, 4]);

        match Message::deserialize(&buf) {
            Err(MessageDeserializeError::UnsupportedMessageId(200)) => {}
            other => panic!("expected UnsupportedMessageId, got {other:?}"),
        }
        // caller is expected to skip len_prefix + 4 bytes using the prefix alone.
    }
}
