use std::fmt;
use bytes::{BufMut, Buf, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use crate::{block::{BlockData, BlockInfo}, Bitfield};
use super::PeerError;

// Ceiling on bytes buffered from a peer before the stream is considered broken.
pub const MAX_BUFFER_LEN: usize = 1 << 20;

// Largest single message we accept, half the buffer ceiling.
pub const MAX_MESSAGE_LEN: usize = MAX_BUFFER_LEN / 2;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;

// Messages exchanged after the handshake, each framed as <len: u32><id: u8><payload>.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // Zero length frame, keeps idle connections open.
    KeepAlive,

    // Sender will not answer requests.
    Choke,

    Unchoke,

    // Sender wants pieces the receiver has.
    Interested,

    NotInterested,

    // Sender now has the piece.
    Have { idx: u32 },

    // Pieces the sender has, high bit of the first byte is piece 0.
    Bitfield(Bitfield),

    Request(BlockInfo),

    // Piece message, carries block data.
    Block(BlockData),

    Cancel(BlockInfo),

    // DHT port of the sender.
    Port { port: u16 },

}

impl Message {

    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => CHOKE,
            Message::Unchoke => UNCHOKE,
            Message::Interested => INTERESTED,
            Message::NotInterested => NOT_INTERESTED,
            Message::Have { .. } => HAVE,
            Message::Bitfield(_) => BITFIELD,
            Message::Request(_) => REQUEST,
            Message::Block(_) => PIECE,
            Message::Cancel(_) => CANCEL,
            Message::Port { .. } => PORT,
        };
        Some(id)
    }

    // Bytes after the id.
    fn payload_len(&self) -> usize {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have { .. } => 4,
            Message::Bitfield(bf) => bf.as_raw_slice().len(),
            Message::Request(_) | Message::Cancel(_) => 12,
            Message::Block(block) => 8 + block.data.len(),
            Message::Port { .. } => 2,
        }
    }

    // Length prefixed wire form of the message.
    pub fn to_bytes(&self) -> BytesMut {
        let mut dst = BytesMut::new();
        self.write_to(&mut dst);
        dst
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        let Some(id) = self.id() else {
            dst.put_u32(0);
            return;
        };
        let payload_len = self.payload_len();
        dst.reserve(5 + payload_len);
        dst.put_u32(1 + payload_len as u32);
        dst.put_u8(id);

        match self {
            Message::Have { idx } => dst.put_u32(*idx),
            Message::Bitfield(bf) => dst.extend_from_slice(bf.as_raw_slice()),
            Message::Request(block) | Message::Cancel(block) => {
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
            Message::Block(block) => {
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },
            Message::Port { port } => dst.put_u16(*port),
            _ => {},
        }
    }
}

fn read_block_info(payload: &mut BytesMut) -> BlockInfo {
    BlockInfo {
        piece_idx: payload.get_u32() as usize,
        offset: payload.get_u32() as usize,
        len: payload.get_u32() as usize,
    }
}

// Extracts the next complete message from the front of `src`.
// Ok(None) means more bytes are needed, the buffer is left untouched.
// Oversized messages and overfull buffers clear `src`.
pub fn parse_message(src: &mut BytesMut) -> Result<Option<Message>, PeerError> {
    if src.len() > MAX_BUFFER_LEN {
        let len = src.len();
        src.clear();
        return Err(PeerError::BufferOverflow(len));
    }
    if src.len() < 4 {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if frame_len > MAX_MESSAGE_LEN {
        src.clear();
        return Err(PeerError::MessageTooLarge(frame_len));
    }
    if src.len() < 4 + frame_len {
        return Ok(None);
    }
    src.advance(4);
    if frame_len == 0 {
        return Ok(Some(Message::KeepAlive));
    }

    // Only this frame, a bad payload can't eat into the next one.
    let mut payload = src.split_to(frame_len);
    let id = payload.get_u8();
    let fixed_len = |expected: usize| {
        if payload.len() == expected {
            Ok(())
        } else {
            Err(PeerError::InvalidMessage(format!(
                "message id {} has payload of {} bytes, expected {}", id, payload.len(), expected,
            )))
        }
    };

    let msg = match id {
        CHOKE => fixed_len(0).map(|_| Message::Choke)?,
        UNCHOKE => fixed_len(0).map(|_| Message::Unchoke)?,
        INTERESTED => fixed_len(0).map(|_| Message::Interested)?,
        NOT_INTERESTED => fixed_len(0).map(|_| Message::NotInterested)?,
        HAVE => {
            fixed_len(4)?;
            Message::Have { idx: payload.get_u32() }
        },
        BITFIELD => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
        REQUEST => {
            fixed_len(12)?;
            Message::Request(read_block_info(&mut payload))
        },
        PIECE => {
            if payload.len() < 8 {
                return Err(PeerError::InvalidMessage(format!("piece message of {} bytes", payload.len())));
            }
            let piece_idx = payload.get_u32() as usize;
            let offset = payload.get_u32() as usize;
            Message::Block(BlockData { piece_idx, offset, data: payload.to_vec() })
        },
        CANCEL => {
            fixed_len(12)?;
            Message::Cancel(read_block_info(&mut payload))
        },
        PORT => {
            fixed_len(2)?;
            Message::Port { port: payload.get_u16() }
        },
        id => return Err(PeerError::InvalidMessageId(id)),
    };

    Ok(Some(msg))
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        msg.write_to(dst);
        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        parse_message(src)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield ({} set)", bf.count_ones()),
            Message::Request(b) => write!(f, "request {}:{}+{}", b.piece_idx, b.offset, b.len),
            Message::Block(b) => write!(f, "piece {}:{}+{}", b.piece_idx, b.offset, b.data.len()),
            Message::Cancel(b) => write!(f, "cancel {}:{}+{}", b.piece_idx, b.offset, b.len),
            Message::Port { port } => write!(f, "port {}", port),
        }
    }
}
