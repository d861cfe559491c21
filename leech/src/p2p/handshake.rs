use bytes::{BufMut, Buf, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use crate::ID;
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// <pstrlen=19><pstr><reserved><info_hash><peer_id>
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  ID,
    pub peer_id:    ID,
}

impl Handshake {
    pub fn new(info_hash: ID, peer_id: ID) -> Self {
        Self {
            protocol:   PROTOCOL,
            reserved:   [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(&self.protocol);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    // Parses a handshake from the start of `buf`, None if it is too short
    // or does not carry the BitTorrent protocol string.
    pub fn parse(buf: &[u8]) -> Option<Handshake> {
        if buf.len() < HANDSHAKE_LEN || buf[0] != 19 || buf[1..20] != PROTOCOL {
            return None;
        }

        let field = |range: std::ops::Range<usize>| {
            let mut out = [0; 20];
            out.copy_from_slice(&buf[range]);
            out
        };
        let mut reserved = [0; 8];
        reserved.copy_from_slice(&buf[20..28]);

        Some(Handshake {
            protocol: PROTOCOL,
            reserved,
            info_hash: field(28..48),
            peer_id: field(48..68),
        })
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&item.to_bytes());
        Ok(())
    }
}

impl Decoder for HandshakeCodec {

    type Item = Handshake;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        if src.is_empty() {
            return Ok(None);
        }

        // Fail early, no point waiting on the rest.
        if src[0] != 19 {
            return Err(PeerError::IncorrectProtocol);
        }

        if src.len() < HANDSHAKE_LEN {
            // Handshake not fully recieved.
            return Ok(None);
        }

        let handshake = Handshake::parse(&src[..]).ok_or(PeerError::IncorrectProtocol)?;
        // Anything after the handshake belongs to the message stream.
        src.advance(HANDSHAKE_LEN);
        Ok(Some(handshake))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Handshake {{ info_hash: {}, peer_id: {}, reserved: {} }}",
            hex::encode(self.info_hash),
            String::from_utf8_lossy(&self.peer_id),
            hex::encode(self.reserved),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_handshake(info_hash: ID, peer_id: ID) -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&info_hash);
        src.extend_from_slice(&peer_id);
        src
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = raw_handshake([1; 20], [2; 20]);
        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, *b"BitTorrent protocol");
        assert_eq!(handshake.reserved, [0; 8]);
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(handshake.peer_id, [2; 20]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_handshake_layout() {
        let bytes = Handshake::new([0xaa; 20], [0xbb; 20]).to_bytes();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0; 8]);
        assert_eq!(&bytes[28..48], &[0xaa; 20]);
        assert_eq!(&bytes[48..68], &[0xbb; 20]);
        assert_eq!(&raw_handshake([0xaa; 20], [0xbb; 20])[..], &bytes[..]);
    }

    #[test]
    fn test_handshake_parse_rejects() {
        let good = Handshake::new([3; 20], [4; 20]).to_bytes();
        assert_eq!(Handshake::parse(&good), Some(Handshake::new([3; 20], [4; 20])));
        assert_eq!(Handshake::parse(&good[..67]), None);

        let mut bad_len = good;
        bad_len[0] = 18;
        assert_eq!(Handshake::parse(&bad_len), None);

        let mut bad_protocol = good;
        bad_protocol[1] = b'b';
        assert_eq!(Handshake::parse(&bad_protocol), None);
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src);
        assert!(handshake.unwrap().is_none());
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol");

        let mut decoder = HandshakeCodec;
        assert!(matches!(decoder.decode(&mut src), Err(PeerError::IncorrectProtocol)));
    }

    #[test]
    fn test_handshake_decoding_with_extra_data() {
        let mut src = raw_handshake([0; 20], [0; 20]);
        src.extend_from_slice(&[0, 0, 0, 1, 2]);

        let mut decoder = HandshakeCodec;
        let handshake = decoder.decode(&mut src);
        assert!(handshake.unwrap().is_some());
        // Trailing message is left for the message codec.
        assert_eq!(&src[..], &[0, 0, 0, 1, 2]);
    }
}
