use bytes::{BufMut, Buf, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use super::PeerError;

pub const PROTOCOL: [u8; 19] = *b"BitTorrent protocol";

// 1 byte protocol length, protocol, 8 reserved bytes, info hash and peer id.
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol:   [u8; 19],
    pub reserved:   [u8; 8],
    pub info_hash:  [u8; 20],
    pub peer_id:    [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            protocol:   PROTOCOL,
            // No extensions are supported.
            reserved:   [0; 8],
            info_hash,
            peer_id,
        }
    }
}

pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {

    type Error = PeerError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_u8(PROTOCOL.len() as u8);
        dst.extend_from_slice(&item.protocol);
        dst.extend_from_slice(&item.reserved);
        dst.extend_from_slice(&item.info_hash);
        dst.extend_from_slice(&item.peer_id);
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

        // Fail fast on the length byte, before the rest has arrived.
        if src[0] as usize != PROTOCOL.len() {
            return Err(PeerError::IncorrectProtocol);
        }

        // Handshake not fully recieved.
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        src.advance(1);

        let mut protocol = [0; 19];
        src.copy_to_slice(&mut protocol);

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            protocol,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("protocol", &String::from_utf8_lossy(&self.protocol))
            .field("reserved", &self.reserved)
            .field("info_hash", &hex::encode(self.info_hash))
            .field("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_handshake() -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(19);
        src.extend_from_slice(b"BitTorrent protocol");
        src.extend_from_slice(&[0; 8]);
        src.extend_from_slice(&[1; 20]);
        src.extend_from_slice(b"-RS0133-abcdefghijkl");
        src
    }

    #[test]
    fn test_handshake_decoding() {
        let mut src = raw_handshake();
        let handshake = HandshakeCodec.decode(&mut src).unwrap().unwrap();
        assert_eq!(handshake.protocol, PROTOCOL);
        assert_eq!(handshake.reserved, [0; 8]);
        assert_eq!(handshake.info_hash, [1; 20]);
        assert_eq!(&handshake.peer_id, b"-RS0133-abcdefghijkl");
        assert!(src.is_empty());
    }

    #[test]
    fn test_handshake_encoding() {
        let mut dst = BytesMut::new();
        HandshakeCodec.encode(Handshake::new([1; 20], *b"-RS0133-abcdefghijkl"), &mut dst).unwrap();
        assert_eq!(dst, raw_handshake());
    }

    #[test]
    fn test_handshake_decoding_with_incomplete_data() {
        let mut src = raw_handshake();
        let mut partial = src.split_to(HANDSHAKE_LEN - 1);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
        // Nothing consumed while waiting.
        assert_eq!(partial.len(), HANDSHAKE_LEN - 1);
    }

    #[test]
    fn test_handshake_decoding_with_invalid_protocol_len() {
        let mut src = BytesMut::new();
        src.put_u8(20);
        src.extend_from_slice(b"Invalid protocol");
        assert!(matches!(HandshakeCodec.decode(&mut src), Err(PeerError::IncorrectProtocol)));
    }

    #[test]
    fn test_handshake_leaves_trailing_data() {
        let mut src = raw_handshake();
        // Bitfield message sent straight after the handshake.
        src.extend_from_slice(&[0, 0, 0, 2, 5, 0xff]);
        assert!(HandshakeCodec.decode(&mut src).unwrap().is_some());
        assert_eq!(&src[..], &[0, 0, 0, 2, 5, 0xff]);
    }
}
