use bytes::{BufMut, Buf, Bytes, BytesMut};
use tokio_util::codec::{Encoder, Decoder};
use crate::{block, MAX_MESSAGE_LEN};
use super::PeerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {

    // The keep alive message advises peers not to close the connection,
    // even if they haven’t received a message in some time.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Raw bitfield, only valid as the first message after the handshake.
    // Validated against the piece count by the receiver.
    Bitfield(Bytes),

    // When a client wants to request data, they reference the index of the piece, the index
    // of the start of the block within the piece, and the length of the block (usually 16KB).
    Request(block::BlockInfo),

    // Clients send blocks in the piece message, referencing piece index and block offset.
    Piece(block::BlockData),

    // The cancel message is sent to cancel a request for a block.
    Cancel(block::BlockInfo),
}

pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                dst.put_u32(1 + bitfield.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(&bitfield);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                dst.reserve(13 + block.data.len());
                dst.put_u32(9 + block.data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(&block.data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.len() < 4 { return Ok(None); }

        let msg_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Reject before buffering anything of an abusive frame.
        if msg_len > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLarge(msg_len));
        }

        if src.len() < 4 + msg_len {
            // Haven't recieved all of message.
            src.reserve(4 + msg_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }

        let id = src[0];
        let valid_len = match id {
            0..=3 => msg_len == 1,
            4 => msg_len == 5,
            5 => msg_len > 1,
            6 | 8 => msg_len == 13,
            7 => msg_len > 9,
            _ => {
                tracing::warn!("invalid message id: {}", id);
                return Err(PeerError::InvalidMessageId(id));
            },
        };
        if !valid_len {
            return Err(PeerError::InvalidLength { id, len: msg_len });
        }

        // Split off the whole frame so a partial parse can never leak into the next message.
        let mut frame = src.split_to(msg_len);
        frame.advance(1);

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: frame.get_u32() },
            5 => Message::Bitfield(frame.freeze()),
            6 | 8 => {
                let info = block::BlockInfo {
                    piece_idx: frame.get_u32() as usize,
                    offset: frame.get_u32() as usize,
                    len: frame.get_u32() as usize,
                };
                if id == 6 { Message::Request(info) } else { Message::Cancel(info) }
            },
            _ => {
                let piece_idx = frame.get_u32() as usize;
                let offset = frame.get_u32() as usize;
                Message::Piece(block::BlockData { piece_idx, offset, data: frame.freeze() })
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield of {} bytes", bf.len()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Piece(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use crate::block::{BlockData, BlockInfo};

    #[test]
    fn test_msg_stream() {

        let mut out_buf = BytesMut::new();
        let mut buf = BytesMut::new();
        // Keep alive
        buf.extend_from_slice(&[0, 0, 0, 0]);
        // Choke
        buf.extend_from_slice(&[0, 0, 0, 1, 0]);
        // Unchoke
        buf.extend_from_slice(&[0, 0, 0, 1, 1]);
        // Interested
        buf.extend_from_slice(&[0, 0, 0, 1, 2]);
        // Not interested
        buf.extend_from_slice(&[0, 0, 0, 1, 3]);
        // Have
        buf.extend_from_slice(&[0, 0, 0, 5, 4, 0, 0, 0, 0xb]);
        // Bitfield
        buf.extend_from_slice(&[0, 0, 0, 4, 5, 0x1, 0x2, 0x3]);
        // Request
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x6, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);
        // Piece
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1, 0x2, 0x3]);
        // Cancel
        buf.extend_from_slice(&[0, 0, 0, 0xd, 0x8, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0, 0, 0x40, 0]);

        let expected = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: 0xb },
            Message::Bitfield(Bytes::from_static(&[0x1, 0x2, 0x3])),
            Message::Request(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
            Message::Piece(BlockData { piece_idx: 0xb, offset: 0x134000, data: Bytes::from_static(&[0x1, 0x2, 0x3]) }),
            Message::Cancel(BlockInfo { piece_idx: 0xb, offset: 0x134000, len: 0x4000 }),
        ];
        let expected_buf = buf.clone();

        for msg in expected.into_iter() {
            MessageCodec.encode(msg.clone(), &mut out_buf).unwrap();
            let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg, "decoded message does not match expected");
        }

        assert!(buf.is_empty());
        assert_eq!(out_buf, expected_buf, "encoded stream does not match expected");
    }

    #[test]
    fn test_msg_decode_chunked() {

        let mut buf = BytesMut::new();

        // Add 1/2 of interested message
        buf.extend_from_slice(&[0, 0, 0]);
        let decoded = MessageCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[1, 2]);
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Interested);

        // Add 1/2 of piece message
        buf.extend_from_slice(&[0, 0, 0, 12, 0x7, 0, 0, 0, 0xb, 0, 0x13, 0x40, 0, 0x1]);
        let decoded = MessageCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, None);
        // Add other 1/2
        buf.extend_from_slice(&[0x2, 0x3]);
        let decoded = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Piece(BlockData { piece_idx: 0xb, offset: 0x134000, data: Bytes::from_static(&[0x1, 0x2, 0x3]) }));
    }

    #[test]
    fn test_msg_decode_incomplete_message() {
        let mut src = BytesMut::from(&[0u8, 1, 2][..]);
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
        let mut src = BytesMut::new();
        assert_eq!(MessageCodec.decode(&mut src).unwrap(), None);
    }

    #[test]
    fn test_msg_decode_oversized() {
        // Header claims a 40000 byte payload, only the header has arrived.
        let mut src = BytesMut::new();
        src.put_u32(40_000);
        src.put_u8(7);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::MessageTooLarge(len)) => assert_eq!(len, 40_000),
            other => panic!("expected oversized message error, got {:?}", other),
        }
    }

    #[test]
    fn test_msg_decode_invalid_id() {
        let mut src = BytesMut::from(&[0u8, 0, 0, 1, 255][..]);
        match MessageCodec.decode(&mut src) {
            Err(PeerError::InvalidMessageId(id)) => assert_eq!(id, 255),
            other => panic!("expected invalid message id, got {:?}", other),
        }
    }

    #[test]
    fn test_msg_decode_invalid_length() {
        // Choke with a payload.
        let mut src = BytesMut::from(&[0u8, 0, 0, 2, 0, 0][..]);
        assert!(matches!(MessageCodec.decode(&mut src), Err(PeerError::InvalidLength { id: 0, len: 2 })));
        // Have with a short index.
        let mut src = BytesMut::from(&[0u8, 0, 0, 3, 4, 0, 1][..]);
        assert!(matches!(MessageCodec.decode(&mut src), Err(PeerError::InvalidLength { id: 4, len: 3 })));
        // Request missing its length field.
        let mut src = BytesMut::from(&[0u8, 0, 0, 9, 6, 0, 0, 0, 1, 0, 0, 0, 0][..]);
        assert!(matches!(MessageCodec.decode(&mut src), Err(PeerError::InvalidLength { id: 6, len: 9 })));
    }

    #[test]
    fn test_msg_random_round_trip() {
        let mut rng = rand::thread_rng();
        let mut random_info = || BlockInfo {
            piece_idx: rng.gen::<u32>() as usize,
            offset: rng.gen::<u32>() as usize,
            len: rng.gen_range(1..=crate::BLOCK_SIZE),
        };
        let info_a = random_info();
        let info_b = random_info();

        let mut rng = rand::thread_rng();
        let bitfield: Vec<u8> = (0..rng.gen_range(1..64)).map(|_| rng.gen()).collect();
        let data: Vec<u8> = (0..rng.gen_range(1..=crate::BLOCK_SIZE)).map(|_| rng.gen()).collect();

        let messages = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { idx: rng.gen() },
            Message::Bitfield(bitfield.into()),
            Message::Request(info_a),
            Message::Piece(BlockData { piece_idx: rng.gen::<u32>() as usize, offset: rng.gen::<u32>() as usize, data: data.into() }),
            Message::Cancel(info_b),
        ];

        let mut buf = BytesMut::new();
        for msg in messages.iter() {
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        }
        for msg in messages {
            assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
        }
        assert!(buf.is_empty());
    }
}
