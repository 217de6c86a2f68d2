use std::{cmp::Ordering, net::SocketAddr};
use crate::{
    bitfield::Bitfield,
    block::BlockInfo,
    interest::InterestSlot,
    p2p::{Message, PeerCommand},
    scheduler::DownloadSlot,
    stats::ThroughputStats,
    upload::UploadSlot,
};

slotmap::new_key_type! {
    // Generation checked handle to a peer, stale handles never alias a newer peer.
    pub struct PeerKey;
}

// Tracks how well a peer has served us.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rating {

    // Blocks we asked the peer for.
    pub requested: u64,

    // Blocks the peer delivered.
    pub delivered: u64,

    // Times the peer left requests hanging, either by choking us or by stalling.
    pub takebacks: u64,

}

impl Rating {

    pub fn ratio(&self) -> f64 {
        if self.requested == 0 {
            0.0
        } else {
            self.delivered as f64 / self.requested as f64
        }
    }

    // Ordering where the better peer compares greater.
    pub fn cmp_quality(&self, other: &Rating) -> Ordering {
        other.takebacks
            .cmp(&self.takebacks)
            .then_with(|| self.ratio().total_cmp(&other.ratio()))
    }
}

// Everything the torrent knows about one connected peer.
// Created when the handshake completes and removed when the connection ends.
#[derive(Debug)]
pub struct PeerConnection {

    pub address: SocketAddr,

    pub id: [u8; 20],

    // Pieces the peer has.
    pub bitfield: Bitfield,

    // Whether we are refusing the peer's requests.
    pub am_choking: bool,

    // Whether we want pieces the peer has.
    pub am_interested: bool,

    // Whether the peer is refusing our requests.
    pub peer_choking: bool,

    // Whether the peer wants pieces we have.
    pub peer_interested: bool,

    pub rating: Rating,

    // Set once the first message has been seen, a bitfield is only valid before this.
    pub introduced: bool,

    pub download: DownloadSlot,

    pub interest: InterestSlot,

    pub upload: UploadSlot,

    // Commands produced while handling an event, flushed to the connection task afterwards.
    pub outbox: Vec<PeerCommand>,

    pub throughput: ThroughputStats,

}

impl PeerConnection {

    pub fn new(address: SocketAddr, id: [u8; 20], num_pieces: usize) -> Self {
        Self {
            address,
            id,
            bitfield: Bitfield::new(num_pieces),
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            rating: Rating::default(),
            introduced: false,
            download: DownloadSlot::default(),
            interest: InterestSlot::default(),
            upload: UploadSlot::default(),
            outbox: Vec::new(),
            throughput: ThroughputStats::default(),
        }
    }

    pub fn send(&mut self, msg: Message) {
        self.outbox.push(PeerCommand::Send(msg));
    }

    // Drops a piece message for `block`, from the outbox if it has not left yet,
    // otherwise from the connection's write queue.
    pub fn discard(&mut self, block: BlockInfo) {
        let before = self.outbox.len();
        self.outbox.retain(|cmd| !matches!(cmd, PeerCommand::Send(Message::Piece(data)) if data.info() == block));
        if self.outbox.len() == before {
            self.outbox.push(PeerCommand::Discard(block));
        }
    }

    pub fn take_outbox(&mut self) -> Vec<PeerCommand> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::block::BlockData;

    #[test]
    fn test_rating_order() {
        let reliable = Rating { requested: 10, delivered: 9, takebacks: 0 };
        let fast_but_flaky = Rating { requested: 10, delivered: 10, takebacks: 1 };
        let slow = Rating { requested: 10, delivered: 2, takebacks: 0 };
        assert_eq!(reliable.cmp_quality(&fast_but_flaky), Ordering::Greater);
        assert_eq!(reliable.cmp_quality(&slow), Ordering::Greater);
        assert_eq!(Rating::default().cmp_quality(&Rating::default()), Ordering::Equal);
    }

    #[test]
    fn test_discard() {
        let mut peer = PeerConnection::new("127.0.0.1:6881".parse().unwrap(), [0; 20], 4);
        let block = BlockData { piece_idx: 1, offset: 0, data: Bytes::from_static(&[1, 2, 3]) };
        peer.send(Message::Piece(block.clone()));
        peer.send(Message::Unchoke);

        // Still in the outbox, removed in place.
        peer.discard(block.info());
        assert_eq!(peer.take_outbox(), vec![PeerCommand::Send(Message::Unchoke)]);

        // Already handed to the connection.
        peer.discard(block.info());
        assert_eq!(peer.take_outbox(), vec![PeerCommand::Discard(block.info())]);
    }
}
