use std::{net::SocketAddr, time::{Duration, Instant}};
use bytes::Bytes;
use crate::{
    bitfield::Bitfield,
    block::BlockInfo,
    choke::ChokeManager,
    interest::InterestTracker,
    p2p::{Message, PeerError},
    peer::{PeerConnection, PeerKey},
    scheduler::DownloadScheduler,
    swarm::Swarm,
    upload::UploadScheduler,
};

// Wires peer events to the download, choke, interest and upload services.
// Makes no decisions itself.
#[derive(Debug)]
pub struct EventHub {

    pub download: DownloadScheduler,

    choke: ChokeManager,

    interest: InterestTracker,

    upload: UploadScheduler,

}

impl EventHub {

    pub fn new(num_pieces: usize, upload_slots: usize, request_timeout: Duration, snub_duration: Duration) -> Self {
        Self {
            download: DownloadScheduler::new(num_pieces, request_timeout, snub_duration),
            choke: ChokeManager::new(upload_slots),
            interest: InterestTracker,
            upload: UploadScheduler,
        }
    }

    // Registers a peer whose handshake completed, it is told which pieces we have.
    pub fn attach(&mut self, swarm: &mut Swarm, key: PeerKey, address: SocketAddr, id: [u8; 20]) {
        let mut peer = PeerConnection::new(address, id, swarm.info.num_pieces);
        if !swarm.state.available.none() {
            peer.send(Message::Bitfield(Bytes::copy_from_slice(swarm.state.available.as_bytes())));
        }
        swarm.peers.insert(key, peer);
    }

    pub fn detach(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        let Some(peer) = swarm.peers.remove(key) else { return };
        self.download.remove_peer(swarm, key, &peer, now);
        if !peer.am_choking {
            self.partial_choke(swarm);
        }
    }

    // An error closes the peer's connection.
    pub fn handle_message(&mut self, swarm: &mut Swarm, key: PeerKey, msg: Message, now: Instant) -> Result<(), PeerError> {
        let num_pieces = swarm.info.num_pieces;
        let Some(peer) = swarm.peers.get_mut(key) else { return Ok(()) };
        let first = !peer.introduced;
        peer.introduced = true;

        match msg {

            Message::KeepAlive => {},

            Message::Bitfield(bytes) => {
                if !first {
                    return Err(PeerError::UnexpectedBitfield);
                }
                peer.bitfield = Bitfield::from_bytes(&bytes, num_pieces).ok_or(PeerError::InvalidBitfield)?;
                tracing::debug!("peer has {}/{} pieces", peer.bitfield.count_ones(), num_pieces);
                self.download.on_bitfield(swarm, key);
                self.interest.on_bitfield(swarm, key);
            },

            Message::Have { idx } => {
                if idx as usize >= num_pieces {
                    return Err(PeerError::InvalidHave(idx));
                }
                let idx = idx as usize;
                if peer.bitfield.set(idx, true) {
                    self.interest.on_have(swarm, key, idx);
                    self.download.on_have(swarm, key, idx, now);
                }
            },

            Message::Choke => {
                if !peer.peer_choking {
                    peer.peer_choking = true;
                    self.download.on_choked(swarm, key, now);
                }
            },

            Message::Unchoke => {
                if peer.peer_choking {
                    peer.peer_choking = false;
                    self.download.on_unchoked(swarm, key, now);
                }
            },

            Message::Interested => {
                if !peer.peer_interested {
                    peer.peer_interested = true;
                    self.partial_choke(swarm);
                }
            },

            Message::NotInterested => {
                if peer.peer_interested {
                    peer.peer_interested = false;
                    self.partial_choke(swarm);
                }
            },

            Message::Request(block) => self.upload.on_request(swarm, key, block)?,

            Message::Cancel(block) => self.upload.on_cancel(swarm, key, block),

            Message::Piece(block) => {
                let len = block.data.len() as u64;
                peer.throughput.down += len;
                swarm.state.downloaded += len;
                self.download.on_block(swarm, key, block, now);
            },
        }

        Ok(())
    }

    // Hash check result from the disk. Returns true if the piece is now available.
    pub fn piece_written(&mut self, swarm: &mut Swarm, idx: usize, valid: bool) -> bool {
        let was_scheduled = swarm.state.scheduled.get(idx);
        let available = self.download.on_piece_written(swarm, idx, valid);
        if available && was_scheduled {
            self.interest.on_piece_verified(swarm, idx);
        }
        available
    }

    pub fn block_read(&mut self, swarm: &mut Swarm, key: PeerKey, block: BlockInfo, data: Option<Bytes>) {
        self.upload.on_block_read(swarm, key, block, data);
    }

    pub fn tick(&mut self, swarm: &mut Swarm, now: Instant) {
        self.download.tick(swarm, now);
        for key in self.choke.tick(swarm, now) {
            self.upload.on_choked(swarm, key);
        }
    }

    // Applies a new selection of wanted pieces.
    pub fn set_wanted(&mut self, swarm: &mut Swarm, wanted: Bitfield, now: Instant) {
        swarm.state.set_wanted(wanted);
        self.download.on_mask_changed(swarm, now);
        self.interest.recount_all(swarm);
    }

    fn partial_choke(&mut self, swarm: &mut Swarm) {
        for key in self.choke.partial_round(swarm) {
            self.upload.on_choked(swarm, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use crate::{disk::CommandToDisk, p2p::PeerCommand, swarm::testing, BLOCK_SIZE};

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn hub(swarm: &Swarm) -> EventHub {
        EventHub::new(swarm.info.num_pieces, 4, TIMEOUT, Duration::from_secs(20))
    }

    fn address() -> SocketAddr {
        "10.0.0.1:6881".parse().unwrap()
    }

    #[test]
    fn test_attach_sends_bitfield_when_we_have_pieces() {
        let (mut swarm, _disk_rx) = testing::swarm(BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let mut hub = hub(&swarm);

        let a = keys.insert(());
        hub.attach(&mut swarm, a, address(), [1; 20]);
        assert!(swarm.peers[a].outbox.is_empty());

        swarm.state.mark_available(1);
        let b = keys.insert(());
        hub.attach(&mut swarm, b, address(), [2; 20]);
        assert_eq!(
            swarm.peers[b].take_outbox(),
            vec![PeerCommand::Send(Message::Bitfield(Bytes::from_static(&[0b0100_0000])))],
        );
    }

    #[test]
    fn test_protocol_violations() {
        let (mut swarm, _disk_rx) = testing::swarm(BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let mut hub = hub(&swarm);
        let now = Instant::now();
        let key = keys.insert(());
        hub.attach(&mut swarm, key, address(), [1; 20]);

        // Spare bits set.
        let bad = Message::Bitfield(Bytes::from_static(&[0b1111_1000]));
        assert!(matches!(hub.handle_message(&mut swarm, key, bad, now), Err(PeerError::InvalidBitfield)));

        let late = Message::Bitfield(Bytes::from_static(&[0b1111_0000]));
        assert!(matches!(hub.handle_message(&mut swarm, key, late, now), Err(PeerError::UnexpectedBitfield)));

        let have = Message::Have { idx: 4 };
        assert!(matches!(hub.handle_message(&mut swarm, key, have, now), Err(PeerError::InvalidHave(4))));
    }

    #[test]
    fn test_download_flow() {
        let (mut swarm, mut disk_rx) = testing::swarm(BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let mut hub = hub(&swarm);
        let now = Instant::now();
        let key = keys.insert(());
        hub.attach(&mut swarm, key, address(), [1; 20]);

        hub.handle_message(&mut swarm, key, Message::Bitfield(Bytes::from_static(&[0b1111_0000])), now).unwrap();
        assert_eq!(swarm.peers[key].take_outbox(), vec![PeerCommand::Send(Message::Interested)]);

        hub.handle_message(&mut swarm, key, Message::Unchoke, now).unwrap();
        let requests = swarm.peers[key]
            .take_outbox()
            .into_iter()
            .filter_map(|cmd| match cmd {
                PeerCommand::Send(Message::Request(info)) => Some(info),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(requests.len(), 4);

        for info in requests {
            let block = crate::block::BlockData { piece_idx: info.piece_idx, offset: 0, data: Bytes::from(vec![0; info.len]) };
            hub.handle_message(&mut swarm, key, Message::Piece(block), now).unwrap();
        }
        assert_eq!(swarm.state.downloaded, 4 * BLOCK_SIZE as u64);

        let mut written = 0;
        while let Ok(cmd) = disk_rx.try_recv() {
            if let CommandToDisk::WritePiece { idx, .. } = cmd {
                assert!(hub.piece_written(&mut swarm, idx, true));
                written += 1;
            }
        }
        assert_eq!(written, 4);
        assert!(swarm.state.is_complete());

        let outbox = swarm.peers[key].take_outbox();
        assert_eq!(outbox.iter().filter(|c| matches!(c, PeerCommand::Send(Message::Have { .. }))).count(), 4);
        assert_eq!(outbox.last(), Some(&PeerCommand::Send(Message::NotInterested)));
    }

    #[test]
    fn test_interested_peer_is_unchoked_and_served() {
        let (mut swarm, mut disk_rx) = testing::swarm(BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        swarm.state.mark_available(0);
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let mut hub = hub(&swarm);
        let now = Instant::now();
        let key = keys.insert(());
        hub.attach(&mut swarm, key, address(), [1; 20]);
        swarm.peers[key].take_outbox();

        hub.handle_message(&mut swarm, key, Message::Interested, now).unwrap();
        assert_eq!(swarm.peers[key].take_outbox(), vec![PeerCommand::Send(Message::Unchoke)]);

        let block = BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE };
        hub.handle_message(&mut swarm, key, Message::Request(block), now).unwrap();
        assert!(matches!(disk_rx.try_recv(), Ok(CommandToDisk::ReadBlock { .. })));

        hub.block_read(&mut swarm, key, block, Some(Bytes::from(vec![0; BLOCK_SIZE])));
        assert!(matches!(&swarm.peers[key].take_outbox()[..], [PeerCommand::Send(Message::Piece(_))]));

        // Peer leaves while unchoked, its slot is freed.
        hub.detach(&mut swarm, key, now);
        assert!(swarm.peers.is_empty());
    }
}
