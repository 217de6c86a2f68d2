use std::collections::{HashSet, VecDeque};
use bytes::Bytes;
use crate::{
    block::{BlockData, BlockInfo},
    disk::CommandToDisk,
    p2p::{Message, PeerError},
    peer::PeerKey,
    swarm::Swarm,
};

// Most disk reads in flight for a single peer.
const MAX_READS: usize = 20;

// Upload bookkeeping kept on each peer.
#[derive(Debug, Default)]
pub struct UploadSlot {

    // Accepted requests waiting for a read slot.
    queued: VecDeque<BlockInfo>,

    // Reads handed to the disk task.
    reading: HashSet<BlockInfo>,

    // Reads in flight whose result is to be dropped.
    discarded: HashSet<BlockInfo>,

}

impl UploadSlot {
    pub fn num_pending(&self) -> usize {
        self.queued.len() + self.reading.len() - self.discarded.len()
    }
}

// Serves block requests from disk.
#[derive(Debug, Default)]
pub struct UploadScheduler;

impl UploadScheduler {

    // Malformed requests are a protocol violation, requests we cannot serve are ignored.
    pub fn on_request(&self, swarm: &mut Swarm, key: PeerKey, block: BlockInfo) -> Result<(), PeerError> {
        if !block.is_valid(&swarm.info) {
            return Err(PeerError::InvalidRequest(block));
        }
        let available = swarm.state.available.get(block.piece_idx);
        let Some(peer) = swarm.peers.get_mut(key) else { return Ok(()) };

        // Requests sent before our choke arrived are expected, they are just dropped.
        if peer.am_choking {
            tracing::trace!("request while choked: {:?}", block);
            return Ok(());
        }
        if !available {
            tracing::debug!("request for missing piece {}", block.piece_idx);
            return Ok(());
        }

        let upload = &mut peer.upload;
        if upload.reading.contains(&block) {
            // Canceled and asked for again before the read finished.
            upload.discarded.remove(&block);
            return Ok(());
        }
        if upload.queued.contains(&block) {
            tracing::trace!("duplicate request: {:?}", block);
            return Ok(());
        }
        upload.queued.push_back(block);
        self.pump(swarm, key);
        Ok(())
    }

    pub fn on_cancel(&self, swarm: &mut Swarm, key: PeerKey, block: BlockInfo) {
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        let upload = &mut peer.upload;
        if let Some(pos) = upload.queued.iter().position(|b| *b == block) {
            upload.queued.remove(pos);
        } else if upload.reading.contains(&block) {
            upload.discarded.insert(block);
        } else {
            // Already read, drop it before it is written to the socket.
            peer.discard(block);
        }
    }

    // Everything not yet sent to a peer we just choked is dropped.
    pub fn on_choked(&self, swarm: &mut Swarm, key: PeerKey) {
        if let Some(peer) = swarm.peers.get_mut(key) {
            let upload = &mut peer.upload;
            upload.queued.clear();
            upload.discarded.extend(upload.reading.iter().copied());
        }
    }

    // A read finished, `data` is None if it failed.
    pub fn on_block_read(&self, swarm: &mut Swarm, key: PeerKey, block: BlockInfo, data: Option<Bytes>) {
        // Peer may have disconnected in the meantime.
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        if !peer.upload.reading.remove(&block) {
            return;
        }

        let dropped = peer.upload.discarded.remove(&block) || peer.am_choking;
        match data {
            Some(data) if !dropped => {
                let len = data.len() as u64;
                peer.send(Message::Piece(BlockData { piece_idx: block.piece_idx, offset: block.offset, data }));
                peer.throughput.up += len;
                swarm.state.uploaded += len;
            },
            Some(_) => tracing::trace!("dropping canceled block: {:?}", block),
            None => tracing::warn!("failed to read block: {:?}", block),
        }
        self.pump(swarm, key);
    }

    fn pump(&self, swarm: &mut Swarm, key: PeerKey) {
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        let upload = &mut peer.upload;
        let mut reads = Vec::new();
        while upload.reading.len() < MAX_READS {
            let Some(block) = upload.queued.pop_front() else { break };
            upload.reading.insert(block);
            reads.push(block);
        }
        for block in reads {
            swarm.send_disk(CommandToDisk::ReadBlock { id: swarm.id, peer: key, block });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;
    use crate::{p2p::PeerCommand, swarm::testing, BLOCK_SIZE};

    fn setup() -> (Swarm, crate::disk::DiskRx, PeerKey) {
        let (mut swarm, disk_rx) = testing::swarm(2 * BLOCK_SIZE, 4 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let key = testing::add_peer(&mut swarm, &mut keys, &[]);
        swarm.state.mark_available(0);
        swarm.peers[key].am_choking = false;
        (swarm, disk_rx, key)
    }

    fn block(offset: usize) -> BlockInfo {
        BlockInfo { piece_idx: 0, offset, len: BLOCK_SIZE }
    }

    #[test]
    fn test_request_is_read_and_sent() {
        let (mut swarm, mut disk_rx, key) = setup();
        let upload = UploadScheduler;

        upload.on_request(&mut swarm, key, block(0)).unwrap();
        match disk_rx.try_recv() {
            Ok(CommandToDisk::ReadBlock { block: b, .. }) => assert_eq!(b, block(0)),
            _ => panic!("expected block read"),
        }

        upload.on_block_read(&mut swarm, key, block(0), Some(Bytes::from(vec![1; BLOCK_SIZE])));
        let outbox = swarm.peers[key].take_outbox();
        assert!(matches!(&outbox[..], [PeerCommand::Send(Message::Piece(data))] if data.info() == block(0)));
        assert_eq!(swarm.state.uploaded, BLOCK_SIZE as u64);
    }

    #[test]
    fn test_invalid_and_unavailable_requests() {
        let (mut swarm, mut disk_rx, key) = setup();
        let upload = UploadScheduler;

        let oversized = BlockInfo { piece_idx: 0, offset: 0, len: 2 * BLOCK_SIZE };
        assert!(matches!(upload.on_request(&mut swarm, key, oversized), Err(PeerError::InvalidRequest(_))));

        // Piece 1 is not available.
        upload.on_request(&mut swarm, key, BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE }).unwrap();
        // Choked peers are ignored.
        swarm.peers[key].am_choking = true;
        upload.on_request(&mut swarm, key, block(0)).unwrap();
        assert!(disk_rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_during_read() {
        let (mut swarm, mut disk_rx, key) = setup();
        let upload = UploadScheduler;

        upload.on_request(&mut swarm, key, block(0)).unwrap();
        upload.on_cancel(&mut swarm, key, block(0));
        upload.on_block_read(&mut swarm, key, block(0), Some(Bytes::from(vec![1; BLOCK_SIZE])));
        assert!(swarm.peers[key].take_outbox().is_empty());
        assert!(disk_rx.try_recv().is_ok());

        // Cancel after the read completed drops the queued piece.
        upload.on_request(&mut swarm, key, block(BLOCK_SIZE)).unwrap();
        upload.on_block_read(&mut swarm, key, block(BLOCK_SIZE), Some(Bytes::from(vec![1; BLOCK_SIZE])));
        upload.on_cancel(&mut swarm, key, block(BLOCK_SIZE));
        assert!(swarm.peers[key].take_outbox().is_empty());
    }

    #[test]
    fn test_read_limit() {
        let (mut swarm, mut disk_rx, key) = setup();
        swarm.state.mark_available(1);
        let upload = UploadScheduler;

        // 64 distinct small requests across both pieces.
        for i in 0..64 {
            let piece_idx = i / 32;
            let offset = (i % 32) * 1024;
            upload.on_request(&mut swarm, key, BlockInfo { piece_idx, offset, len: 512 }).unwrap();
        }
        let mut reads = 0;
        while disk_rx.try_recv().is_ok() {
            reads += 1;
        }
        assert_eq!(reads, MAX_READS);
        assert_eq!(swarm.peers[key].upload.num_pending(), 64);

        upload.on_choked(&mut swarm, key);
        assert_eq!(swarm.peers[key].upload.num_pending(), 0);
    }
}
