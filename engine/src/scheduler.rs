use std::{
    collections::{BTreeMap, HashSet},
    time::{Duration, Instant},
};
use crate::{
    block::{BlockData, BlockInfo},
    cache::BlockCache,
    disk::CommandToDisk,
    p2p::Message,
    peer::{PeerConnection, PeerKey},
    picker::{BlockState, PartialPiece, PieceAdvisor},
    swarm::Swarm,
};

// Pending pieces with unrequested blocks that are kept ready for distribution.
const MAX_PRIORITIZED: usize = 5;

// Most requests outstanding to a single peer.
const MAX_REQUESTS: usize = 10;

// Peers below this many outstanding requests are topped up.
const LOW_WATER: usize = 5;

// How long a peer's candidate list is trusted before it is rebuilt.
const CANDIDATE_REFRESH: Duration = Duration::from_secs(30);

// Most candidate pieces remembered per peer.
const MAX_CANDIDATES: usize = 32;

// End game starts once the remaining pieces are within this many of the in-flight block count.
const END_GAME_THRESHOLD: usize = 10;

// Download bookkeeping kept on each peer.
#[derive(Debug, Default)]
pub struct DownloadSlot {

    // Blocks requested from the peer and not yet delivered.
    pub requests: HashSet<BlockInfo>,

    // Start of the current wait for a block, None while nothing is requested.
    pub waiting_since: Option<Instant>,

    // The peer is given no new requests until then.
    pub snubbed_until: Option<Instant>,

    // Scheduled pieces the peer has, rarest last.
    candidates: Vec<usize>,

    candidates_refreshed: Option<Instant>,

}

impl DownloadSlot {

    pub fn is_snubbed(&self, now: Instant) -> bool {
        self.snubbed_until.map_or(false, |until| now < until)
    }

    fn invalidate_candidates(&mut self) {
        self.candidates.clear();
        self.candidates_refreshed = None;
    }
}

// Decides which blocks to request from which peers.
//
// A scheduled piece moves from not requested to pending once recommended, then to flushing
// when its last block is cached, and finally becomes available or, on a failed hash check,
// is eligible for scheduling again.
#[derive(Debug)]
pub struct DownloadScheduler {

    advisor: PieceAdvisor,

    cache: BlockCache,

    // Pieces with blocks being requested, by index.
    pending: BTreeMap<usize, PartialPiece>,

    // Pieces handed to the disk task and waiting on the hash check.
    flushing: HashSet<usize>,

    end_game: bool,

    request_timeout: Duration,

    snub_duration: Duration,

}

impl DownloadScheduler {

    pub fn new(num_pieces: usize, request_timeout: Duration, snub_duration: Duration) -> Self {
        Self {
            advisor: PieceAdvisor::new(num_pieces),
            cache: BlockCache::new(),
            pending: BTreeMap::new(),
            flushing: HashSet::new(),
            end_game: false,
            request_timeout,
            snub_duration,
        }
    }

    #[cfg(test)]
    pub fn is_end_game(&self) -> bool {
        self.end_game
    }

    // Pieces being downloaded or waiting on the disk.
    pub fn num_pending(&self) -> usize {
        self.pending.len() + self.flushing.len()
    }

    // Bytes of received blocks held until their piece completes.
    pub fn buffered(&self) -> usize {
        self.cache.load()
    }

    // Runs on the torrent's timer.
    pub fn tick(&mut self, swarm: &mut Swarm, now: Instant) {
        self.check_health(swarm, now);
        self.schedule(swarm, now);
    }

    // Peer's bitfield has been loaded.
    pub fn on_bitfield(&mut self, swarm: &mut Swarm, key: PeerKey) {
        if let Some(peer) = swarm.peers.get_mut(key) {
            self.advisor.reference_bitfield(&peer.bitfield);
            peer.download.invalidate_candidates();
        }
    }

    // Peer announced a new piece, its bitfield is already updated.
    pub fn on_have(&mut self, swarm: &mut Swarm, key: PeerKey, idx: usize, now: Instant) {
        self.advisor.reference(idx);
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        if swarm.state.scheduled.get(idx) && !self.advisor.is_dirty(idx) {
            peer.download.candidates.push(idx);
        }
        if peer.download.requests.len() < LOW_WATER {
            self.fill(swarm, key, now);
        }
    }

    pub fn on_unchoked(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        self.fill(swarm, key, now);
    }

    // A choking peer drops our requests, they go back to the pool without cancels.
    pub fn on_choked(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        if !peer.download.requests.is_empty() {
            peer.rating.takebacks += 1;
            tracing::debug!("choked with {} requests outstanding", peer.download.requests.len());
        }
        for info in peer.download.requests.drain() {
            release(&mut self.pending, &info, key);
        }
        peer.download.waiting_since = None;
        self.schedule(swarm, now);
    }

    // Releases everything a departed peer held.
    pub fn remove_peer(&mut self, swarm: &mut Swarm, key: PeerKey, peer: &PeerConnection, now: Instant) {
        self.advisor.unreference_bitfield(&peer.bitfield);
        for info in peer.download.requests.iter() {
            release(&mut self.pending, info, key);
        }
        self.schedule(swarm, now);
    }

    pub fn on_block(&mut self, swarm: &mut Swarm, key: PeerKey, block: BlockData, now: Instant) {
        let info = block.info();
        let Some(peer) = swarm.peers.get_mut(key) else { return };

        // Anything we did not ask this peer for, including blocks canceled in end game, is dropped.
        if !peer.download.requests.remove(&info) {
            tracing::trace!("unexpected block: {:?}", info);
            return;
        }
        peer.rating.delivered += 1;
        peer.download.waiting_since = if peer.download.requests.is_empty() { None } else { Some(now) };

        let Some(piece) = self.pending.get_mut(&info.piece_idx) else {
            tracing::trace!("block for abandoned piece {}", info.piece_idx);
            return;
        };
        let Some(block_idx) = piece.block_idx(&info) else { return };
        let Some(requesters) = piece.receive(block_idx) else {
            tracing::trace!("duplicate block: {:?}", info);
            return;
        };

        // First arrival wins, everyone else still waiting on the block is told to stop.
        for other in requesters.into_iter().filter(|&k| k != key) {
            if let Some(other_peer) = swarm.peers.get_mut(other) {
                if other_peer.download.requests.remove(&info) {
                    other_peer.send(Message::Cancel(info));
                    if other_peer.download.requests.is_empty() {
                        other_peer.download.waiting_since = None;
                    }
                }
            }
        }

        if self.cache.store(block) {
            self.pending.remove(&info.piece_idx);
            self.flush(swarm);
        }

        if swarm.peers.get(key).map_or(false, |p| p.download.requests.len() < LOW_WATER) {
            self.fill(swarm, key, now);
        }
    }

    // Result of the disk's hash check. Returns true if the piece is now available.
    pub fn on_piece_written(&mut self, swarm: &mut Swarm, idx: usize, valid: bool) -> bool {
        self.flushing.remove(&idx);
        self.advisor.mark_clean(idx);

        if !valid {
            tracing::warn!("piece {} failed hash check, rescheduling", idx);
            return false;
        }

        swarm.state.mark_available(idx);
        for peer in swarm.peers.values_mut() {
            peer.send(Message::Have { idx: idx as u32 });
        }
        if swarm.state.is_complete() {
            self.end_game = false;
        }
        true
    }

    // The set of wanted pieces changed, pending pieces that are no longer scheduled are abandoned.
    pub fn on_mask_changed(&mut self, swarm: &mut Swarm, now: Instant) {
        let abandoned = self.pending
            .keys()
            .filter(|&&idx| !swarm.state.scheduled.get(idx))
            .copied()
            .collect::<Vec<_>>();

        for idx in abandoned {
            tracing::debug!("abandoning piece {}", idx);
            if let Some(piece) = self.pending.remove(&idx) {
                for block_idx in piece.requested_blocks() {
                    let info = piece.block_info(block_idx);
                    for &key in piece.requesters(block_idx) {
                        if let Some(peer) = swarm.peers.get_mut(key) {
                            if peer.download.requests.remove(&info) {
                                peer.send(Message::Cancel(info));
                            }
                        }
                    }
                }
            }
            self.cache.remove(idx);
            self.advisor.mark_clean(idx);
        }

        for peer in swarm.peers.values_mut() {
            peer.download.invalidate_candidates();
            if peer.download.requests.is_empty() {
                peer.download.waiting_since = None;
            }
        }
        self.end_game = false;
        self.schedule(swarm, now);
    }

    // Drops everything still buffered, returns the number of pieces lost.
    pub fn shutdown(&mut self) -> usize {
        self.pending.clear();
        self.cache.flush_everything().len()
    }

    // Snubs peers that have sat on requests for too long.
    fn check_health(&mut self, swarm: &mut Swarm, now: Instant) {
        for (key, peer) in swarm.peers.iter_mut() {
            if peer.download.snubbed_until.map_or(false, |until| now >= until) {
                peer.download.snubbed_until = None;
            }

            let stalled = peer.download.waiting_since
                .map_or(false, |since| now.saturating_duration_since(since) >= self.request_timeout);
            if !stalled || peer.download.requests.is_empty() {
                continue;
            }

            tracing::warn!("peer {} snubbed, canceling {} requests", peer.address, peer.download.requests.len());
            peer.download.snubbed_until = Some(now + self.snub_duration);
            peer.download.waiting_since = None;
            peer.rating.takebacks += 1;
            for info in peer.download.requests.drain().collect::<Vec<_>>() {
                release(&mut self.pending, &info, key);
                peer.send(Message::Cancel(info));
            }
        }
    }

    pub fn schedule(&mut self, swarm: &mut Swarm, now: Instant) {
        let exhausted = self.promote(swarm);
        self.distribute(swarm, now);

        let hungry = swarm.peers
            .iter()
            .filter(|(_, p)| p.download.requests.len() < LOW_WATER && can_request(p, now))
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        for key in hungry {
            self.feed(swarm, key, now);
        }

        self.update_end_game(swarm, exhausted);
        if self.end_game {
            let keys = swarm.peers.keys().collect::<Vec<_>>();
            for key in keys {
                self.duplicate_requests(swarm, key, now);
            }
        }
    }

    // Keeps MAX_PRIORITIZED pending pieces with free blocks.
    // Returns true if the advisor had nothing left to offer.
    fn promote(&mut self, swarm: &mut Swarm) -> bool {
        let mut prioritized = self.pending.values().filter(|p| p.has_free()).count();
        while prioritized < MAX_PRIORITIZED {
            match self.advisor.recommend(&swarm.state.scheduled) {
                Some(idx) => {
                    self.start_piece(swarm, idx);
                    prioritized += 1;
                },
                None => return true,
            }
        }
        false
    }

    fn start_piece(&mut self, swarm: &Swarm, idx: usize) {
        debug_assert!(!self.pending.contains_key(&idx));
        self.advisor.mark_dirty(idx);
        let piece = PartialPiece::new(idx, swarm.info.piece_length(idx));
        self.cache.reserve(idx, piece.num_blocks());
        tracing::trace!("started piece {}", idx);
        self.pending.insert(idx, piece);
    }

    // Hands out the free blocks of pending pieces round robin across peers that can take them.
    fn distribute(&mut self, swarm: &mut Swarm, now: Instant) {
        for piece in self.pending.values_mut() {
            let mut free = piece.free_blocks().collect::<Vec<_>>().into_iter();
            let mut eligible = swarm.peers
                .iter()
                .filter(|(_, p)| p.bitfield.get(piece.idx) && can_request(p, now))
                .map(|(k, _)| k)
                .collect::<Vec<_>>();

            let mut turn = 0;
            while !eligible.is_empty() {
                let Some(block_idx) = free.next() else { break };
                turn %= eligible.len();
                let key = eligible[turn];
                let Some(peer) = swarm.peers.get_mut(key) else { break };
                request(piece, block_idx, key, peer, now);
                if peer.download.requests.len() >= MAX_REQUESTS {
                    eligible.remove(turn);
                } else {
                    turn += 1;
                }
            }
        }
    }

    // Tops up a single peer, first from pending pieces, then by starting pieces it is a good source for.
    fn fill(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        if !swarm.peers.get(key).map_or(false, |p| can_request(p, now)) {
            return;
        }

        for piece in self.pending.values_mut() {
            let Some(peer) = swarm.peers.get_mut(key) else { return };
            if !peer.bitfield.get(piece.idx) {
                continue;
            }
            for block_idx in piece.free_blocks().collect::<Vec<_>>() {
                if peer.download.requests.len() >= MAX_REQUESTS {
                    return;
                }
                request(piece, block_idx, key, peer, now);
            }
        }

        self.feed(swarm, key, now);
        if self.end_game {
            self.duplicate_requests(swarm, key, now);
        }
    }

    // Starts new pieces from the peer's candidate list.
    fn feed(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        let mut refreshed = false;
        loop {
            let Some(peer) = swarm.peers.get_mut(key) else { return };
            if peer.download.requests.len() >= MAX_REQUESTS {
                return;
            }

            let stale = peer.download.candidates_refreshed
                .map_or(true, |at| now.saturating_duration_since(at) >= CANDIDATE_REFRESH);
            if !refreshed && (stale || peer.download.candidates.is_empty()) {
                self.refresh_candidates(swarm, key, now);
                refreshed = true;
                continue;
            }

            let Some(idx) = peer.download.candidates.pop() else { return };
            if !swarm.state.scheduled.get(idx) || self.advisor.is_dirty(idx) || !peer.bitfield.get(idx) {
                continue;
            }

            self.start_piece(swarm, idx);
            let (Some(piece), Some(peer)) = (self.pending.get_mut(&idx), swarm.peers.get_mut(key)) else { return };
            for block_idx in 0..piece.num_blocks() {
                if peer.download.requests.len() >= MAX_REQUESTS {
                    break;
                }
                request(piece, block_idx, key, peer, now);
            }
        }
    }

    fn refresh_candidates(&self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        let scheduled = &swarm.state.scheduled;
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        let mut candidates = peer.bitfield
            .iter_ones()
            .filter(|&idx| scheduled.get(idx) && !self.advisor.is_dirty(idx))
            .collect::<Vec<_>>();
        // Rarest last so they are popped first.
        candidates.sort_by_key(|&idx| std::cmp::Reverse(self.advisor.refs(idx)));
        let skip = candidates.len().saturating_sub(MAX_CANDIDATES);
        peer.download.candidates = candidates.split_off(skip);
        peer.download.candidates_refreshed = Some(now);
    }

    // End game begins once nothing new can be started and few pieces remain.
    fn update_end_game(&mut self, swarm: &Swarm, exhausted: bool) {
        if self.end_game || !exhausted || self.pending.values().any(|p| p.has_free()) {
            return;
        }
        let remaining = swarm.state.scheduled.count_ones();
        if remaining == 0 || self.pending.is_empty() {
            return;
        }
        let inflight: usize = swarm.peers.values().map(|p| p.download.requests.len()).sum();
        if remaining <= inflight + END_GAME_THRESHOLD {
            tracing::info!("entering end game, {} pieces remain", remaining);
            self.end_game = true;
        }
    }

    // Asks the peer for blocks already requested elsewhere.
    fn duplicate_requests(&mut self, swarm: &mut Swarm, key: PeerKey, now: Instant) {
        let Some(peer) = swarm.peers.get_mut(key) else { return };
        if !can_request(peer, now) {
            return;
        }
        for piece in self.pending.values_mut() {
            if !peer.bitfield.get(piece.idx) {
                continue;
            }
            let duplicates = piece
                .requested_blocks()
                .filter(|&b| !piece.requesters(b).contains(&key))
                .collect::<Vec<_>>();
            for block_idx in duplicates {
                if peer.download.requests.len() >= MAX_REQUESTS {
                    return;
                }
                request(piece, block_idx, key, peer, now);
            }
        }
    }

    // Moves completed pieces from the cache to the disk task.
    fn flush(&mut self, swarm: &mut Swarm) {
        for (idx, blocks) in self.cache.flush_complete() {
            tracing::debug!("piece {} complete, writing", idx);
            self.flushing.insert(idx);
            swarm.send_disk(CommandToDisk::WritePiece { id: swarm.id, idx, blocks });
        }
    }
}

fn can_request(peer: &PeerConnection, now: Instant) -> bool {
    !peer.peer_choking
        && !peer.download.is_snubbed(now)
        && peer.download.requests.len() < MAX_REQUESTS
}

fn request(piece: &mut PartialPiece, block_idx: usize, key: PeerKey, peer: &mut PeerConnection, now: Instant) {
    debug_assert_ne!(piece.state(block_idx), BlockState::Received);
    let info = piece.block_info(block_idx);
    if !peer.download.requests.insert(info) {
        return;
    }
    piece.request(block_idx, key);
    peer.download.waiting_since.get_or_insert(now);
    peer.rating.requested += 1;
    peer.send(Message::Request(info));
}

fn release(pending: &mut BTreeMap<usize, PartialPiece>, info: &BlockInfo, key: PeerKey) {
    if let Some(piece) = pending.get_mut(&info.piece_idx) {
        if let Some(block_idx) = piece.block_idx(info) {
            piece.release(block_idx, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use slotmap::SlotMap;
    use crate::{p2p::PeerCommand, swarm::testing, BLOCK_SIZE};

    const TIMEOUT: Duration = Duration::from_secs(60);
    const SNUB: Duration = Duration::from_secs(20);

    fn unchoke(swarm: &mut Swarm, key: PeerKey) {
        swarm.peers[key].peer_choking = false;
    }

    fn requests(swarm: &mut Swarm, key: PeerKey) -> Vec<BlockInfo> {
        swarm.peers[key]
            .take_outbox()
            .into_iter()
            .filter_map(|cmd| match cmd {
                PeerCommand::Send(Message::Request(info)) => Some(info),
                _ => None,
            })
            .collect()
    }

    fn cancels(swarm: &mut Swarm, key: PeerKey) -> Vec<BlockInfo> {
        swarm.peers[key]
            .take_outbox()
            .into_iter()
            .filter_map(|cmd| match cmd {
                PeerCommand::Send(Message::Cancel(info)) => Some(info),
                _ => None,
            })
            .collect()
    }

    fn data(info: BlockInfo) -> BlockData {
        BlockData { piece_idx: info.piece_idx, offset: info.offset, data: Bytes::from(vec![0; info.len]) }
    }

    #[test]
    fn test_end_game_duplicate_delivery() {
        let (mut swarm, mut disk_rx) = testing::swarm(2 * BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let a = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let b = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let mut scheduler = DownloadScheduler::new(1, TIMEOUT, SNUB);
        let now = Instant::now();

        for key in [a, b] {
            scheduler.on_bitfield(&mut swarm, key);
            unchoke(&mut swarm, key);
        }
        scheduler.tick(&mut swarm, now);
        assert!(scheduler.is_end_game());

        // Both blocks are requested from both peers.
        let blocks = [
            BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE },
            BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: BLOCK_SIZE },
        ];
        for key in [a, b] {
            let mut sent = requests(&mut swarm, key);
            sent.sort();
            assert_eq!(sent, blocks.to_vec());
        }

        // Peer a wins both races, the piece leaves memory once complete.
        scheduler.on_block(&mut swarm, a, data(blocks[0]), now);
        assert_eq!(scheduler.buffered(), BLOCK_SIZE);
        scheduler.on_block(&mut swarm, a, data(blocks[1]), now);
        assert_eq!(scheduler.buffered(), 0);
        assert_eq!(cancels(&mut swarm, a), vec![]);
        let mut canceled = cancels(&mut swarm, b);
        canceled.sort();
        assert_eq!(canceled, blocks.to_vec());

        match disk_rx.try_recv() {
            Ok(CommandToDisk::WritePiece { idx, blocks, .. }) => {
                assert_eq!(idx, 0);
                assert_eq!(blocks.len(), 2);
            },
            _ => panic!("expected piece write"),
        }

        // Late deliveries from b are dropped.
        for info in blocks {
            scheduler.on_block(&mut swarm, b, data(info), now);
        }
        assert!(disk_rx.try_recv().is_err());
        assert_eq!(scheduler.num_pending(), 1);

        assert!(scheduler.on_piece_written(&mut swarm, 0, true));
        assert!(swarm.state.available.get(0));
        assert!(!swarm.state.scheduled.get(0));
        assert_eq!(scheduler.num_pending(), 0);
        for key in [a, b] {
            assert!(swarm.peers[key].outbox.contains(&PeerCommand::Send(Message::Have { idx: 0 })));
        }
    }

    #[test]
    fn test_requests_capped_per_peer() {
        // 20 pieces of 4 blocks each.
        let (mut swarm, _disk_rx) = testing::swarm(4 * BLOCK_SIZE, 80 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let all = (0..20).collect::<Vec<_>>();
        let a = testing::add_peer(&mut swarm, &mut keys, &all);
        let mut scheduler = DownloadScheduler::new(20, TIMEOUT, SNUB);
        let now = Instant::now();

        scheduler.on_bitfield(&mut swarm, a);
        // Choked peers get nothing.
        scheduler.tick(&mut swarm, now);
        assert!(requests(&mut swarm, a).is_empty());

        unchoke(&mut swarm, a);
        scheduler.on_unchoked(&mut swarm, a, now);
        scheduler.tick(&mut swarm, now);
        let sent = requests(&mut swarm, a);
        assert_eq!(sent.len(), MAX_REQUESTS);
        assert_eq!(sent.iter().collect::<HashSet<_>>().len(), MAX_REQUESTS);
        assert!(!scheduler.is_end_game());
    }

    #[test]
    fn test_choke_releases_blocks_to_other_peers() {
        let (mut swarm, _disk_rx) = testing::swarm(2 * BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let a = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let b = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let mut scheduler = DownloadScheduler::new(1, TIMEOUT, SNUB);
        let now = Instant::now();

        scheduler.on_bitfield(&mut swarm, a);
        scheduler.on_bitfield(&mut swarm, b);
        unchoke(&mut swarm, a);
        scheduler.tick(&mut swarm, now);
        assert_eq!(requests(&mut swarm, a).len(), 2);

        swarm.peers[a].peer_choking = true;
        scheduler.on_choked(&mut swarm, a, now);
        assert_eq!(swarm.peers[a].rating.takebacks, 1);
        assert!(swarm.peers[a].download.requests.is_empty());
        // No cancels after a choke.
        assert!(cancels(&mut swarm, a).is_empty());

        unchoke(&mut swarm, b);
        scheduler.on_unchoked(&mut swarm, b, now);
        assert_eq!(requests(&mut swarm, b).len(), 2);
    }

    #[test]
    fn test_stalled_peer_is_snubbed() {
        let (mut swarm, _disk_rx) = testing::swarm(2 * BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let a = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let mut scheduler = DownloadScheduler::new(1, TIMEOUT, SNUB);
        let start = Instant::now();

        scheduler.on_bitfield(&mut swarm, a);
        unchoke(&mut swarm, a);
        scheduler.tick(&mut swarm, start);
        assert_eq!(requests(&mut swarm, a).len(), 2);

        let later = start + TIMEOUT;
        scheduler.tick(&mut swarm, later);
        assert_eq!(cancels(&mut swarm, a).len(), 2);
        assert!(swarm.peers[a].download.is_snubbed(later));
        assert_eq!(swarm.peers[a].rating.takebacks, 1);

        // Still snubbed, nothing is requested.
        scheduler.tick(&mut swarm, later + Duration::from_secs(1));
        assert!(requests(&mut swarm, a).is_empty());

        // Snub over, blocks are requested again.
        scheduler.tick(&mut swarm, later + SNUB);
        assert_eq!(requests(&mut swarm, a).len(), 2);
    }

    #[test]
    fn test_failed_hash_reschedules_piece() {
        let (mut swarm, mut disk_rx) = testing::swarm(BLOCK_SIZE, BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let a = testing::add_peer(&mut swarm, &mut keys, &[0]);
        let mut scheduler = DownloadScheduler::new(1, TIMEOUT, SNUB);
        let now = Instant::now();

        scheduler.on_bitfield(&mut swarm, a);
        unchoke(&mut swarm, a);
        scheduler.tick(&mut swarm, now);
        let sent = requests(&mut swarm, a);
        assert_eq!(sent.len(), 1);
        scheduler.on_block(&mut swarm, a, data(sent[0]), now);
        assert!(matches!(disk_rx.try_recv(), Ok(CommandToDisk::WritePiece { idx: 0, .. })));

        assert!(!scheduler.on_piece_written(&mut swarm, 0, false));
        assert!(swarm.state.scheduled.get(0));
        // No have is sent for a bad piece.
        assert!(swarm.peers[a].outbox.iter().all(|cmd| !matches!(cmd, PeerCommand::Send(Message::Have { .. }))));

        scheduler.tick(&mut swarm, now);
        assert_eq!(requests(&mut swarm, a), sent);
    }

    #[test]
    fn test_mask_change_abandons_pending_piece() {
        let (mut swarm, _disk_rx) = testing::swarm(BLOCK_SIZE, 2 * BLOCK_SIZE as u64);
        let mut keys = SlotMap::with_key();
        let a = testing::add_peer(&mut swarm, &mut keys, &[0, 1]);
        let mut scheduler = DownloadScheduler::new(2, TIMEOUT, SNUB);
        let now = Instant::now();

        scheduler.on_bitfield(&mut swarm, a);
        unchoke(&mut swarm, a);
        scheduler.tick(&mut swarm, now);
        assert_eq!(requests(&mut swarm, a).len(), 2);

        let mut wanted = crate::bitfield::Bitfield::new(2);
        wanted.set(1, true);
        swarm.state.set_wanted(wanted);
        scheduler.on_mask_changed(&mut swarm, now);

        assert_eq!(cancels(&mut swarm, a), vec![BlockInfo { piece_idx: 0, offset: 0, len: BLOCK_SIZE }]);
        assert_eq!(scheduler.num_pending(), 1);
        assert_eq!(swarm.peers[a].download.requests.len(), 1);
    }
}
