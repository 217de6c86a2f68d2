use std::sync::Arc;
use slotmap::SecondaryMap;
use crate::{
    bitfield::Bitfield,
    disk::{CommandToDisk, DiskTx},
    peer::{PeerConnection, PeerKey},
    store::StoreInfo,
    TorrentID,
};

// Piece bookkeeping for one torrent.
// Every piece is exactly one of available, scheduled or not wanted.
#[derive(Debug, Clone)]
pub struct TorrentState {

    // Pieces we have stored and verified.
    pub available: Bitfield,

    // Pieces we still want.
    pub scheduled: Bitfield,

    // Pieces that passed a hash check after being written this session, or on the startup recheck.
    pub verified: Bitfield,

    // Pieces overlapping at least one selected file.
    pub wanted: Bitfield,

    pub downloaded: u64,

    pub uploaded: u64,

}

impl TorrentState {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            available: Bitfield::new(num_pieces),
            scheduled: Bitfield::full(num_pieces),
            verified: Bitfield::new(num_pieces),
            wanted: Bitfield::full(num_pieces),
            downloaded: 0,
            uploaded: 0,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.available.len()
    }

    // Pieces found intact on disk at startup.
    pub fn load_available(&mut self, available: Bitfield) {
        debug_assert_eq!(available.len(), self.num_pieces());
        self.verified = available.clone();
        self.available = available;
        self.recompute_scheduled();
    }

    pub fn set_wanted(&mut self, wanted: Bitfield) {
        debug_assert_eq!(wanted.len(), self.num_pieces());
        self.wanted = wanted;
        self.recompute_scheduled();
    }

    pub fn mark_available(&mut self, idx: usize) {
        self.available.set(idx, true);
        self.verified.set(idx, true);
        self.scheduled.set(idx, false);
    }

    // scheduled = wanted & !available
    pub fn recompute_scheduled(&mut self) {
        for idx in 0..self.num_pieces() {
            let scheduled = self.wanted.get(idx) && !self.available.get(idx);
            self.scheduled.set(idx, scheduled);
        }
    }

    // Every wanted piece is available.
    pub fn is_complete(&self) -> bool {
        self.scheduled.none()
    }

    // Bytes still needed to complete the selected files.
    pub fn left(&self, info: &StoreInfo) -> u64 {
        self.scheduled
            .iter_ones()
            .map(|idx| info.piece_length(idx) as u64)
            .sum()
    }
}

// The state the torrent's subsystems work on: pieces, peers and the way out to the disk task.
// Owned by the torrent loop and lent to each subsystem in turn.
#[derive(Debug)]
pub struct Swarm {

    pub id: TorrentID,

    pub info: Arc<StoreInfo>,

    pub state: TorrentState,

    pub peers: SecondaryMap<PeerKey, PeerConnection>,

    disk_tx: DiskTx,

    // Set when the disk task can no longer be reached.
    fault: Option<String>,

}

impl Swarm {

    pub fn new(id: TorrentID, info: Arc<StoreInfo>, disk_tx: DiskTx) -> Self {
        let state = TorrentState::new(info.num_pieces);
        Self {
            id,
            info,
            state,
            peers: SecondaryMap::new(),
            disk_tx,
            fault: None,
        }
    }

    pub fn send_disk(&mut self, cmd: CommandToDisk) {
        if let Err(e) = self.disk_tx.send(cmd) {
            tracing::error!("disk task unreachable: {}", e);
            self.fault = Some(e.to_string());
        }
    }

    pub fn fault(&self) -> Option<&str> {
        self.fault.as_deref()
    }

    pub fn set_fault(&mut self, reason: String) {
        self.fault.get_or_insert(reason);
    }
}
