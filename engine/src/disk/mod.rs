use std::sync::Arc;
use tokio::{sync::{mpsc, oneshot}, task::{self, JoinHandle}};
use tracing::Instrument;
use crate::{
    bitfield::Bitfield,
    block::{BlockData, BlockInfo},
    peer::PeerKey,
    store::StoreInfo,
    torrent::TorrentTx,
    TorrentID,
};

mod disk;
mod piece;
mod torrent;
#[cfg(test)]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("io error: expected {expected} bytes, got {actual}")]
    IoSize {
        expected: u64,
        actual: u64,
    },

    // Usually relating to poisoned file locks.
    #[error("sync error: {0}")]
    Sync(String),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<std::sync::PoisonError<T>> for DiskError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        DiskError::Sync(e.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for DiskError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        DiskError::Channel(e.to_string())
    }
}

// Errors related to allocating a new torrent to disk.
#[derive(thiserror::Error, Debug)]
pub enum AllocationError {

    #[error("torrent already exists in disk task")]
    DuplicateTorrent,

    #[error("expected {expected} piece hashes, got {actual}")]
    PieceHashes {
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

}

type Result<T, E = DiskError> = std::result::Result<T, E>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub(crate) type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

#[derive(Debug)]
pub enum CommandToDisk {

    // Creates the torrent's files and checks any data already there.
    // The verified pieces are sent back through `tx`.
    NewTorrent {
        id: TorrentID,
        info: Arc<StoreInfo>,
        piece_hashes: Vec<[u8; 20]>,
        torrent_tx: TorrentTx,
        tx: oneshot::Sender<std::result::Result<Bitfield, AllocationError>>,
    },

    RemoveTorrent(TorrentID),

    // A complete piece, blocks ordered by offset.
    // Verified against its hash before it is written.
    WritePiece {
        id: TorrentID,
        idx: usize,
        blocks: Vec<BlockData>,
    },

    // Block requested by a peer, the data goes back to the torrent tagged with the peer.
    ReadBlock {
        id: TorrentID,
        peer: PeerKey,
        block: BlockInfo,
    },

    Shutdown,

}

pub fn start_disk() -> (JoinHandle<()>, DiskTx) {
    let (mut disk, disk_tx) = disk::Disk::new();
    let handle = task::spawn(async move {
        disk.run().await
    }.instrument(tracing::info_span!("disk")));
    (handle, disk_tx)
}
