use std::collections::HashMap;
use tokio::{sync::mpsc, task};
use crate::TorrentID;
use super::*;

pub struct Disk {

    // Currently active torrents.
    torrents: HashMap<TorrentID, torrent::Torrent>,

    // Commands to the disk task.
    disk_rx: DiskRx,

}

impl Disk {

    pub fn new() -> (Self, DiskTx) {
        let (disk_tx, disk_rx) = mpsc::unbounded_channel();
        (
            Disk {
                torrents: HashMap::new(),
                disk_rx,
            },
            disk_tx,
        )
    }

    pub async fn run(&mut self) {

        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                CommandToDisk::NewTorrent {
                    id,
                    info,
                    piece_hashes,
                    torrent_tx,
                    tx,
                } => {
                    let res = if self.torrents.contains_key(&id) {
                        Err(AllocationError::DuplicateTorrent)
                    } else {
                        self.allocate(id, info, piece_hashes, torrent_tx).await
                    };
                    if tx.send(res).is_err() {
                        tracing::warn!("torrent {} gone before allocation finished", hex::encode(id));
                        self.torrents.remove(&id);
                    }
                },

                CommandToDisk::RemoveTorrent(id) => {
                    if self.torrents.remove(&id).is_some() {
                        tracing::info!("removed torrent {}", hex::encode(id));
                    }
                },

                CommandToDisk::WritePiece { id, idx, blocks } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => torrent.write_piece(idx, blocks),
                        None => tracing::warn!("torrent {} not found on disk", hex::encode(id)),
                    }
                },

                CommandToDisk::ReadBlock { id, peer, block } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => torrent.read_block(peer, block),
                        None => tracing::warn!("torrent {} not found on disk", hex::encode(id)),
                    }
                },

                CommandToDisk::Shutdown => {
                    tracing::info!("disk task shutting down");
                    break;
                },

            }
        }
    }

    // Files are created and rechecked off the async runtime.
    async fn allocate(
        &mut self,
        id: TorrentID,
        info: std::sync::Arc<crate::store::StoreInfo>,
        piece_hashes: Vec<[u8; 20]>,
        torrent_tx: crate::torrent::TorrentTx,
    ) -> std::result::Result<Bitfield, AllocationError> {
        let (torrent, bitfield) = task::spawn_blocking(move || {
            let torrent = torrent::Torrent::new(info, piece_hashes, torrent_tx)?;
            let bitfield = torrent.check_existing_files();
            Ok::<_, AllocationError>((torrent, bitfield))
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;

        tracing::info!(
            "allocated torrent {}, {}/{} pieces already present",
            hex::encode(id),
            bitfield.count_ones(),
            bitfield.len(),
        );
        self.torrents.insert(id, torrent);
        Ok(bitfield)
    }
}
