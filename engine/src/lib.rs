use tokio::sync::mpsc;

mod bandwidth;
mod bitfield;
mod block;
mod cache;
mod choke;
mod client;
mod config;
mod de;
mod disk;
mod interest;
mod metainfo;
mod p2p;
mod peer;
mod picker;
mod resume;
mod scheduler;
mod session;
mod store;
mod swarm;
mod torrent;
mod tracker;
mod upload;
pub mod stats;

// Most commonly used block size - 16KB.
const BLOCK_SIZE: usize = 0x4000;

// Largest message we accept from a peer, a block plus headroom.
const MAX_MESSAGE_LEN: usize = 0x8000;

// 20 byte SHA1 info hash.
pub type TorrentID = [u8; 20];

// Messages the users of the client expect to receive.
#[derive(Debug)]
pub enum CommandToUser {

    // Sent every second with the current stats of a torrent.
    TorrentStats {
        id: TorrentID,
        stats: stats::TorrentStats,
    },

    // Sent when every selected piece of a torrent is on disk.
    TorrentFinished {
        id: TorrentID,
    },

    // Sent when a torrent stops because of an error.
    TorrentError {
        id: TorrentID,
        error: String,
    },

}

type UserTx = mpsc::UnboundedSender<CommandToUser>;
pub type UserRx = mpsc::UnboundedReceiver<CommandToUser>;

use client::{ClientCommand, ClientTx};

// Re-exports
pub use bitfield::Bitfield;
pub use client::{ClientError, Result};
pub use config::Config;
pub use metainfo::{format_size, MetaInfo, MetaInfoError};
pub use store::FileInfo;

pub fn start_client(config: Option<Config>) -> (Handle, UserRx) {
    let (user_tx, user_rx) = mpsc::unbounded_channel();
    let (mut client, client_tx) = client::Client::new(config.unwrap_or_default(), user_tx);
    let client_handle = tokio::spawn(async move {
        if let Err(e) = client.run().await {
            tracing::error!("client runtime error: {:?}", e);
        }
    });
    (
        Handle {
            client_tx,
            client_handle,
        },
        user_rx,
    )
}

// Handle returned to the user to interact with the client.
pub struct Handle {

    client_tx: ClientTx,

    client_handle: tokio::task::JoinHandle<()>,

}

impl Handle {

    pub fn new_torrent(&self, metainfo: MetaInfo) -> Result<()> {
        self.client_tx.send(ClientCommand::NewTorrent(metainfo))?;
        Ok(())
    }

    pub fn remove_torrent(&self, id: TorrentID) -> Result<()> {
        self.client_tx.send(ClientCommand::RemoveTorrent(id))?;
        Ok(())
    }

    // Deselected files are skipped, pieces they share with selected files are still downloaded.
    pub fn set_file_mask(&self, id: TorrentID, mask: Vec<bool>) -> Result<()> {
        self.client_tx.send(ClientCommand::SetFileMask { id, mask })?;
        Ok(())
    }

    pub async fn shutdown(self) -> Result<()> {
        self.client_tx.send(ClientCommand::Shutdown).ok();
        self.client_handle.await.map_err(|_| ClientError::ClientPanic)?;
        Ok(())
    }

}
