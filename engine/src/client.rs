use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use crate::{
    bandwidth::Allocator,
    config::{Config, TorrentConfig},
    disk::{start_disk, CommandToDisk, DiskTx},
    metainfo::MetaInfo,
    torrent::{CommandToTorrent, TorrentHandle, TorrentParams},
    TorrentID,
    UserTx,
};

// Time a torrent gets to stop before its task is aborted.
const TORRENT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {

    #[error("client has been unexpectedly dropped")]
    ClientDropped(#[from] mpsc::error::SendError<ClientCommand>),

    #[error("client panicked")]
    ClientPanic,

    #[error("disk task unreachable")]
    DiskFailure(#[from] mpsc::error::SendError<CommandToDisk>),

}

#[derive(Debug)]
pub enum ClientCommand {

    NewTorrent(MetaInfo),

    RemoveTorrent(TorrentID),

    // One flag per file of the torrent, deselected files are not downloaded.
    SetFileMask { id: TorrentID, mask: Vec<bool> },

    Shutdown,

}

pub type Result<T> = std::result::Result<T, ClientError>;
pub type ClientRx = mpsc::UnboundedReceiver<ClientCommand>;
pub type ClientTx = mpsc::UnboundedSender<ClientCommand>;

pub struct Client {

    client_rx: ClientRx,

    torrents: HashMap<TorrentID, TorrentHandle>,

    user_tx: UserTx,

    config: Config,

    // Shared by all torrents.
    global_up: Arc<Allocator>,

    global_down: Arc<Allocator>,

    // Listen address for the next torrent.
    // The port is incremented by 1 for each new torrent, unless it is 0.
    next_address: SocketAddr,

}

impl Client {

    pub fn new(config: Config, user_tx: UserTx) -> (Self, ClientTx) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        (
            Client {
                client_rx,
                torrents: HashMap::new(),
                user_tx,
                global_up: Arc::new(Allocator::new(config.upload_rate)),
                global_down: Arc::new(Allocator::new(config.download_rate)),
                next_address: config.listen_address,
                config,
            },
            client_tx,
        )
    }

    pub async fn run(&mut self) -> Result<()> {
        let (disk_handle, disk_tx) = start_disk();

        while let Some(cmd) = self.client_rx.recv().await {
            match cmd {

                ClientCommand::NewTorrent(metainfo) => self.new_torrent(metainfo, &disk_tx),

                ClientCommand::RemoveTorrent(id) => {
                    if let Some(torrent) = self.torrents.remove(&id) {
                        tracing::info!("removing torrent {}", hex::encode(id));
                        torrent.torrent_tx.send(CommandToTorrent::Shutdown).ok();
                    } else {
                        tracing::warn!("attempted to remove non-existent torrent: {}", hex::encode(id));
                    }
                },

                ClientCommand::SetFileMask { id, mask } => {
                    match self.torrents.get(&id) {
                        Some(torrent) => { torrent.torrent_tx.send(CommandToTorrent::SetFileMask(mask)).ok(); },
                        None => tracing::warn!("file mask for non-existent torrent: {}", hex::encode(id)),
                    }
                },

                ClientCommand::Shutdown => break,

            }
        }

        self.shutdown(disk_tx, disk_handle).await
    }

    fn new_torrent(&mut self, metainfo: MetaInfo, disk_tx: &DiskTx) {
        let id = metainfo.info_hash();
        if self.torrents.contains_key(&id) {
            tracing::warn!("torrent {} already added", hex::encode(id));
            return;
        }
        tracing::info!("adding torrent {} ({}, {})", metainfo.name(), hex::encode(id), metainfo.size_fmt());

        let handle = TorrentHandle::start(TorrentParams {
            metainfo,
            config: TorrentConfig::new(&self.config, self.next_address),
            disk_tx: disk_tx.clone(),
            user_tx: self.user_tx.clone(),
            global_up: Arc::clone(&self.global_up),
            global_down: Arc::clone(&self.global_down),
        });
        self.torrents.insert(id, handle);

        let port = self.next_address.port();
        if port != 0 {
            self.next_address.set_port(port.wrapping_add(1));
        }
    }

    async fn shutdown(&mut self, disk_tx: DiskTx, disk_handle: JoinHandle<()>) -> Result<()> {
        tracing::info!("shutting down {} torrents", self.torrents.len());
        for torrent in self.torrents.values() {
            torrent.torrent_tx.send(CommandToTorrent::Shutdown).ok();
        }
        for (id, mut torrent) in self.torrents.drain() {
            match tokio::time::timeout(TORRENT_SHUTDOWN_TIMEOUT, &mut torrent.handle).await {
                Ok(Err(e)) => tracing::error!("torrent {} panicked: {}", hex::encode(id), e),
                Err(_) => {
                    tracing::warn!("torrent {} did not stop in time", hex::encode(id));
                    torrent.handle.abort();
                },
                Ok(Ok(())) => {},
            }
        }

        disk_tx.send(CommandToDisk::Shutdown)?;
        disk_handle.await.map_err(|_| ClientError::ClientPanic)?;
        Ok(())
    }
}
