use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use bytes::Bytes;
use slotmap::SlotMap;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::Instrument;
use crate::{
    bandwidth::{Allocator, Bandwidth, Throttle},
    block::BlockInfo,
    config::TorrentConfig,
    disk::{AllocationError, CommandToDisk, DiskTx},
    metainfo::MetaInfo,
    p2p::{Connection, Message, PeerCommand, PeerError, PeerTx},
    peer::PeerKey,
    resume,
    session::EventHub,
    stats::{PeerStats, PieceStats, ThroughputStats, TorrentStats},
    store::StoreInfo,
    swarm::Swarm,
    tracker::{AnnounceParams, Event, TrackersHandle},
    CommandToUser,
    TorrentID,
    UserTx,
};

// Time given to peer tasks to wind down on shutdown.
const PEER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const TRACKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),

    #[error("disk failure: {0}")]
    Disk(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),

}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

impl From<oneshot::error::RecvError> for TorrentError {
    fn from(e: oneshot::error::RecvError) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

#[derive(Debug)]
pub enum CommandToTorrent {

    // Sent by a peer task once the handshake is done.
    PeerConnected { key: PeerKey, id: [u8; 20] },

    PeerMessage { key: PeerKey, msg: Message },

    // Always the last command from a peer task, error is None on a clean shutdown.
    PeerDisconnected { key: PeerKey, error: Option<PeerError> },

    // Sent by the trackers.
    Peers(Vec<SocketAddr>),

    // Sent by disk task when piece written or failed its hash check.
    PieceWritten { idx: usize, valid: bool },

    // Sent by the disk task for a peer's block request, data is None if the read failed.
    BlockRead { peer: PeerKey, block: BlockInfo, data: Option<Bytes> },

    DiskFailure(String),

    // Which files to download, one flag per file.
    SetFileMask(Vec<bool>),

    Shutdown,

}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Read-only state shared with the peer tasks.
#[derive(Debug)]
pub struct TorrentContext {

    // The unique identifier for this torrent.
    pub id: TorrentID,

    // The info hash for this torrent.
    pub info_hash: [u8; 20],

    // The client ID for this client.
    pub client_id: [u8; 20],

    // Commands to the torrent.
    pub torrent_tx: TorrentTx,

    pub bandwidth: Bandwidth,

}

// The substrate side of a peer, its protocol state lives in the swarm.
#[derive(Debug)]
struct PeerLink {

    address: SocketAddr,

    tx: PeerTx,

    handle: Option<JoinHandle<()>>,

}

pub struct TorrentParams {

    pub metainfo: MetaInfo,

    pub config: TorrentConfig,

    pub disk_tx: DiskTx,

    pub user_tx: UserTx,

    // Client wide allocators.
    pub global_up: Arc<Allocator>,

    pub global_down: Arc<Allocator>,

}

pub struct TorrentHandle {

    pub torrent_tx: TorrentTx,

    pub handle: JoinHandle<()>,

}

impl TorrentHandle {
    pub fn start(params: TorrentParams) -> Self {
        let (mut torrent, torrent_tx) = Torrent::new(params);
        let span = tracing::info_span!("torrent", id = %hex::encode(torrent.ctx.id));
        let handle = tokio::spawn(async move { torrent.start().await }.instrument(span));
        Self { torrent_tx, handle }
    }
}

pub struct Torrent {

    ctx: Arc<TorrentContext>,

    swarm: Swarm,

    hub: EventHub,

    // Peer tasks, keyed the same as the swarm's peers.
    links: SlotMap<PeerKey, PeerLink>,

    // Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    trackers: TrackersHandle,

    // Handed to the disk task on allocation.
    piece_hashes: Vec<[u8; 20]>,

    torrent_rx: TorrentRx,

    user_tx: UserTx,

    config: TorrentConfig,

    // Port we actually listen on.
    port: u16,

    start_time: Option<Instant>,

    run_duration: Duration,

    throughput: ThroughputStats,

    // Counters when this session started, trackers get totals for the session.
    session_downloaded: u64,

    session_uploaded: u64,

    // Whether the download finished during this session.
    completed: bool,

    finished: bool,

}

impl Torrent {

    pub fn new(params: TorrentParams) -> (Self, TorrentTx) {
        let metainfo = params.metainfo;
        let config = params.config;
        let info = Arc::new(StoreInfo::new(&metainfo, config.output_dir.clone()));
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();

        let bandwidth = Bandwidth {
            up: Throttle::new(Arc::new(Allocator::new(config.upload_rate)), params.global_up),
            down: Throttle::new(Arc::new(Allocator::new(config.download_rate)), params.global_down),
        };
        let ctx = Arc::new(TorrentContext {
            id: metainfo.info_hash(),
            info_hash: metainfo.info_hash(),
            client_id: config.client_id,
            torrent_tx: torrent_tx.clone(),
            bandwidth,
        });

        let hub = EventHub::new(info.num_pieces, config.upload_slots, config.request_timeout, config.snub_duration);
        (
            Self {
                swarm: Swarm::new(ctx.id, info, params.disk_tx),
                hub,
                links: SlotMap::with_key(),
                available: Vec::new(),
                trackers: TrackersHandle::new(metainfo.trackers(), config.announce_interval),
                piece_hashes: metainfo.piece_hashes(),
                torrent_rx,
                user_tx: params.user_tx,
                port: config.listen_address.port(),
                config,
                start_time: None,
                run_duration: Duration::default(),
                throughput: ThroughputStats::default(),
                session_downloaded: 0,
                session_uploaded: 0,
                completed: false,
                finished: false,
                ctx,
            },
            torrent_tx,
        )
    }

    pub async fn start(&mut self) {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        if let Err(e) = self.run().await {
            tracing::error!("torrent stopped: {}", e);
            self.user_tx.send(CommandToUser::TorrentError { id: self.ctx.id, error: e.to_string() }).ok();
        }
    }

    async fn run(&mut self) -> Result<()> {
        self.allocate().await?;

        let listener = TcpListener::bind(self.config.listen_address).await?;
        self.port = listener.local_addr()?.port();
        tracing::info!("listening on {}", listener.local_addr()?);

        self.trackers.start(self.ctx.id, self.ctx.torrent_tx.clone());
        self.announce();

        let res = self.event_loop(&listener).await;
        self.shutdown().await;
        res
    }

    // Creates the files on disk, pieces already present are loaded along with the resume counters.
    async fn allocate(&mut self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let info = Arc::clone(&self.swarm.info);
        self.swarm.send_disk(CommandToDisk::NewTorrent {
            id: self.ctx.id,
            info,
            piece_hashes: std::mem::take(&mut self.piece_hashes),
            torrent_tx: self.ctx.torrent_tx.clone(),
            tx,
        });
        if let Some(fault) = self.swarm.fault() {
            return Err(TorrentError::Channel(fault.to_string()));
        }
        let bitfield = rx.await??;

        if let Some(dir) = &self.config.resume_dir {
            match resume::load(dir, &self.ctx.id, self.swarm.info.num_pieces) {
                Ok(Some(state)) => {
                    if state.available != bitfield {
                        tracing::warn!(
                            "resume state lists {} pieces, disk has {}, trusting disk",
                            state.available.count_ones(),
                            bitfield.count_ones(),
                        );
                    }
                    self.swarm.state.downloaded = state.downloaded;
                    self.swarm.state.uploaded = state.uploaded;
                },
                Ok(None) => {},
                Err(e) => tracing::warn!("ignoring resume state: {}", e),
            }
        }
        self.session_downloaded = self.swarm.state.downloaded;
        self.session_uploaded = self.swarm.state.uploaded;

        tracing::info!("{}/{} pieces present", bitfield.count_ones(), bitfield.len());
        self.swarm.state.load_available(bitfield);
        self.finished = self.swarm.state.is_complete();
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "loop")]
    async fn event_loop(&mut self, listener: &TcpListener) -> Result<()> {
        if self.finished {
            tracing::info!("nothing to download");
            self.user_tx.send(CommandToUser::TorrentFinished { id: self.ctx.id })?;
            if !self.config.seed {
                return Ok(());
            }
        }

        let mut ticker = time::interval(Duration::from_secs(1));
        let mut last_tick = None;

        // Top level torrent loop.
        loop {
            let stop = tokio::select! {

                now = ticker.tick() => {
                    self.tick(&mut last_tick, now.into_std())?;
                    false
                },

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, address)) => self.accept(stream, address),
                        Err(e) => tracing::warn!("inbound peer connection error: {}", e),
                    }
                    false
                },

                Some(cmd) = self.torrent_rx.recv() => self.handle_command(cmd)?,

            };

            self.flush_outboxes();
            if let Some(fault) = self.swarm.fault() {
                return Err(TorrentError::Channel(fault.to_string()));
            }
            if stop {
                return Ok(());
            }
        }
    }

    // Returns true if the torrent should stop.
    fn handle_command(&mut self, cmd: CommandToTorrent) -> Result<bool> {
        let now = Instant::now();
        match cmd {

            CommandToTorrent::PeerConnected { key, id } => {
                let Some(link) = self.links.get(key) else { return Ok(false) };
                if self.swarm.peers.values().any(|p| p.id == id) {
                    tracing::debug!("already connected to peer {}, dropping {}", hex::encode(id), link.address);
                    link.tx.send(PeerCommand::Shutdown).ok();
                    return Ok(false);
                }
                tracing::debug!("peer {} connected", link.address);
                self.hub.attach(&mut self.swarm, key, link.address, id);
            },

            CommandToTorrent::PeerMessage { key, msg } => {
                tracing::trace!("message: {}", msg);
                if let Err(e) = self.hub.handle_message(&mut self.swarm, key, msg, now) {
                    tracing::warn!("protocol error, disconnecting: {}", e);
                    self.hub.detach(&mut self.swarm, key, now);
                    if let Some(link) = self.links.get(key) {
                        link.tx.send(PeerCommand::Shutdown).ok();
                    }
                }
            },

            CommandToTorrent::PeerDisconnected { key, error } => {
                self.hub.detach(&mut self.swarm, key, now);
                if let Some(link) = self.links.remove(key) {
                    match error {
                        Some(e) => tracing::debug!("peer {} disconnected: {}", link.address, e),
                        None => tracing::debug!("peer {} disconnected", link.address),
                    }
                }
                self.connect_to_peers();
            },

            CommandToTorrent::Peers(peers) => {
                let connected = self.links.values().map(|l| l.address).collect::<Vec<_>>();
                for address in peers {
                    if !connected.contains(&address) && !self.available.contains(&address) {
                        self.available.push(address);
                    }
                }
                self.connect_to_peers();
            },

            CommandToTorrent::PieceWritten { idx, valid } => {
                if self.hub.piece_written(&mut self.swarm, idx, valid) {
                    tracing::debug!(
                        "piece {} verified, {} pieces remain",
                        idx,
                        self.swarm.state.scheduled.count_ones(),
                    );
                }
                return self.check_finished();
            },

            CommandToTorrent::BlockRead { peer, block, data } => {
                self.hub.block_read(&mut self.swarm, peer, block, data);
            },

            CommandToTorrent::DiskFailure(e) => return Err(TorrentError::Disk(e)),

            CommandToTorrent::SetFileMask(mask) => {
                if mask.len() != self.swarm.info.files.len() {
                    tracing::warn!("file mask for {} files, torrent has {}", mask.len(), self.swarm.info.files.len());
                    return Ok(false);
                }
                let wanted = self.swarm.info.wanted_pieces(&mask);
                tracing::info!("{} of {} pieces selected", wanted.count_ones(), wanted.len());
                self.hub.set_wanted(&mut self.swarm, wanted, now);
                if !self.swarm.state.is_complete() {
                    self.finished = false;
                }
                return self.check_finished();
            },

            CommandToTorrent::Shutdown => return Ok(true),

        }
        Ok(false)
    }

    // Returns true if the torrent should stop.
    fn check_finished(&mut self) -> Result<bool> {
        if self.finished || !self.swarm.state.is_complete() {
            return Ok(false);
        }
        self.finished = true;
        self.completed = true;
        tracing::info!("torrent download complete");
        self.user_tx.send(CommandToUser::TorrentFinished { id: self.ctx.id })?;
        self.save_resume();
        self.announce();
        Ok(!self.config.seed)
    }

    fn accept(&mut self, stream: TcpStream, address: SocketAddr) {
        if self.links.len() >= self.config.min_max_peers.1 as usize {
            tracing::debug!("peer limit reached, rejecting {}", address);
            return;
        }
        tracing::debug!("inbound connection from {}", address);
        self.spawn_link(address, Some(stream));
    }

    fn connect_to_peers(&mut self) {
        let free = (self.config.min_max_peers.1 as usize).saturating_sub(self.links.len());
        let count = self.available.len().min(free);
        if count == 0 {
            return;
        }

        tracing::debug!("connecting to {} peers", count);
        for address in self.available.drain(0..count).collect::<Vec<_>>() {
            self.spawn_link(address, None);
        }
    }

    fn spawn_link(&mut self, address: SocketAddr, stream: Option<TcpStream>) {
        let (tx, peer_rx) = mpsc::unbounded_channel();
        let ctx = Arc::clone(&self.ctx);
        self.links.insert_with_key(|key| {
            let conn = Connection::new(key, address, ctx, peer_rx);
            PeerLink {
                address,
                tx,
                handle: Some(tokio::spawn(conn.start(stream))),
            }
        });
    }

    // Hands the messages queued by the subsystems to the peer tasks.
    fn flush_outboxes(&mut self) {
        for (key, peer) in self.swarm.peers.iter_mut() {
            if peer.outbox.is_empty() {
                continue;
            }
            let outbox = peer.take_outbox();
            if let Some(link) = self.links.get(key) {
                for cmd in outbox {
                    if link.tx.send(cmd).is_err() {
                        break;
                    }
                }
            }
        }
    }

    fn tick(&mut self, last_tick: &mut Option<Instant>, now: Instant) -> Result<()> {
        let elapsed_since_tick = last_tick
            .or(self.start_time)
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        self.run_duration += elapsed_since_tick;
        *last_tick = Some(now);

        self.hub.tick(&mut self.swarm, now);

        for peer in self.swarm.peers.values_mut() {
            self.throughput += &peer.throughput;
            peer.throughput.reset();
        }
        self.throughput.reset();

        let stats = self.build_stats();
        self.user_tx.send(CommandToUser::TorrentStats { id: self.ctx.id, stats })?;

        self.announce();
        self.connect_to_peers();
        Ok(())
    }

    fn build_stats(&self) -> TorrentStats {
        let state = &self.swarm.state;
        let peer_stats = self.swarm.peers
            .values()
            .map(|peer| PeerStats {
                address: peer.address,
                am_choking: peer.am_choking,
                am_interested: peer.am_interested,
                peer_choking: peer.peer_choking,
                peer_interested: peer.peer_interested,
                num_pieces: peer.bitfield.count_ones(),
                throughput: peer.throughput,
            })
            .collect();

        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.run_duration,
            piece_stats: PieceStats {
                num_pieces: state.num_pieces(),
                num_pending: self.hub.download.num_pending(),
                num_downloaded: state.available.count_ones(),
                num_wanted: state.wanted.count_ones(),
                buffered: self.hub.download.buffered(),
            },
            peer_stats,
            tracker_stats: self.trackers.status(),
            throughput: self.throughput,
            downloaded: state.downloaded,
            uploaded: state.uploaded,
        }
    }

    fn announce_params(&self) -> AnnounceParams {
        let num_peers = self.links.len() + self.available.len();
        let (min, max) = self.config.min_max_peers;
        let num_want = if num_peers < min as usize {
            Some((max as usize).saturating_sub(num_peers))
        } else {
            None
        };

        AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.port,
            uploaded: self.swarm.state.uploaded.saturating_sub(self.session_uploaded),
            downloaded: self.swarm.state.downloaded.saturating_sub(self.session_downloaded),
            left: self.swarm.state.left(&self.swarm.info),
            event: self.completed.then_some(Event::Completed),
            num_want,
        }
    }

    fn announce(&self) {
        self.trackers.update(self.announce_params());
    }

    fn save_resume(&self) {
        let Some(dir) = &self.config.resume_dir else { return };
        let state = resume::State {
            downloaded: self.swarm.state.downloaded,
            uploaded: self.swarm.state.uploaded,
            available: self.swarm.state.available.clone(),
        };
        match resume::save(dir, &self.ctx.id, &state) {
            Ok(()) => tracing::debug!("saved resume state"),
            Err(e) => tracing::warn!("failed to save resume state: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        let lost = self.hub.download.shutdown();
        if lost > 0 {
            tracing::debug!("dropped {} buffered pieces", lost);
        }

        tracing::info!("disconnecting from {} peers", self.links.len());
        for link in self.links.values() {
            link.tx.send(PeerCommand::Shutdown).ok();
        }
        let deadline = time::Instant::now() + PEER_SHUTDOWN_TIMEOUT;
        for (_, mut link) in self.links.drain() {
            let Some(mut handle) = link.handle.take() else { continue };
            match time::timeout_at(deadline, &mut handle).await {
                Ok(Err(e)) => tracing::error!("peer task {} panicked: {}", link.address, e),
                Err(_) => {
                    tracing::debug!("peer task {} did not stop in time", link.address);
                    handle.abort();
                },
                Ok(Ok(())) => {},
            }
        }

        self.save_resume();
        let params = self.announce_params();
        self.trackers.shutdown(params, TRACKER_SHUTDOWN_TIMEOUT).await;
        self.swarm.send_disk(CommandToDisk::RemoveTorrent(self.ctx.id));
        tracing::info!("torrent stopped");
    }
}
