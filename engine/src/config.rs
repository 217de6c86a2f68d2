use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};
use rand::{distributions::Alphanumeric, Rng};

// Client id prefix, the rest of the 20 bytes is random.
const CLIENT_ID_PREFIX: &[u8; 8] = b"-RS0133-";

#[derive(Debug, Clone)]
pub struct Config {

    pub client_id: [u8; 20],

    // Where downloaded torrents are placed.
    pub dir: PathBuf,

    // Listen address of the first torrent, each following torrent listens on the next port.
    pub listen_address: SocketAddr,

    // Announce interval used until a tracker gives us one.
    pub announce_interval: Duration,

    // Below the minimum more peers are asked from the trackers, the maximum caps connections.
    pub min_max_peers: (u32, u32),

    // Peers we upload to at once, including the optimistic unchoke.
    pub upload_slots: usize,

    // Rate limits in bytes per second, 0 is unlimited.
    // Client wide limits are shared by all torrents.
    pub upload_rate: u64,

    pub download_rate: u64,

    pub torrent_upload_rate: u64,

    pub torrent_download_rate: u64,

    // A peer that delivers nothing for this long is snubbed.
    pub request_timeout: Duration,

    pub snub_duration: Duration,

    // Directory for resume state, None disables it.
    pub resume_dir: Option<PathBuf>,

    // Keep seeding after the download completes.
    pub seed: bool,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            upload_slots: 4,
            upload_rate: 0,
            download_rate: 0,
            torrent_upload_rate: 0,
            torrent_download_rate: 0,
            request_timeout: Duration::from_secs(60),
            snub_duration: Duration::from_secs(20),
            resume_dir: Some(PathBuf::from(".resume")),
            seed: false,
        }
    }
}

pub fn generate_client_id() -> [u8; 20] {
    let mut id = [0; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.sample(Alphanumeric);
    }
    id
}

// Settings of a single torrent, derived from the client's.
#[derive(Debug, Clone)]
pub struct TorrentConfig {

    pub client_id: [u8; 20],

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub announce_interval: Duration,

    pub min_max_peers: (u32, u32),

    pub upload_slots: usize,

    pub upload_rate: u64,

    pub download_rate: u64,

    pub request_timeout: Duration,

    pub snub_duration: Duration,

    pub resume_dir: Option<PathBuf>,

    pub seed: bool,

}

impl TorrentConfig {
    pub fn new(config: &Config, listen_address: SocketAddr) -> Self {
        Self {
            client_id: config.client_id,
            output_dir: config.dir.clone(),
            listen_address,
            announce_interval: config.announce_interval,
            min_max_peers: config.min_max_peers,
            upload_slots: config.upload_slots,
            upload_rate: config.torrent_upload_rate,
            download_rate: config.torrent_download_rate,
            request_timeout: config.request_timeout,
            snub_duration: config.snub_duration,
            resume_dir: config.resume_dir.clone(),
            seed: config.seed,
        }
    }
}
