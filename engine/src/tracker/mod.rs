use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::Instrument;
use url::Url;
use crate::{stats::TrackerStats, torrent::TorrentTx, TorrentID};

mod http;
pub use http::HttpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = watch::Receiver<Option<AnnounceParams>>;

// Status of every tracker of a torrent, written by the tracker tasks and read into the torrent's stats.
pub type TrackerRegistry = Arc<Mutex<HashMap<Url, TrackerStatus>>>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

// Backoff after transport errors and 5xx responses starts here and doubles.
const RETRY_BASE: Duration = Duration::from_secs(15);

// Longest wait between retries, also used whenever the tracker refuses us outright.
const RETRY_MAX: Duration = Duration::from_secs(30 * 60);

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("error deserializing response: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("http status {0}")]
    Status(u16),

    #[error("tracker failure: {0}")]
    Failure(String),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

}

// How long to wait before announcing again after an error.
pub fn retry_delay(err: &TrackerError, failures: u32) -> Duration {
    match err {
        TrackerError::Status(code) if (400..500).contains(code) => RETRY_MAX,
        TrackerError::Failure(_) | TrackerError::UnsupportedScheme(_) => RETRY_MAX,
        _ => RETRY_BASE
            .checked_mul(1 << failures.min(16))
            .map_or(RETRY_MAX, |d| d.min(RETRY_MAX)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackerStatus {

    pub last_announce: Option<Instant>,

    pub interval: Option<Duration>,

    // Seeders and leechers as reported by the tracker.
    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    // Peers returned by the last successful announce.
    pub num_peers: usize,

    pub last_error: Option<String>,

}

// Owns the tracker tasks of one torrent.
pub struct TrackersHandle {

    urls: Vec<Url>,

    // Used until a tracker tells us its own interval.
    announce_interval: Duration,

    handles: Vec<JoinHandle<()>>,

    tracker_tx: TrackerTx,

    registry: TrackerRegistry,

}

impl TrackersHandle {

    pub fn new(tiers: Vec<Vec<Url>>, announce_interval: Duration) -> Self {
        let (tracker_tx, _) = watch::channel(None);
        let mut urls: Vec<Url> = Vec::new();
        for url in tiers.into_iter().flatten() {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }

        Self {
            urls,
            announce_interval,
            handles: Vec::new(),
            tracker_tx,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start(&mut self, id: TorrentID, torrent_tx: TorrentTx) {
        for url in self.urls.iter() {
            let mut tracker = match url.scheme() {
                "http" | "https" => HttpTracker::new(url.clone()).with_default_interval(self.announce_interval),
                scheme => {
                    tracing::warn!("skipping {}: {}", url, TrackerError::UnsupportedScheme(scheme.to_string()));
                    continue;
                },
            };

            let tx = torrent_tx.clone();
            let rx = self.tracker_tx.subscribe();
            let registry = Arc::clone(&self.registry);
            lock_registry(&registry).entry(url.clone()).or_default();
            let handle = tokio::spawn(async move {
                tracker.run(tx, rx, registry).await
            }.instrument(tracing::info_span!("tracker", url = %url, torrent = %hex::encode(id))));
            self.handles.push(handle);
        }
        tracing::debug!("started {} tracker tasks", self.handles.len());
    }

    pub fn num_trackers(&self) -> usize {
        self.handles.len()
    }

    // Latest counters for the trackers, each decides on its own whether to announce.
    pub fn update(&self, params: AnnounceParams) {
        self.tracker_tx.send_replace(Some(params));
    }

    // Started trackers in announce order.
    pub fn status(&self) -> Vec<TrackerStats> {
        let registry = lock_registry(&self.registry);
        self.urls
            .iter()
            .filter_map(|url| registry.get(url).map(|status| TrackerStats {
                url: url.to_string(),
                complete: status.complete,
                incomplete: status.incomplete,
                num_peers: status.num_peers,
                last_error: status.last_error.clone(),
            }))
            .collect()
    }

    // Trackers get a chance to send the stopped event, stragglers are aborted.
    pub async fn shutdown(&mut self, params: AnnounceParams, timeout: Duration) {
        self.update(AnnounceParams { event: Some(Event::Stopped), ..params });
        for mut handle in self.handles.drain(..) {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Err(e)) => tracing::error!("tracker join error: {}", e),
                Err(_) => {
                    tracing::debug!("tracker did not stop in time");
                    handle.abort();
                },
                Ok(Ok(())) => {},
            }
        }
    }
}

// Statuses are plain data, a poisoned lock is still usable.
pub(crate) fn lock_registry(registry: &TrackerRegistry) -> std::sync::MutexGuard<'_, HashMap<Url, TrackerStatus>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash: TorrentID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id: [u8; 20],

    // Port we listen on.
    pub port: u16,

    // Totals since the torrent was started.
    pub uploaded: u64,

    pub downloaded: u64,

    // Bytes still needed to complete the selected files.
    pub left: u64,

    // Completed once the download finished, stopped on shutdown.
    // Trackers send started on their own.
    pub event: Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {

    Started,

    Completed,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Started => write!(f, "started"),
            Event::Completed => write!(f, "completed"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}
