use std::{net::{Ipv4Addr, SocketAddr, SocketAddrV4}, time::{Duration, Instant}};
use bytes::Buf;
use url::Url;
use serde::de;
use serde_derive::Deserialize;
use crate::torrent::{CommandToTorrent, TorrentTx};
use super::*;

// Stopped is a courtesy, it must not hold up shutdown.
const STOPPED_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    // Tracker id to send back on following announces.
    id: Option<String>,

    last_announce: Option<Instant>,

    // Used until the tracker gives us an interval.
    default_interval: Duration,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

    started: bool,

    completed: bool,

    // Consecutive failed announces.
    failures: u32,

    retry_at: Option<Instant>,

}

impl HttpTracker {

    pub fn new(url: Url) -> Self {
        Self::with_client(url, reqwest::Client::new())
    }

    pub fn with_client(url: Url, client: reqwest::Client) -> Self {
        Self {
            client,
            url,
            id: None,
            last_announce: None,
            default_interval: Duration::from_secs(30 * 60),
            interval: None,
            min_interval: None,
            started: false,
            completed: false,
            failures: 0,
            retry_at: None,
        }
    }

    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    // Announces whenever one is due until the torrent sends stopped or goes away.
    pub async fn run(&mut self, torrent_tx: TorrentTx, mut tracker_rx: TrackerRx, registry: TrackerRegistry) {
        loop {
            let params = *tracker_rx.borrow_and_update();
            let Some(params) = params else {
                if tracker_rx.changed().await.is_err() {
                    return;
                }
                continue;
            };
            let now = Instant::now();

            if params.event == Some(Event::Stopped) {
                if self.started {
                    match tokio::time::timeout(STOPPED_TIMEOUT, self.announce(params, Some(Event::Stopped))).await {
                        Ok(Ok(_)) => tracing::debug!("sent stopped"),
                        Ok(Err(e)) => tracing::debug!("stopped announce failed: {}", e),
                        Err(_) => tracing::debug!("stopped announce timed out"),
                    }
                }
                return;
            }

            let event = self.pending_event(&params);
            let backing_off = self.retry_at.map_or(false, |at| now < at);
            let wants_peers = params.num_want.map_or(false, |n| n > 0) && self.can_announce(now);
            if !backing_off && (event.is_some() || self.retry_at.is_some() || self.should_announce(now) || wants_peers) {
                let res = self.announce(params, event).await;
                self.report(res, event, &torrent_tx, &registry);
            }

            tokio::select! {
                changed = tracker_rx.changed() => {
                    if changed.is_err() {
                        tracing::debug!("torrent gone, tracker stopping");
                        return;
                    }
                },
                _ = tokio::time::sleep_until(self.next_due().into()) => {},
            }
        }
    }

    fn pending_event(&self, params: &AnnounceParams) -> Option<Event> {
        if !self.started {
            Some(Event::Started)
        } else if params.event == Some(Event::Completed) && !self.completed {
            Some(Event::Completed)
        } else {
            None
        }
    }

    fn report(
        &mut self,
        res: Result<HttpResponse>,
        event: Option<Event>,
        torrent_tx: &TorrentTx,
        registry: &TrackerRegistry,
    ) {
        let mut registry = lock_registry(registry);
        let status = registry.entry(self.url.clone()).or_default();

        match res {
            Ok(resp) => {
                self.failures = 0;
                self.retry_at = None;
                match event {
                    Some(Event::Started) => self.started = true,
                    Some(Event::Completed) => self.completed = true,
                    _ => {},
                }

                tracing::debug!("announce ok, {} peers", resp.peers.len());
                status.last_announce = self.last_announce;
                status.interval = self.interval;
                status.complete = resp.complete;
                status.incomplete = resp.incomplete;
                status.num_peers = resp.peers.len();
                status.last_error = None;

                if !resp.peers.is_empty() && torrent_tx.send(CommandToTorrent::Peers(resp.peers)).is_err() {
                    tracing::debug!("torrent gone, dropping peers");
                }
            },
            Err(e) => {
                let delay = retry_delay(&e, self.failures);
                self.failures = self.failures.saturating_add(1);
                self.retry_at = Some(Instant::now() + delay);
                tracing::warn!("announce failed: {}, retrying in {}s", e, delay.as_secs());
                status.last_error = Some(e.to_string());
            },
        }
    }

    fn next_due(&self) -> Instant {
        if let Some(at) = self.retry_at {
            return at;
        }
        match self.last_announce {
            Some(last) => last + self.interval.unwrap_or(self.default_interval),
            None => Instant::now() + DEFAULT_MIN_ANNOUNCE_INTERVAL,
        }
    }

    fn can_announce(&self, now: Instant) -> bool {
        self.last_announce.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.min_interval.unwrap_or(DEFAULT_MIN_ANNOUNCE_INTERVAL)
        })
    }

    fn should_announce(&self, now: Instant) -> bool {
        self.last_announce.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.interval.unwrap_or(self.default_interval)
        })
    }

    pub fn announce_url(&self, params: &AnnounceParams, event: Option<Event>) -> String {
        let separator = if self.url.query().is_some() { '&' } else { '?' };
        let mut url = format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&no_peer_id=1",
            self.url.as_str(),
            separator,
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&params.client_id),
            params.port,
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(event) = event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.id {
            url.push_str(&format!("&trackerid={}", urlencoding::encode(tracker_id)));
        }
        url
    }

    pub async fn announce(&mut self, params: AnnounceParams, event: Option<Event>) -> Result<HttpResponse> {
        let url = self.announce_url(&params, event);
        tracing::debug!("announce url: {}", url);

        let resp = self.client
            .get(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TrackerError::Status(status.as_u16()));
        }
        let raw_resp = resp.bytes().await?;

        let resp: HttpResponse = bencode::decode_bytes(&raw_resp)?;
        tracing::trace!("announce response: {:?}", resp);

        if let Some(failure) = resp.failure_reason {
            return Err(TrackerError::Failure(failure));
        }
        if let Some(warning) = &resp.warning_message {
            tracing::warn!("warning: {}", warning);
        }

        if let Some(interval) = resp.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = resp.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if let Some(tracker_id) = &resp.tracker_id {
            self.id = Some(tracker_id.clone());
        }

        self.last_announce = Some(Instant::now());
        Ok(resp)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct HttpResponse {

    // If present, then no other keys may be present.
    // The value is a human-readable error message as to why the request failed (string).
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,

    // Similar to failure reason, but the response still gets processed normally.
    #[serde(rename = "warning message")]
    pub warning_message: Option<String>,

    // Interval in seconds that the client should wait between sending regular requests to the tracker
    pub interval: Option<u64>,

    // Minimum announce interval. If present clients must not reannounce more frequently than this.
    #[serde(rename = "min interval")]
    pub min_interval: Option<u64>,

    // A string that the client should send back on its next announcements.
    #[serde(rename = "tracker id")]
    pub tracker_id: Option<String>,

    // Number of peers with the entire file, i.e. seeders (integer)
    pub complete: Option<u64>,

    // Number of non-seeder peers, aka "leechers" (integer)
    pub incomplete: Option<u64>,

    #[serde(default)]
    #[serde(deserialize_with = "peer_deserialize")]
    pub peers: Vec<SocketAddr>,
}

// The tracker can either return a dictionary model or a compacted string.
// Even if we request a compacted string, the tracker can still return a dictionary model.
fn peer_deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<SocketAddr>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct PeerVisitor;

    impl<'de> de::Visitor<'de> for PeerVisitor {

        type Value = Vec<SocketAddr>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string of bytes or a list of dictionaries")
        }

        // String model.
        // The first 4 bytes are the IP address and the last 2 bytes are the port number.
        // All in network (big-endian) byte order.
        fn visit_bytes<E>(self, mut v: &[u8]) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.len() % 6 != 0 {
                return Err(E::custom("peer string not multiple of 6"));
            }

            let mut peers = Vec::with_capacity(v.len() / 6);
            while v.has_remaining() {
                let ip = Ipv4Addr::from(v.get_u32());
                let port = v.get_u16();
                peers.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
            }
            Ok(peers)
        }

        // Dictionary model, a list of dictionaries with the keys "ip" and "port".
        // Peers given by hostname or IPv6 address are skipped.
        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            #[derive(Deserialize)]
            struct PeerItem {
                ip: String,
                port: u16,
            }

            let mut peers = Vec::new();
            while let Some(peer) = seq.next_element::<PeerItem>()? {
                if let Ok(ip) = peer.ip.parse::<Ipv4Addr>() {
                    peers.push(SocketAddr::V4(SocketAddrV4::new(ip, peer.port)));
                }
            }
            Ok(peers)
        }
    }

    deserializer.deserialize_any(PeerVisitor)
}
