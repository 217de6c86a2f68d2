use std::{net::SocketAddr, time::{Duration, Instant}};

#[derive(Debug, Default, Clone)]
pub struct TorrentStats {

    pub start_time: Option<Instant>,

    pub time_elapsed: Duration,

    pub piece_stats: PieceStats,

    pub peer_stats: Vec<PeerStats>,

    pub tracker_stats: Vec<TrackerStats>,

    pub throughput: ThroughputStats,

    // Bytes transferred over the torrent's whole life, resumed across sessions.
    pub downloaded: u64,

    pub uploaded: u64,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct PieceStats {

    pub num_pieces: usize,

    // Pieces that are being downloaded or waiting on the disk.
    pub num_pending: usize,

    pub num_downloaded: usize,

    // Pieces selected for download, including those already downloaded.
    pub num_wanted: usize,

    // Bytes of downloaded blocks waiting in memory for the rest of their piece.
    pub buffered: usize,

}

impl PieceStats {
    pub fn is_seed(&self) -> bool {
        self.num_downloaded == self.num_pieces
    }

    pub fn is_complete(&self) -> bool {
        self.num_downloaded >= self.num_wanted
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PeerStats {

    pub address: std::net::SocketAddr,

    pub am_choking: bool,

    pub am_interested: bool,

    pub peer_choking: bool,

    pub peer_interested: bool,

    pub num_pieces: usize,

    pub throughput: ThroughputStats,

}

impl PeerStats {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            num_pieces: 0,
            throughput: ThroughputStats::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerStats {

    pub url: String,

    // Seeders and leechers from the last successful announce.
    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    pub num_peers: usize,

    // Cleared by the next successful announce.
    pub last_error: Option<String>,

}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThroughputStats {

    pub up: Counter,

    pub down: Counter,

}

impl ThroughputStats {
    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

impl std::ops::AddAssign<&ThroughputStats> for ThroughputStats {
    fn add_assign(&mut self, other: &ThroughputStats) {
        self.up += other.up.round();
        self.down += other.down.round();
    }
}

// Byte counter with a rolling average over the last few rounds.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counter {
    total: u64,
    round: u64,
    avg: f64,
    peak: f64,
}

impl Counter {

    const SMOOTHING: f64 = 5.0;

    pub fn add(&mut self, n: u64) {
        self.total += n;
        self.round += n;
    }

    // Closes the current round.
    pub fn reset(&mut self) {
        self.avg = (self.avg * (Self::SMOOTHING - 1.0) / Self::SMOOTHING) + (self.round as f64 / Self::SMOOTHING);
        self.round = 0;
        if self.avg > self.peak {
            self.peak = self.avg;
        }
    }

    pub fn avg(&self) -> u64 {
        self.avg as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak as u64
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn round(&self) -> u64 {
        self.round
    }

}

impl std::ops::AddAssign<u64> for Counter {
    fn add_assign(&mut self, n: u64) {
        self.add(n);
    }
}
