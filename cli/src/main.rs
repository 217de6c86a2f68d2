use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::{Duration, Instant},
};
use anyhow::Context;
use clap::Parser;
use torrent_engine::{format_size, start_client, stats::TorrentStats, CommandToUser, Config, MetaInfo, TorrentID};

// How often a progress line is printed per torrent.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(version, about = "Download torrents from the command line")]
struct Args {

    #[arg(required = true, help = "Paths to .torrent files")]
    torrents: Vec<PathBuf>,

    #[arg(short, long, default_value = "downloads", help = "Directory downloads are written to")]
    output: PathBuf,

    #[arg(short, long, default_value_t = 6881, help = "Listen port of the first torrent, 0 picks any free port")]
    port: u16,

    #[arg(long, default_value_t = 4, help = "Peers uploaded to at once")]
    upload_slots: usize,

    #[arg(long, default_value_t = 0, help = "Upload limit in bytes per second, 0 is unlimited")]
    max_up: u64,

    #[arg(long, default_value_t = 0, help = "Download limit in bytes per second, 0 is unlimited")]
    max_down: u64,

    #[arg(long, value_delimiter = ',', help = "Indices of the files to download, all when omitted")]
    files: Vec<usize>,

    #[arg(long, help = "Keep seeding once downloads complete")]
    seed: bool,

    #[arg(long, help = "Don't load or save resume state")]
    no_resume: bool,

    #[arg(long, default_value_t = tracing::Level::INFO, help = "Maximum log level")]
    log_level: tracing::Level,

}

impl Args {
    fn config(&self) -> Config {
        let mut config = Config {
            dir: self.output.clone(),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.port),
            upload_slots: self.upload_slots,
            upload_rate: self.max_up,
            download_rate: self.max_down,
            seed: self.seed,
            ..Default::default()
        };
        if self.no_resume {
            config.resume_dir = None;
        }
        config
    }

    fn file_mask(&self, num_files: usize) -> Option<Vec<bool>> {
        if self.files.is_empty() {
            return None;
        }
        Some((0..num_files).map(|i| self.files.contains(&i)).collect())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Set up logging.
    let sub = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(sub)?;

    let metainfos = args.torrents
        .iter()
        .map(|path| MetaInfo::new(path).with_context(|| format!("failed to parse {}", path.display())))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (client, mut user_rx) = start_client(Some(args.config()));
    let mut names = HashMap::new();
    for metainfo in metainfos {
        let id = metainfo.info_hash();
        println!("{} ({}), {} files", metainfo.name(), metainfo.size_fmt(), metainfo.files().len());
        let mask = args.file_mask(metainfo.files().len());
        names.insert(id, metainfo.name().to_string());
        client.new_torrent(metainfo)?;
        if let Some(mask) = mask {
            client.set_file_mask(id, mask)?;
        }
    }

    let mut remaining = names.len();
    let mut last_print: HashMap<TorrentID, Instant> = HashMap::new();
    loop {
        tokio::select! {

            cmd = user_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {

                    CommandToUser::TorrentStats { id, stats } => {
                        let due = last_print.get(&id).map_or(true, |t| t.elapsed() >= PROGRESS_INTERVAL);
                        if due {
                            last_print.insert(id, Instant::now());
                            print_progress(names.get(&id).map_or("?", |n| n.as_str()), &stats);
                        }
                    },

                    CommandToUser::TorrentFinished { id } => {
                        println!("{} complete", names.get(&id).cloned().unwrap_or_else(|| hex::encode(id)));
                        if !args.seed {
                            remaining -= 1;
                        }
                    },

                    CommandToUser::TorrentError { id, error } => {
                        eprintln!("{} failed: {}", names.get(&id).cloned().unwrap_or_else(|| hex::encode(id)), error);
                        remaining -= 1;
                    },

                }
                if remaining == 0 {
                    break;
                }
            },

            _ = tokio::signal::ctrl_c() => {
                println!("interrupted, shutting down");
                break;
            },

        }
    }

    client.shutdown().await?;
    Ok(())
}

fn print_progress(name: &str, stats: &TorrentStats) {
    let pieces = &stats.piece_stats;
    let percent = if pieces.num_wanted == 0 {
        100.0
    } else {
        pieces.num_downloaded.min(pieces.num_wanted) as f64 / pieces.num_wanted as f64 * 100.0
    };
    println!(
        "{}: {:.1}% ({}/{} pieces, {} pending), {} peers, down {}/s, up {}/s",
        name,
        percent,
        pieces.num_downloaded,
        pieces.num_wanted,
        pieces.num_pending,
        stats.peer_stats.len(),
        format_size(stats.throughput.down.avg()),
        format_size(stats.throughput.up.avg()),
    );
    for tracker in stats.tracker_stats.iter() {
        match &tracker.last_error {
            Some(error) => println!("  {}: {}", tracker.url, error),
            None => println!(
                "  {}: {} seeders, {} leechers, {} peers",
                tracker.url,
                tracker.complete.map_or("?".to_string(), |n| n.to_string()),
                tracker.incomplete.map_or("?".to_string(), |n| n.to_string()),
                tracker.num_peers,
            ),
        }
    }
}
