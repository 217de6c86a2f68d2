use std::{
    fs::{self, OpenOptions},
    sync::{Arc, Mutex},
};
use bytes::Bytes;
use lru::LruCache;
use crate::{
    bitfield::Bitfield,
    block::{BlockData, BlockInfo},
    peer::PeerKey,
    store::{FileInfo, StoreInfo},
    torrent::{CommandToTorrent, TorrentTx},
};
use super::{piece, AllocationError, Result};

// Upper bound on the bytes of whole pieces kept for peers reading several blocks of the same piece.
const READ_CACHE_BYTES: usize = 32 * 1024 * 1024;

pub struct Torrent {

    info: Arc<StoreInfo>,

    // Context shared with the blocking io tasks.
    ctx: Arc<Ctx>,

}

struct Ctx {

    files: Vec<TorrentFile>,

    piece_hashes: Vec<[u8; 20]>,

    torrent_tx: TorrentTx,

    read_cache: Mutex<ReadCache>,

}

// Pieces read from disk for uploads, least recently used evicted first.
struct ReadCache {

    pieces: LruCache<usize, Bytes>,

    size: usize,

    capacity: usize,

}

impl ReadCache {

    fn new(capacity: usize) -> Self {
        Self { pieces: LruCache::unbounded(), size: 0, capacity }
    }

    fn get(&mut self, idx: usize) -> Option<Bytes> {
        self.pieces.get(&idx).cloned()
    }

    // Pieces larger than the whole cache are not kept.
    fn put(&mut self, idx: usize, piece: Bytes) {
        let len = piece.len();
        if len > self.capacity {
            return;
        }
        if let Some(old) = self.pieces.put(idx, piece) {
            self.size -= old.len();
        }
        self.size += len;
        while self.size > self.capacity {
            match self.pieces.pop_lru() {
                Some((_, evicted)) => self.size -= evicted.len(),
                None => break,
            }
        }
    }
}

// Writes to the same file are ordered by its lock.
pub struct TorrentFile {

    pub info: FileInfo,

    pub handle: Mutex<fs::File>,

}

impl Torrent {

    pub fn new(
        info: Arc<StoreInfo>,
        piece_hashes: Vec<[u8; 20]>,
        torrent_tx: TorrentTx,
    ) -> std::result::Result<Self, AllocationError> {

        if piece_hashes.len() != info.num_pieces {
            return Err(AllocationError::PieceHashes { expected: info.num_pieces, actual: piece_hashes.len() });
        }

        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created missing output directory: {:?}", info.output_dir);
        }

        let mut files = Vec::with_capacity(info.files.len());
        for file in info.files.iter() {
            let path = info.output_dir.join(&file.path);
            if let Some(subdir) = path.parent() {
                if !subdir.exists() {
                    tracing::info!("creating sub-directory: {:?}", subdir);
                    fs::create_dir_all(subdir)?;
                }
            }

            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)?;
            if handle.metadata()?.len() < file.length {
                handle.set_len(file.length)?;
            }
            tracing::debug!("opened file: {:?}", path);

            files.push(TorrentFile { info: file.clone(), handle: Mutex::new(handle) });
        }

        Ok(Self {
            info,
            ctx: Arc::new(Ctx {
                files,
                piece_hashes,
                torrent_tx,
                read_cache: Mutex::new(ReadCache::new(READ_CACHE_BYTES)),
            }),
        })
    }

    // Verifies and writes a piece on a blocking thread, the result goes back to the torrent.
    pub fn write_piece(&self, idx: usize, blocks: Vec<BlockData>) {
        if idx >= self.info.num_pieces {
            tracing::warn!("write for piece {} out of range", idx);
            return;
        }
        let info = Arc::clone(&self.info);
        let ctx = Arc::clone(&self.ctx);

        tokio::task::spawn_blocking(move || {
            let valid = piece::assemble(info.piece_length(idx), &blocks)
                .filter(|data| piece::verify_hash(&ctx.piece_hashes[idx], data));

            let cmd = match valid {
                Some(data) => {
                    let files = &ctx.files[info.piece_file_intersections(idx)];
                    match piece::write_range(info.piece_offset(idx), &data, files) {
                        Ok(()) => {
                            tracing::trace!("piece {} written", idx);
                            CommandToTorrent::PieceWritten { idx, valid: true }
                        },
                        Err(e) => {
                            tracing::error!("failed to write piece {}: {}", idx, e);
                            CommandToTorrent::DiskFailure(e.to_string())
                        },
                    }
                },
                None => {
                    tracing::warn!("piece {} failed hash verification", idx);
                    CommandToTorrent::PieceWritten { idx, valid: false }
                },
            };

            if ctx.torrent_tx.send(cmd).is_err() {
                tracing::debug!("torrent gone, dropping write result for piece {}", idx);
            }
        });
    }

    // Reads a block for a peer, whole pieces are read and cached.
    pub fn read_block(&self, peer: PeerKey, block: BlockInfo) {
        if !block.is_valid(&self.info) {
            tracing::warn!("invalid block read: {:?}", block);
            return;
        }

        let cached = match self.ctx.read_cache.lock() {
            Ok(mut cache) => cache.get(block.piece_idx),
            Err(_) => None,
        };
        if let Some(piece) = cached {
            tracing::trace!("cache hit for piece {}", block.piece_idx);
            let data = piece.slice(block.offset..block.offset + block.len);
            self.send_block(peer, block, Some(data));
            return;
        }

        let info = Arc::clone(&self.info);
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || {
            let idx = block.piece_idx;
            let files = &ctx.files[info.piece_file_intersections(idx)];
            let data = match piece::read_range(info.piece_offset(idx), info.piece_length(idx), files) {
                Ok(data) => {
                    let piece = Bytes::from(data);
                    if let Ok(mut cache) = ctx.read_cache.lock() {
                        cache.put(idx, piece.clone());
                    }
                    Some(piece.slice(block.offset..block.offset + block.len))
                },
                Err(e) => {
                    tracing::error!("failed to read piece {}: {}", idx, e);
                    None
                },
            };
            if ctx.torrent_tx.send(CommandToTorrent::BlockRead { peer, block, data }).is_err() {
                tracing::debug!("torrent gone, dropping block read");
            }
        });
    }

    fn send_block(&self, peer: PeerKey, block: BlockInfo, data: Option<Bytes>) {
        if self.ctx.torrent_tx.send(CommandToTorrent::BlockRead { peer, block, data }).is_err() {
            tracing::debug!("torrent gone, dropping block read");
        }
    }

    // Hashes every piece already on disk, returns the ones that check out.
    pub fn check_existing_files(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.info.num_pieces);
        for idx in 0..self.info.num_pieces {
            if let Ok(true) = self.check_piece(idx) {
                bitfield.set(idx, true);
            }
        }
        bitfield
    }

    fn check_piece(&self, idx: usize) -> Result<bool> {
        let files = &self.ctx.files[self.info.piece_file_intersections(idx)];
        let data = piece::read_range(self.info.piece_offset(idx), self.info.piece_length(idx), files)?;
        Ok(piece::verify_hash(&self.ctx.piece_hashes[idx], &data))
    }
}
