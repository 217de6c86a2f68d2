use std::{path::Path, sync::Arc, time::Duration};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use slotmap::SlotMap;
use tokio::sync::{mpsc, oneshot};
use crate::{
    block::{BlockData, BlockInfo},
    peer::PeerKey,
    store::{FileInfo, StoreInfo},
    torrent::{CommandToTorrent, TorrentRx},
    BLOCK_SIZE,
};
use super::*;

const PIECE_LEN: usize = 2 * BLOCK_SIZE;

// Three files of 20000, 30000 and 15536 bytes, two pieces.
fn store(dir: &Path) -> Arc<StoreInfo> {
    let files = vec![
        FileInfo::new("a.bin", 20000, 0),
        FileInfo::new("sub/b.bin", 30000, 20000),
        FileInfo::new("sub/c.bin", 15536, 50000),
    ];
    Arc::new(StoreInfo::from_files(PIECE_LEN, files, dir.join("torrent")))
}

// Deterministic content of the whole torrent.
fn content(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn hashes(data: &[u8]) -> Vec<[u8; 20]> {
    data.chunks(PIECE_LEN)
        .map(|chunk| Sha1::digest(chunk).into())
        .collect()
}

fn blocks(idx: usize, piece: &[u8]) -> Vec<BlockData> {
    piece.chunks(BLOCK_SIZE)
        .enumerate()
        .map(|(i, chunk)| BlockData {
            piece_idx: idx,
            offset: i * BLOCK_SIZE,
            data: Bytes::copy_from_slice(chunk),
        })
        .collect()
}

async fn allocate(
    disk_tx: &DiskTx,
    info: Arc<StoreInfo>,
    piece_hashes: Vec<[u8; 20]>,
) -> anyhow::Result<(std::result::Result<Bitfield, AllocationError>, TorrentRx)> {
    let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
    let (tx, rx) = oneshot::channel();
    disk_tx.send(CommandToDisk::NewTorrent { id: [1; 20], info, piece_hashes, torrent_tx, tx })?;
    Ok((rx.await?, torrent_rx))
}

async fn recv(torrent_rx: &mut TorrentRx) -> CommandToTorrent {
    tokio::time::timeout(Duration::from_secs(5), torrent_rx.recv())
        .await
        .expect("timed out waiting on disk")
        .expect("disk channel closed")
}

#[tokio::test]
async fn test_allocation_creates_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let info = store(dir.path());
    let data = content(info.total_len);
    let (_, disk_tx) = start_disk();

    let (res, _torrent_rx) = allocate(&disk_tx, Arc::clone(&info), hashes(&data)).await?;
    let bitfield = res?;
    assert_eq!(bitfield.len(), 2);
    assert!(bitfield.none());

    for file in info.files.iter() {
        let meta = std::fs::metadata(info.output_dir.join(&file.path))?;
        assert_eq!(meta.len(), file.length);
    }

    // Same torrent again.
    let (res, _) = allocate(&disk_tx, info, hashes(&data)).await?;
    assert!(matches!(res, Err(AllocationError::DuplicateTorrent)));
    Ok(())
}

#[tokio::test]
async fn test_write_piece_across_files() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let info = store(dir.path());
    let data = content(info.total_len);
    let (_, disk_tx) = start_disk();
    let (res, mut torrent_rx) = allocate(&disk_tx, Arc::clone(&info), hashes(&data)).await?;
    res?;

    // Second piece covers the end of b.bin and all of c.bin.
    let piece = &data[PIECE_LEN..];
    disk_tx.send(CommandToDisk::WritePiece { id: [1; 20], idx: 1, blocks: blocks(1, piece) })?;
    match recv(&mut torrent_rx).await {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 1);
            assert!(valid);
        },
        cmd => panic!("unexpected command: {:?}", cmd),
    }

    let b = std::fs::read(info.output_dir.join("sub/b.bin"))?;
    assert_eq!(&b[PIECE_LEN - 20000..], &data[PIECE_LEN..50000]);
    let c = std::fs::read(info.output_dir.join("sub/c.bin"))?;
    assert_eq!(&c[..], &data[50000..]);
    // First file untouched.
    let a = std::fs::read(info.output_dir.join("a.bin"))?;
    assert!(a.iter().all(|&byte| byte == 0));

    // Block reads come from the written piece.
    let mut keys = SlotMap::<PeerKey, ()>::with_key();
    let peer = keys.insert(());
    let block = BlockInfo { piece_idx: 1, offset: BLOCK_SIZE, len: BLOCK_SIZE };
    disk_tx.send(CommandToDisk::ReadBlock { id: [1; 20], peer, block })?;
    match recv(&mut torrent_rx).await {
        CommandToTorrent::BlockRead { peer: p, block: b, data: Some(bytes) } => {
            assert_eq!(p, peer);
            assert_eq!(b, block);
            assert_eq!(&bytes[..], &data[PIECE_LEN + BLOCK_SIZE..]);
        },
        cmd => panic!("unexpected command: {:?}", cmd),
    }
    Ok(())
}

#[tokio::test]
async fn test_corrupt_piece_is_not_written() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let info = store(dir.path());
    let data = content(info.total_len);
    let (_, disk_tx) = start_disk();
    let (res, mut torrent_rx) = allocate(&disk_tx, Arc::clone(&info), hashes(&data)).await?;
    res?;

    let mut piece = data[..PIECE_LEN].to_vec();
    piece[100] ^= 0xff;
    disk_tx.send(CommandToDisk::WritePiece { id: [1; 20], idx: 0, blocks: blocks(0, &piece) })?;
    match recv(&mut torrent_rx).await {
        CommandToTorrent::PieceWritten { idx, valid } => {
            assert_eq!(idx, 0);
            assert!(!valid);
        },
        cmd => panic!("unexpected command: {:?}", cmd),
    }

    let a = std::fs::read(info.output_dir.join("a.bin"))?;
    assert!(a.iter().all(|&byte| byte == 0));
    Ok(())
}

#[tokio::test]
async fn test_recheck_finds_existing_pieces() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let info = store(dir.path());
    let data = content(info.total_len);

    // Only the first piece's bytes are present, a.bin and the start of b.bin.
    std::fs::create_dir_all(info.output_dir.join("sub"))?;
    std::fs::write(info.output_dir.join("a.bin"), &data[..20000])?;
    std::fs::write(info.output_dir.join("sub/b.bin"), &data[20000..PIECE_LEN])?;

    let (_, disk_tx) = start_disk();
    let (res, _torrent_rx) = allocate(&disk_tx, info, hashes(&data)).await?;
    let bitfield = res?;
    assert!(bitfield.get(0));
    assert!(!bitfield.get(1));
    Ok(())
}

#[tokio::test]
async fn test_mismatched_hashes_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let info = store(dir.path());
    let (_, disk_tx) = start_disk();
    let (res, _torrent_rx) = allocate(&disk_tx, info, vec![[0; 20]]).await?;
    assert!(matches!(res, Err(AllocationError::PieceHashes { expected: 2, actual: 1 })));
    Ok(())
}
