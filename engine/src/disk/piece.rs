use std::io::{Read, Seek, SeekFrom, Write};
use sha1::{Digest, Sha1};
use crate::block::BlockData;
use super::{torrent::TorrentFile, DiskError, Result};

// Joins the blocks of a piece, None if they do not exactly cover it.
pub fn assemble(len: usize, blocks: &[BlockData]) -> Option<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    for block in blocks {
        if block.offset != data.len() {
            return None;
        }
        data.extend_from_slice(&block.data);
    }
    (data.len() == len).then_some(data)
}

// Hash the piece data and compare with hash given in metainfo (computationally expensive).
pub fn verify_hash(hash: &[u8; 20], data: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().as_slice() == hash
}

// Writes bytes starting at a torrent offset across the files that hold them.
pub fn write_range(offset: u64, data: &[u8], files: &[TorrentFile]) -> Result<()> {
    let end = offset + data.len() as u64;
    let mut written = 0;

    for file in files {
        let range = file.info.byte_range();
        let start = offset.max(range.start);
        let stop = end.min(range.end);
        if start >= stop {
            continue;
        }

        let mut f = file.handle.lock()?;
        f.seek(SeekFrom::Start(start - range.start))?;
        f.write_all(&data[(start - offset) as usize..(stop - offset) as usize])?;
        written += stop - start;
    }

    if written != data.len() as u64 {
        return Err(DiskError::IoSize { expected: data.len() as u64, actual: written });
    }
    Ok(())
}

// Reads `len` contiguous bytes starting at a torrent offset.
pub fn read_range(offset: u64, len: usize, files: &[TorrentFile]) -> Result<Vec<u8>> {
    let end = offset + len as u64;
    let mut buf = vec![0; len];
    let mut read = 0;

    for file in files {
        let range = file.info.byte_range();
        let start = offset.max(range.start);
        let stop = end.min(range.end);
        if start >= stop {
            continue;
        }

        let mut f = file.handle.lock()?;
        f.seek(SeekFrom::Start(start - range.start))?;
        f.read_exact(&mut buf[(start - offset) as usize..(stop - offset) as usize])?;
        read += stop - start;
    }

    if read != len as u64 {
        return Err(DiskError::IoSize { expected: len as u64, actual: read });
    }
    Ok(buf)
}
