use std::path::{Path, PathBuf};
use bytes::{Buf, BufMut};
use crate::{bitfield::Bitfield, TorrentID};

// Layout: downloaded (u64 BE), uploaded (u64 BE), piece count (u32 BE), available bitfield.
const HEADER_LEN: usize = 20;

#[derive(thiserror::Error, Debug)]
pub enum ResumeError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("resume data truncated: {0} bytes")]
    Truncated(usize),

    #[error("resume data is for {found} pieces, torrent has {expected}")]
    PieceCount {
        expected: usize,
        found: usize,
    },

    #[error("malformed bitfield in resume data")]
    Bitfield,

}

type Result<T> = std::result::Result<T, ResumeError>;

// What a torrent remembers between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {

    pub downloaded: u64,

    pub uploaded: u64,

    pub available: Bitfield,

}

impl State {

    pub fn encode(&self) -> Vec<u8> {
        let bits = self.available.as_bytes();
        let mut buf = Vec::with_capacity(HEADER_LEN + bits.len());
        buf.put_u64(self.downloaded);
        buf.put_u64(self.uploaded);
        buf.put_u32(self.available.len() as u32);
        buf.put_slice(bits);
        buf
    }

    pub fn decode(mut buf: &[u8], num_pieces: usize) -> Result<Self> {
        if buf.remaining() < HEADER_LEN {
            return Err(ResumeError::Truncated(buf.remaining()));
        }
        let downloaded = buf.get_u64();
        let uploaded = buf.get_u64();
        let found = buf.get_u32() as usize;
        if found != num_pieces {
            return Err(ResumeError::PieceCount { expected: num_pieces, found });
        }
        let available = Bitfield::from_bytes(buf.chunk(), num_pieces).ok_or(ResumeError::Bitfield)?;

        Ok(Self {
            downloaded,
            uploaded,
            available,
        })
    }
}

pub fn path(dir: &Path, id: &TorrentID) -> PathBuf {
    dir.join(format!("{}.resume", hex::encode(id)))
}

// None if nothing was saved for this torrent.
pub fn load(dir: &Path, id: &TorrentID, num_pieces: usize) -> Result<Option<State>> {
    match std::fs::read(path(dir, id)) {
        Ok(buf) => State::decode(&buf, num_pieces).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// Written to a temporary file first so a crash never leaves a half written state behind.
pub fn save(dir: &Path, id: &TorrentID, state: &State) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = path(dir, id);
    let tmp = path.with_extension("resume.tmp");
    std::fs::write(&tmp, state.encode())?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> State {
        let mut available = Bitfield::new(10);
        available.set(0, true);
        available.set(9, true);
        State { downloaded: 0x0102, uploaded: 7, available }
    }

    #[test]
    fn test_layout() {
        let buf = state().encode();
        assert_eq!(
            buf,
            [
                &[0, 0, 0, 0, 0, 0, 1, 2][..],
                &[0, 0, 0, 0, 0, 0, 0, 7],
                &[0, 0, 0, 10],
                &[0b1000_0000, 0b0100_0000],
            ].concat(),
        );
        assert_eq!(State::decode(&buf, 10).unwrap(), state());
    }

    #[test]
    fn test_rejects_mismatch() {
        let buf = state().encode();
        assert!(matches!(State::decode(&buf, 11), Err(ResumeError::PieceCount { expected: 11, found: 10 })));
        assert!(matches!(State::decode(&buf[..12], 10), Err(ResumeError::Truncated(12))));
        assert!(matches!(State::decode(&buf[..21], 10), Err(ResumeError::Bitfield)));
    }

    #[test]
    fn test_save_and_load() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let id = [7; 20];
        assert!(load(dir.path(), &id, 10)?.is_none());

        save(dir.path(), &id, &state())?;
        assert_eq!(load(dir.path(), &id, 10)?, Some(state()));
        assert!(dir.path().join(format!("{}.resume", "07".repeat(20))).exists());
        Ok(())
    }
}
