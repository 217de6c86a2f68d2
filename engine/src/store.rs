use std::{ops::Range, path::PathBuf};
use crate::{bitfield::Bitfield, metainfo::MetaInfo};

// A file within the torrent, laid out end to end with the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {

    // Path relative to the torrent's output directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: u64,

    // Offset in bytes from start of torrent when viewed as single array.
    pub offset: u64,

}

impl FileInfo {

    pub fn new<P: Into<PathBuf>>(path: P, length: u64, offset: u64) -> Self {
        Self { path: path.into(), length, offset }
    }

    // Byte index range for whole torrent.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.length)
    }
}

// Immutable layout of a torrent's data, shared by the torrent, its subsystems and the disk task.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, will be <= piece_length.
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: usize,

    // Files contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, output_dir: PathBuf) -> Self {
        let output_dir = if metainfo.is_multi_file() {
            output_dir.join(metainfo.name())
        } else {
            output_dir
        };
        Self::from_files(metainfo.piece_len(), metainfo.files(), output_dir)
    }

    pub fn from_files(piece_len: usize, files: Vec<FileInfo>, output_dir: PathBuf) -> Self {
        let total_len: u64 = files.iter().map(|f| f.length).sum();
        let num_pieces = ((total_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len = if num_pieces == 0 {
            0
        } else {
            (total_len - piece_len as u64 * (num_pieces as u64 - 1)) as usize
        };

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    // Returns length of piece given its index.
    pub fn piece_length(&self, idx: usize) -> usize {
        if idx + 1 == self.num_pieces {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }

    // Returns the range of file indices that a piece overlaps.
    pub fn piece_file_intersections(&self, idx: usize) -> Range<usize> {
        debug_assert!(idx < self.num_pieces, "piece index out of bounds");

        let start = self.piece_offset(idx);
        let end = start + self.piece_length(idx) as u64;

        let mut overlapping = self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.offset < end && f.offset + f.length > start)
            .map(|(i, _)| i);

        match overlapping.next() {
            Some(first) => first..(overlapping.last().unwrap_or(first) + 1),
            None => 0..0,
        }
    }

    // Pieces overlapping at least one selected file.
    // A piece spanning a masked and an unmasked file is still wanted.
    pub fn wanted_pieces(&self, file_mask: &[bool]) -> Bitfield {
        debug_assert_eq!(file_mask.len(), self.files.len());
        let mut wanted = Bitfield::new(self.num_pieces);
        for (file, _) in self.files.iter().zip(file_mask).filter(|(_, w)| **w) {
            if file.length == 0 {
                continue;
            }
            let first = (file.offset / self.piece_len as u64) as usize;
            let last = ((file.offset + file.length - 1) / self.piece_len as u64) as usize;
            for idx in first..=last {
                wanted.set(idx, true);
            }
        }
        wanted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 10 pieces of 100 bytes, the middle file spans pieces 3 to 6.
    fn ten_piece_info() -> StoreInfo {
        StoreInfo::from_files(
            100,
            vec![
                FileInfo::new("a", 350, 0),
                FileInfo::new("b", 300, 350),
                FileInfo::new("c", 350, 650),
            ],
            "out".into(),
        )
    }

    #[test]
    fn test_layout() {
        let info = StoreInfo::from_files(
            32_768,
            vec![FileInfo::new("a", 33_677_666, 0)],
            "out".into(),
        );
        assert_eq!(info.num_pieces, 1028);
        assert_eq!(info.piece_length(0), 32_768);
        assert_eq!(info.piece_length(1027), 33_677_666 - 32_768 * 1027);
    }

    #[test]
    fn test_piece_file_intersections() {
        let info = ten_piece_info();
        assert_eq!(info.piece_file_intersections(0), 0..1);
        assert_eq!(info.piece_file_intersections(3), 0..2);
        assert_eq!(info.piece_file_intersections(4), 1..2);
        assert_eq!(info.piece_file_intersections(6), 1..3);
        assert_eq!(info.piece_file_intersections(9), 2..3);
    }

    #[test]
    fn test_wanted_pieces_single_file() {
        let info = ten_piece_info();
        let wanted = info.wanted_pieces(&[false, true, false]);
        assert_eq!(wanted.iter_ones().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_wanted_pieces_boundaries() {
        let info = ten_piece_info();
        let wanted = info.wanted_pieces(&[true, false, true]);
        // Pieces 3 and 6 are shared with the masked file but still wanted.
        assert_eq!(wanted.iter_ones().collect::<Vec<_>>(), vec![0, 1, 2, 3, 6, 7, 8, 9]);
        assert!(info.wanted_pieces(&[true, true, true]).is_full());
        assert!(info.wanted_pieces(&[false, false, false]).none());
    }
}
