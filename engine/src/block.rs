use bytes::Bytes;
use crate::{store::StoreInfo, BLOCK_SIZE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    // Index of piece that the block is contained in.
    pub piece_idx: usize,

    // Offset in bytes of block within piece.
    pub offset: usize,

    // Data of block.
    pub data: Bytes,
}

impl BlockData {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

// Identifies a block within the torrent, used for requests, cancels and reservations.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct BlockInfo {

    pub piece_idx: usize,

    pub offset: usize,

    pub len: usize,

}

impl BlockInfo {

    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    // Bounds check against the torrent layout, also rejects blocks larger than 16 KiB.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        self.piece_idx < info.num_pieces
            && self.len > 0
            && self.len <= BLOCK_SIZE
            && self.offset
                .checked_add(self.len)
                .map_or(false, |end| end <= info.piece_length(self.piece_idx))
    }
}

pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

pub fn num_blocks(piece_len: usize) -> usize {
    (piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE
}
