use std::collections::BTreeMap;
use crate::block::BlockData;

#[derive(Debug)]
struct Entry {

    // Number of blocks that make up the piece.
    expected: usize,

    blocks: Vec<BlockData>,

}

// Staging area for the blocks of pieces being downloaded.
// Deduplication is the caller's job, a block is stored at most once.
#[derive(Debug, Default)]
pub struct BlockCache {

    entries: BTreeMap<usize, Entry>,

    // Bytes currently buffered.
    load: usize,

}

impl BlockCache {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, piece_idx: usize, num_blocks: usize) {
        assert!(
            !self.entries.contains_key(&piece_idx),
            "piece {} already reserved in block cache",
            piece_idx,
        );
        self.entries.insert(piece_idx, Entry { expected: num_blocks, blocks: Vec::with_capacity(num_blocks) });
    }

    #[cfg(test)]
    pub fn is_reserved(&self, piece_idx: usize) -> bool {
        self.entries.contains_key(&piece_idx)
    }

    // Returns true exactly when this block completes its piece.
    pub fn store(&mut self, block: BlockData) -> bool {
        let Some(entry) = self.entries.get_mut(&block.piece_idx) else {
            tracing::warn!("block for unreserved piece {}", block.piece_idx);
            return false;
        };
        debug_assert!(
            entry.blocks.iter().all(|b| b.offset != block.offset),
            "block stored twice",
        );
        self.load += block.data.len();
        entry.blocks.push(block);
        entry.blocks.len() == entry.expected
    }

    // Drains every complete piece, blocks are ordered by offset.
    pub fn flush_complete(&mut self) -> Vec<(usize, Vec<BlockData>)> {
        let complete = self.entries
            .iter()
            .filter(|(_, e)| e.blocks.len() == e.expected)
            .map(|(idx, _)| *idx)
            .collect::<Vec<_>>();
        complete
            .into_iter()
            .filter_map(|idx| self.remove(idx).map(|blocks| (idx, blocks)))
            .collect()
    }

    // Drains every piece, complete or not.
    pub fn flush_everything(&mut self) -> Vec<(usize, Vec<BlockData>)> {
        let entries = std::mem::take(&mut self.entries);
        self.load = 0;
        entries
            .into_iter()
            .map(|(idx, mut entry)| {
                entry.blocks.sort_by_key(|b| b.offset);
                (idx, entry.blocks)
            })
            .collect()
    }

    // Drops a piece, returning whatever blocks it had.
    pub fn remove(&mut self, piece_idx: usize) -> Option<Vec<BlockData>> {
        let mut entry = self.entries.remove(&piece_idx)?;
        self.load -= entry.blocks.iter().map(|b| b.data.len()).sum::<usize>();
        entry.blocks.sort_by_key(|b| b.offset);
        Some(entry.blocks)
    }

    pub fn load(&self) -> usize {
        self.load
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
