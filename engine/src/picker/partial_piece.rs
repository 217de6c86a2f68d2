use crate::{block::{block_len, num_blocks, BlockInfo}, peer::PeerKey, BLOCK_SIZE};

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum BlockState {

    // Block has not been requested.
    #[default]
    Free,

    // Block has been requested by at least 1 peer.
    Requested,

    // Block has been received.
    Received,

}

#[derive(Debug, Default, Clone)]
struct Block {

    state: BlockState,

    // Peers the block is currently requested from, more than one in end game.
    requesters: Vec<PeerKey>,

}

// A piece that is being downloaded.
#[derive(Debug)]
pub struct PartialPiece {

    // Piece index.
    pub idx: usize,

    // Length of piece.
    pub len: usize,

    blocks: Vec<Block>,

    num_received: usize,

}

impl PartialPiece {

    pub fn new(idx: usize, len: usize) -> Self {
        Self {
            idx,
            len,
            blocks: vec![Block::default(); num_blocks(len)],
            num_received: 0,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_info(&self, block_idx: usize) -> BlockInfo {
        BlockInfo {
            piece_idx: self.idx,
            offset: block_idx * BLOCK_SIZE,
            len: block_len(self.len, block_idx),
        }
    }

    // Index of the block matching `block` exactly, if any.
    pub fn block_idx(&self, block: &BlockInfo) -> Option<usize> {
        if block.piece_idx != self.idx || block.offset % BLOCK_SIZE != 0 {
            return None;
        }
        let idx = block.idx_in_piece();
        (idx < self.blocks.len() && self.block_info(idx) == *block).then_some(idx)
    }

    pub fn state(&self, block_idx: usize) -> BlockState {
        self.blocks[block_idx].state
    }

    pub fn requesters(&self, block_idx: usize) -> &[PeerKey] {
        &self.blocks[block_idx].requesters
    }

    pub fn request(&mut self, block_idx: usize, peer: PeerKey) {
        let block = &mut self.blocks[block_idx];
        debug_assert_ne!(block.state, BlockState::Received);
        block.state = BlockState::Requested;
        if !block.requesters.contains(&peer) {
            block.requesters.push(peer);
        }
    }

    // Drops `peer` from the block's requesters, the block is free again once nobody has it requested.
    pub fn release(&mut self, block_idx: usize, peer: PeerKey) {
        let block = &mut self.blocks[block_idx];
        block.requesters.retain(|&k| k != peer);
        if block.state == BlockState::Requested && block.requesters.is_empty() {
            block.state = BlockState::Free;
        }
    }

    // Marks the block received, returning the peers it was requested from.
    // None if it had already been received.
    pub fn receive(&mut self, block_idx: usize) -> Option<Vec<PeerKey>> {
        let block = &mut self.blocks[block_idx];
        if block.state == BlockState::Received {
            return None;
        }
        block.state = BlockState::Received;
        self.num_received += 1;
        Some(std::mem::take(&mut block.requesters))
    }

    pub fn is_complete(&self) -> bool {
        self.num_received == self.blocks.len()
    }

    pub fn has_free(&self) -> bool {
        self.blocks.iter().any(|b| b.state == BlockState::Free)
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Free)
            .map(|(i, _)| i)
    }

    pub fn requested_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.state == BlockState::Requested)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn test_block_lifecycle() {
        let mut keys = SlotMap::<PeerKey, ()>::with_key();
        let (a, b) = (keys.insert(()), keys.insert(()));
        let mut piece = PartialPiece::new(3, 2 * BLOCK_SIZE + 100);
        assert_eq!(piece.num_blocks(), 3);
        assert_eq!(piece.block_info(2), BlockInfo { piece_idx: 3, offset: 2 * BLOCK_SIZE, len: 100 });

        piece.request(0, a);
        piece.request(0, b);
        piece.request(1, a);
        assert_eq!(piece.free_blocks().collect::<Vec<_>>(), vec![2]);

        // Released by one of two requesters, still requested.
        piece.release(0, a);
        assert_eq!(piece.state(0), BlockState::Requested);
        piece.release(1, a);
        assert_eq!(piece.state(1), BlockState::Free);

        assert_eq!(piece.receive(0), Some(vec![b]));
        assert_eq!(piece.receive(0), None);
        assert!(!piece.is_complete());
        assert_eq!(piece.receive(1), Some(vec![]));
        assert_eq!(piece.receive(2), Some(vec![]));
        assert!(piece.is_complete());
        assert!(!piece.has_free());
    }

    #[test]
    fn test_block_idx() {
        let piece = PartialPiece::new(0, BLOCK_SIZE + 100);
        assert_eq!(piece.block_idx(&BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: 100 }), Some(1));
        assert_eq!(piece.block_idx(&BlockInfo { piece_idx: 0, offset: BLOCK_SIZE, len: 99 }), None);
        assert_eq!(piece.block_idx(&BlockInfo { piece_idx: 0, offset: 10, len: 100 }), None);
        assert_eq!(piece.block_idx(&BlockInfo { piece_idx: 1, offset: 0, len: BLOCK_SIZE }), None);
        assert_eq!(piece.block_idx(&BlockInfo { piece_idx: 0, offset: 2 * BLOCK_SIZE, len: 1 }), None);
    }
}
