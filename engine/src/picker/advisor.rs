use rand::{seq::SliceRandom, Rng};
use crate::bitfield::Bitfield;

// Number of rarest pieces kept ready for recommendation.
const CACHE_SIZE: usize = 10;

// Tracks how many connected peers have each piece and recommends the next piece to download.
// Rarest pieces are preferred, ties and the order within the cache are random so peers
// of the same swarm do not all chase the same piece.
#[derive(Debug)]
pub struct PieceAdvisor {

    // Number of connected peers advertising each piece.
    refs: Vec<u32>,

    // Pieces being downloaded or waiting on the disk.
    dirty: Bitfield,

    // Least replicated candidates from the last scan.
    cache: Vec<usize>,

}

impl PieceAdvisor {

    pub fn new(num_pieces: usize) -> Self {
        Self {
            refs: vec![0; num_pieces],
            dirty: Bitfield::new(num_pieces),
            cache: Vec::with_capacity(CACHE_SIZE),
        }
    }

    pub fn reference(&mut self, idx: usize) {
        self.refs[idx] += 1;
    }

    pub fn unreference(&mut self, idx: usize) {
        debug_assert!(self.refs[idx] > 0, "unbalanced piece reference");
        self.refs[idx] = self.refs[idx].saturating_sub(1);
    }

    pub fn reference_bitfield(&mut self, bitfield: &Bitfield) {
        bitfield.iter_ones().for_each(|idx| self.reference(idx));
    }

    pub fn unreference_bitfield(&mut self, bitfield: &Bitfield) {
        bitfield.iter_ones().for_each(|idx| self.unreference(idx));
    }

    pub fn refs(&self, idx: usize) -> u32 {
        self.refs[idx]
    }

    pub fn mark_dirty(&mut self, idx: usize) {
        self.dirty.set(idx, true);
        self.cache.retain(|&i| i != idx);
    }

    pub fn mark_clean(&mut self, idx: usize) {
        self.dirty.set(idx, false);
    }

    pub fn is_dirty(&self, idx: usize) -> bool {
        self.dirty.get(idx)
    }

    // Next piece to download, or None if no scheduled piece is on offer from any peer.
    // The caller marks the returned piece dirty.
    pub fn recommend(&mut self, scheduled: &Bitfield) -> Option<usize> {
        let mut rng = rand::thread_rng();
        loop {
            if self.cache.is_empty() {
                self.rebuild(scheduled);
                if self.cache.is_empty() {
                    return None;
                }
            }

            // Cached entries may have gone stale since the scan.
            let idx = self.cache.swap_remove(rng.gen_range(0..self.cache.len()));
            if self.is_candidate(idx, scheduled) {
                return Some(idx);
            }
        }
    }

    fn is_candidate(&self, idx: usize, scheduled: &Bitfield) -> bool {
        scheduled.get(idx) && !self.dirty.get(idx) && self.refs[idx] > 0
    }

    fn rebuild(&mut self, scheduled: &Bitfield) {
        let mut candidates = scheduled
            .iter_ones()
            .filter(|&idx| self.is_candidate(idx, scheduled))
            .collect::<Vec<_>>();
        // Shuffle first, the stable sort then keeps equally rare pieces in random order.
        candidates.shuffle(&mut rand::thread_rng());
        candidates.sort_by_key(|&idx| self.refs[idx]);
        candidates.truncate(CACHE_SIZE);
        self.cache = candidates;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_rarest() {
        let mut advisor = PieceAdvisor::new(20);
        let scheduled = Bitfield::full(20);
        // Pieces 10 to 19 are held by three peers, the rest by one.
        advisor.reference_bitfield(&Bitfield::full(20));
        for idx in 10..20 {
            advisor.reference(idx);
            advisor.reference(idx);
        }

        let mut first = (0..10)
            .map(|_| {
                let idx = advisor.recommend(&scheduled).unwrap();
                advisor.mark_dirty(idx);
                idx
            })
            .collect::<Vec<_>>();
        first.sort();
        assert_eq!(first, (0..10).collect::<Vec<_>>());
        assert!(advisor.recommend(&scheduled).unwrap() >= 10);
    }

    #[test]
    fn test_never_recommends_unreferenced_or_dirty() {
        let mut advisor = PieceAdvisor::new(30);
        let scheduled = Bitfield::full(30);
        for idx in (0..30).filter(|i| i % 3 != 0) {
            advisor.reference(idx);
        }

        let mut seen = Vec::new();
        while let Some(idx) = advisor.recommend(&scheduled) {
            assert!(advisor.refs(idx) > 0, "piece {} has no references", idx);
            assert!(!advisor.is_dirty(idx), "piece {} is dirty", idx);
            advisor.mark_dirty(idx);
            seen.push(idx);
        }
        seen.sort();
        assert_eq!(seen, (0..30).filter(|i| i % 3 != 0).collect::<Vec<_>>());
    }

    #[test]
    fn test_skips_stale_cache_entries() {
        let mut advisor = PieceAdvisor::new(4);
        let mut scheduled = Bitfield::full(4);
        advisor.reference_bitfield(&Bitfield::full(4));

        let first = advisor.recommend(&scheduled).unwrap();
        advisor.mark_dirty(first);
        // Everything else drops out of the swarm or becomes available.
        for idx in (0..4).filter(|&i| i != first) {
            if idx % 2 == 0 {
                advisor.unreference(idx);
            } else {
                scheduled.set(idx, false);
            }
        }
        assert_eq!(advisor.recommend(&scheduled), None);

        advisor.mark_clean(first);
        assert_eq!(advisor.recommend(&scheduled), Some(first));
    }
}
