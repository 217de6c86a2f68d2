use bitvec::{order::Msb0, vec::BitVec};

// Fixed size bit vector, one bit per piece, MSB first within each byte.
// Keeps a running count of set bits so that `count_ones` is free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {

    bits: BitVec<u8, Msb0>,

    ones: usize,

}

impl Bitfield {

    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
            ones: 0,
        }
    }

    pub fn full(len: usize) -> Self {
        // Fill through the slice so the spare bits of the last byte stay zero.
        let mut bits = BitVec::repeat(false, len);
        bits.fill(true);
        Self { bits, ones: len }
    }

    // Builds a bitfield from its wire form.
    // Returns None if the byte count does not match `len` or any spare trailing bit is set.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != (len + 7) / 8 {
            return None;
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        if bits[len..].any() {
            return None;
        }
        bits.truncate(len);
        let ones = bits.count_ones();
        Some(Self { bits, ones })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        self.bits.get(idx).map(|b| *b).unwrap_or(false)
    }

    // Returns true if the bit changed.
    pub fn set(&mut self, idx: usize, value: bool) -> bool {
        debug_assert!(idx < self.bits.len(), "bit index out of bounds");
        if self.get(idx) == value {
            return false;
        }
        self.bits.set(idx, value);
        if value {
            self.ones += 1;
        } else {
            self.ones -= 1;
        }
        true
    }

    #[inline]
    pub fn count_ones(&self) -> usize {
        self.ones
    }

    #[cfg(test)]
    pub fn count_zeros(&self) -> usize {
        self.bits.len() - self.ones
    }

    pub fn is_full(&self) -> bool {
        self.ones == self.bits.len()
    }

    pub fn none(&self) -> bool {
        self.ones == 0
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    // Raw bytes for the wire and resume file, spare bits are always zero.
    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}
