use std::fmt;

use thiserror::Error;

const WORD_BITS: usize = 64;

#[derive(Debug, Error, PartialEq)]
#[error("bitfield of {len} bytes does not fit {bits} bits")]
pub struct DecodeError {
    len: usize,
    bits: usize,
}

/// Growable set of bit positions backed by 64 bit words.
#[derive(Debug, Default)]
pub struct Bitmask {
    words: Vec<u64>,
    words_in_use: usize, // index of the highest nonzero word + 1
}

impl Clone for Bitmask {
    // trailing zero words are not carried over
    fn clone(&self) -> Self {
        Bitmask {
            words: self.words[..self.words_in_use].to_vec(),
            words_in_use: self.words_in_use,
        }
    }
}

impl PartialEq for Bitmask {
    fn eq(&self, other: &Self) -> bool {
        self.words[..self.words_in_use] == other.words[..other.words_in_use]
    }
}

impl Eq for Bitmask {}

impl Bitmask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bits: usize) -> Self {
        Bitmask {
            words: vec![0; bits.div_ceil(WORD_BITS)],
            words_in_use: 0,
        }
    }

    pub fn set(&mut self, i: usize) {
        let word = i / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (i % WORD_BITS);
        self.words_in_use = self.words_in_use.max(word + 1);
    }

    pub fn get(&self, i: usize) -> bool {
        let word = i / WORD_BITS;
        word < self.words_in_use && self.words[word] & (1u64 << (i % WORD_BITS)) != 0
    }

    #[cfg(test)]
    pub fn clear(&mut self, i: usize) {
        let word = i / WORD_BITS;
        if word >= self.words_in_use {
            return;
        }
        self.words[word] &= !(1u64 << (i % WORD_BITS));
        self.recalculate_words_in_use();
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
        self.words_in_use = 0;
    }

    pub fn cardinality(&self) -> usize {
        self.words[..self.words_in_use]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.words_in_use == 0
    }

    #[cfg(test)]
    pub fn or(&mut self, other: &Bitmask) {
        if other.words_in_use > self.words.len() {
            self.words.resize(other.words_in_use, 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words[..other.words_in_use]) {
            *w |= o;
        }
        self.words_in_use = self.words_in_use.max(other.words_in_use);
    }

    #[cfg(test)]
    pub fn and_not(&mut self, other: &Bitmask) {
        let common = self.words_in_use.min(other.words_in_use);
        for (w, o) in self.words[..common].iter_mut().zip(&other.words[..common]) {
            *w &= !o;
        }
        self.recalculate_words_in_use();
    }

    /// Count of bits set in `self` and not in `other`.
    pub fn and_not_cardinality(&self, other: &Bitmask) -> usize {
        self.words[..self.words_in_use]
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let o = if i < other.words_in_use { other.words[i] } else { 0 };
                (w & !o).count_ones() as usize
            })
            .sum()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words[..self.words_in_use]
            .iter()
            .enumerate()
            .flat_map(|(i, w)| {
                let w = *w;
                (0..WORD_BITS)
                    .filter(move |b| w & (1u64 << b) != 0)
                    .map(move |b| i * WORD_BITS + b)
            })
    }

    /// Packs the first `bits` positions one bit per position, most significant bit first,
    /// padded with zeroes to a byte boundary.
    pub fn encode(&self, bits: usize) -> Vec<u8> {
        let mut buf = vec![0u8; bits.div_ceil(8)];
        for i in self.iter_ones().take_while(|i| *i < bits) {
            buf[i / 8] |= 0b10000000 >> (i % 8);
        }
        buf
    }

    pub fn decode(buf: &[u8], bits: usize) -> Result<Self, DecodeError> {
        if buf.len() != bits.div_ceil(8) {
            return Err(DecodeError {
                len: buf.len(),
                bits,
            });
        }
        let mut bitmask = Bitmask::with_capacity(bits);
        for (i, byte) in buf.iter().enumerate() {
            let mut mask: u8 = 0b10000000;
            for j in 0..8 {
                if byte & mask != 0 {
                    if i * 8 + j >= bits {
                        // padding bits must be zero
                        return Err(DecodeError {
                            len: buf.len(),
                            bits,
                        });
                    }
                    bitmask.set(i * 8 + j);
                }
                mask >>= 1;
            }
        }
        Ok(bitmask)
    }

    #[cfg(test)]
    fn recalculate_words_in_use(&mut self) {
        self.words_in_use = self.words[..self.words_in_use]
            .iter()
            .rposition(|w| *w != 0)
            .map_or(0, |i| i + 1);
    }

    #[cfg(test)]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
}

impl fmt::Display for Bitmask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ones: Vec<String> = self.iter_ones().map(|i| i.to_string()).collect();
        write!(f, "{{{}}}", ones.join(", "))
    }
}
