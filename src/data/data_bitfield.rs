use crate::data::bitmask::{Bitmask, DecodeError};

/// Completion state of every piece of a transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBitfield {
    pieces_total: usize,
    verified: Bitmask,
    skipped: Option<Bitmask>,
}

impl DataBitfield {
    pub fn new(pieces_total: usize) -> Self {
        DataBitfield {
            pieces_total,
            verified: Bitmask::with_capacity(pieces_total),
            skipped: None,
        }
    }

    pub fn from_bitmask(pieces_total: usize, verified: Bitmask) -> Self {
        DataBitfield {
            pieces_total,
            verified,
            skipped: None,
        }
    }

    /// Decodes a packed bitfield as sent on the wire or persisted in a snapshot.
    pub fn decode(buf: &[u8], pieces_total: usize) -> Result<Self, DecodeError> {
        Ok(Self::from_bitmask(
            pieces_total,
            Bitmask::decode(buf, pieces_total)?,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.verified.encode(self.pieces_total)
    }

    pub fn pieces_total(&self) -> usize {
        self.pieces_total
    }

    pub fn verified(&self) -> &Bitmask {
        &self.verified
    }

    pub fn verified_count(&self) -> usize {
        self.verified.cardinality()
    }

    pub fn is_verified(&self, piece: usize) -> bool {
        self.verified.get(piece)
    }

    pub fn is_skipped(&self, piece: usize) -> bool {
        self.skipped.as_ref().is_some_and(|s| s.get(piece))
    }

    /// Pieces we still need: neither verified nor excluded by file selection.
    pub fn pieces_remaining(&self) -> usize {
        let skipped_not_verified = self
            .skipped
            .as_ref()
            .map_or(0, |s| s.and_not_cardinality(&self.verified));
        self.pieces_total - self.verified.cardinality() - skipped_not_verified
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_remaining() == 0
    }

    /// One-way: a verified piece never goes back to incomplete. Returns false if it was already verified.
    pub fn mark_verified(&mut self, piece: usize) -> bool {
        if piece >= self.pieces_total || self.verified.get(piece) {
            return false;
        }
        self.verified.set(piece);
        true
    }

    pub fn skip(&mut self, piece: usize) {
        if piece < self.pieces_total {
            self.skipped.get_or_insert_with(Bitmask::new).set(piece);
        }
    }

    /// Whether `self` has verified at least one piece that `other` is missing and does not skip.
    pub fn has_missing_for(&self, other: &DataBitfield) -> bool {
        self.verified
            .iter_ones()
            .any(|p| !other.is_verified(p) && !other.is_skipped(p))
    }
}
