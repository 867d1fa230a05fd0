use std::{collections::HashMap, net::SocketAddr};

use rand::seq::SliceRandom;

use crate::data::{bitmask::Bitmask, data_bitfield::DataBitfield};

/// Per piece availability across the connected peers.
#[derive(Debug)]
pub struct PieceStatistics {
    counts: Vec<u32>,
    bitfields: HashMap<SocketAddr, DataBitfield>,
    excluded: Bitmask, // pieces we skip, never counted
}

impl PieceStatistics {
    pub fn new(pieces_total: usize) -> Self {
        Self::with_excluded(pieces_total, Bitmask::new())
    }

    pub fn with_excluded(pieces_total: usize, excluded: Bitmask) -> Self {
        PieceStatistics {
            counts: vec![0; pieces_total],
            bitfields: HashMap::new(),
            excluded,
        }
    }

    pub fn pieces_total(&self) -> usize {
        self.counts.len()
    }

    pub fn count(&self, piece: usize) -> u32 {
        self.counts.get(piece).copied().unwrap_or(0)
    }

    pub fn bitfield(&self, addr: &SocketAddr) -> Option<&DataBitfield> {
        self.bitfields.get(addr)
    }

    pub fn peers(&self) -> usize {
        self.bitfields.len()
    }

    pub fn addrs(&self) -> impl Iterator<Item = &SocketAddr> {
        self.bitfields.keys()
    }

    /// Tracks the availability announced by `addr`, replacing anything it announced before.
    pub fn add_bitfield(&mut self, addr: SocketAddr, bitfield: DataBitfield) {
        self.remove_bitfield(&addr);
        for piece in bitfield.verified().iter_ones() {
            self.increment(piece);
        }
        self.bitfields.insert(addr, bitfield);
    }

    /// Returns false if the piece index is out of range.
    pub fn add_piece(&mut self, addr: SocketAddr, piece: usize) -> bool {
        if piece >= self.counts.len() {
            return false;
        }
        let pieces_total = self.counts.len();
        let bitfield = self
            .bitfields
            .entry(addr)
            .or_insert_with(|| DataBitfield::new(pieces_total));
        if bitfield.mark_verified(piece) {
            self.increment(piece);
        }
        true
    }

    pub fn remove_bitfield(&mut self, addr: &SocketAddr) {
        if let Some(bitfield) = self.bitfields.remove(addr) {
            for piece in bitfield.verified().iter_ones() {
                if !self.excluded.get(piece) {
                    self.counts[piece] -= 1;
                }
            }
        }
    }

    /// Available pieces ordered by ascending popularity, in random order among equally popular ones.
    pub fn rarest_first(&self) -> Vec<u32> {
        let mut pieces: Vec<(u32, u32)> = self
            .counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(piece, count)| (piece as u32, *count))
            .collect();
        pieces.shuffle(&mut rand::rng());
        pieces.sort_by_key(|(_, count)| *count); // stable, keeps the shuffle within a bucket
        pieces.into_iter().map(|(piece, _)| piece).collect()
    }

    /// Whether `addr` announced a piece we miss.
    pub fn has_missing(&self, addr: &SocketAddr, own: &DataBitfield) -> bool {
        self.bitfields
            .get(addr)
            .is_some_and(|b| b.has_missing_for(own))
    }

    fn increment(&mut self, piece: usize) {
        if piece < self.counts.len() && !self.excluded.get(piece) {
            self.counts[piece] += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, net::SocketAddr};

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn bitfield(total: usize, pieces: &[usize]) -> DataBitfield {
        let mut b = DataBitfield::new(total);
        pieces.iter().for_each(|p| {
            b.mark_verified(*p);
        });
        b
    }

    #[test]
    fn counts_follow_bitfields() {
        let mut stats = PieceStatistics::new(4);
        stats.add_bitfield(addr(1), bitfield(4, &[0, 1]));
        stats.add_bitfield(addr(2), bitfield(4, &[1]));
        assert_eq!((0..4).map(|p| stats.count(p)).collect::<Vec<_>>(), vec![1, 2, 0, 0]);

        assert!(stats.add_piece(addr(2), 3));
        assert!(stats.add_piece(addr(2), 3)); // repeated have is counted once
        assert!(!stats.add_piece(addr(2), 4));
        assert_eq!(stats.count(3), 1);

        // a new bitfield for the same peer replaces the old one
        stats.add_bitfield(addr(1), bitfield(4, &[2]));
        assert_eq!((0..4).map(|p| stats.count(p)).collect::<Vec<_>>(), vec![0, 1, 1, 1]);

        stats.remove_bitfield(&addr(1));
        stats.remove_bitfield(&addr(2));
        stats.remove_bitfield(&addr(2));
        assert_eq!((0..4).map(|p| stats.count(p)).collect::<Vec<_>>(), vec![0, 0, 0, 0]);
        assert_eq!(stats.peers(), 0);
    }

    #[test]
    fn have_without_bitfield() {
        let mut stats = PieceStatistics::new(4);
        stats.add_piece(addr(1), 2);
        assert_eq!(stats.count(2), 1);
        assert!(stats.bitfield(&addr(1)).unwrap().is_verified(2));
    }

    #[test]
    fn rarest_first_groups_by_count() {
        let mut stats = PieceStatistics::new(6);
        stats.add_bitfield(addr(1), bitfield(6, &[0, 1, 2, 3, 4]));
        stats.add_bitfield(addr(2), bitfield(6, &[0, 1, 2]));
        stats.add_bitfield(addr(3), bitfield(6, &[0]));

        let order = stats.rarest_first();
        assert_eq!(order.len(), 5); // piece 5 is not available anywhere
        assert_eq!(
            order[..2].iter().copied().collect::<HashSet<_>>(),
            HashSet::from([3, 4])
        );
        assert_eq!(
            order[2..4].iter().copied().collect::<HashSet<_>>(),
            HashSet::from([1, 2])
        );
        assert_eq!(order[4], 0);
    }

    #[test]
    fn rarest_first_randomizes_ties() {
        let mut stats = PieceStatistics::new(32);
        stats.add_bitfield(addr(1), bitfield(32, &(0..32).collect::<Vec<_>>()));
        let orders: HashSet<Vec<u32>> = (0..20).map(|_| stats.rarest_first()).collect();
        assert!(orders.len() > 1);
    }

    #[test]
    fn excluded_pieces_are_not_counted() {
        let mut excluded = Bitmask::new();
        excluded.set(1);
        let mut stats = PieceStatistics::with_excluded(3, excluded);
        stats.add_bitfield(addr(1), bitfield(3, &[0, 1, 2]));
        assert_eq!(stats.count(1), 0);
        assert_eq!(stats.rarest_first().len(), 2);
        stats.remove_bitfield(&addr(1));
        assert_eq!(stats.count(0), 0);
    }

    #[test]
    fn missing_pieces() {
        let mut stats = PieceStatistics::new(3);
        stats.add_bitfield(addr(1), bitfield(3, &[1]));
        let mut own = DataBitfield::new(3);
        assert!(stats.has_missing(&addr(1), &own));
        own.mark_verified(1);
        assert!(!stats.has_missing(&addr(1), &own));
        assert!(!stats.has_missing(&addr(2), &own));
    }
}
