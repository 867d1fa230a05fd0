use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::{
    data::{data_bitfield::DataBitfield, piece_statistics::PieceStatistics},
    manager::connection::ConnectionState,
    persistence::data_storage::DataStorage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentStatus {
    Active,
    Timeout,
}

/// Pieces a single connection is downloading.
#[derive(Debug)]
pub struct Assignment {
    pieces: VecDeque<u32>,
    started: Instant,
    last_progress: Instant,
}

impl Assignment {
    pub fn new(now: Instant) -> Self {
        Assignment {
            pieces: VecDeque::new(),
            started: now,
            last_progress: now,
        }
    }

    pub fn pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.pieces.iter().copied()
    }

    pub fn contains(&self, piece: u32) -> bool {
        self.pieces.contains(&piece)
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    fn push(&mut self, piece: u32) {
        self.pieces.push_back(piece);
    }

    fn remove(&mut self, piece: u32) -> bool {
        match self.pieces.iter().position(|p| *p == piece) {
            Some(i) => {
                self.pieces.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn progress(&mut self, now: Instant) {
        self.last_progress = now;
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn status(&self, now: Instant, timeout: Duration) -> AssignmentStatus {
        if now.saturating_duration_since(self.last_progress) > timeout {
            AssignmentStatus::Timeout
        } else {
            AssignmentStatus::Active
        }
    }
}

#[derive(Debug, Default)]
struct Claims {
    claimed: HashMap<u32, usize>, // piece -> number of assignments holding it
    assignment_count: usize,
    interesting: HashSet<SocketAddr>,
}

impl Claims {
    fn is_endgame(&self, own: &DataBitfield) -> bool {
        own.pieces_remaining() <= self.claimed.len()
    }

    fn claim(&mut self, piece: u32, own: &DataBitfield) -> bool {
        if own.is_verified(piece as usize) {
            return false;
        }
        if self.claimed.contains_key(&piece) && !self.is_endgame(own) {
            return false;
        }
        *self.claimed.entry(piece).or_insert(0) += 1;
        true
    }

    fn finish(&mut self, piece: u32) {
        if let Some(count) = self.claimed.get_mut(&piece) {
            *count -= 1;
            if *count == 0 {
                self.claimed.remove(&piece);
            }
        }
    }
}

/// Global piece claims shared by every connection.
///
/// `own` bitfields passed in come from the storage, whose lock the caller holds, so checking
/// completion and claiming happen atomically with respect to pieces being verified.
#[derive(Debug)]
pub struct Assignments {
    claims: Mutex<Claims>,
    max_pieces: usize,
}

impl Assignments {
    pub fn new(max_pieces: usize) -> Self {
        Assignments {
            claims: Mutex::new(Claims::default()),
            max_pieces,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Claims> {
        self.claims
            .lock()
            .expect("another user panicked while holding the lock")
    }

    /// Fails if the piece is verified, or already claimed outside of endgame.
    #[cfg(test)]
    pub fn claim(&self, piece: u32, own: &DataBitfield) -> bool {
        self.lock().claim(piece, own)
    }

    pub fn finish(&self, piece: u32) {
        self.lock().finish(piece)
    }

    #[cfg(test)]
    pub fn is_endgame(&self, own: &DataBitfield) -> bool {
        self.lock().is_endgame(own)
    }

    pub fn claimed_count(&self) -> usize {
        self.lock().claimed.len()
    }

    pub fn assignment_count(&self) -> usize {
        self.lock().assignment_count
    }

    /// Creates or tops up the assignment of a connection that is not choking us.
    /// Returns whether the connection ends up with something to download.
    pub fn assign(
        &self,
        addr: &SocketAddr,
        state: &mut ConnectionState,
        storage: &DataStorage,
        statistics: &PieceStatistics,
        now: Instant,
    ) -> bool {
        if state.peer_choking {
            return false;
        }
        let own = storage.bitfield();
        let Some(peer) = statistics.bitfield(addr) else {
            return false;
        };
        let current = state.assignment.as_ref().map_or(0, Assignment::len);
        if current >= self.max_pieces {
            return true;
        }

        let mut candidates: Vec<u32> = storage
            .next_pieces(statistics)
            .into_iter()
            .filter(|p| peer.is_verified(*p as usize))
            .filter(|p| !state.assignment.as_ref().is_some_and(|a| a.contains(*p)))
            .collect();

        let mut claims = self.lock();
        if candidates.is_empty() {
            if current == 0 && state.assignment.take().is_some() {
                claims.assignment_count -= 1;
            }
            return current > 0;
        }
        if claims.is_endgame(own) {
            candidates.shuffle(&mut rand::rng());
        }

        let assignment = state.assignment.get_or_insert_with(|| {
            claims.assignment_count += 1;
            Assignment::new(now)
        });
        for piece in candidates {
            if assignment.len() >= self.max_pieces {
                break;
            }
            if claims.claim(piece, own) {
                log::trace!("peer {addr}: piece {piece} assigned");
                assignment.push(piece);
            }
        }
        if assignment.is_empty() {
            state.assignment = None;
            claims.assignment_count -= 1;
            return false;
        }
        true
    }

    /// Takes a finished piece out of a connection assignment and releases its claim.
    pub fn complete(&self, state: &mut ConnectionState, piece: u32) {
        if let Some(assignment) = state.assignment.as_mut() {
            if assignment.remove(piece) {
                self.finish(piece);
            }
        }
    }

    /// Releases the whole assignment of a connection, returning the pieces it held.
    pub fn remove(&self, state: &mut ConnectionState) -> Vec<u32> {
        let Some(assignment) = state.assignment.take() else {
            return Vec::new();
        };
        let mut claims = self.lock();
        claims.assignment_count -= 1;
        for piece in assignment.pieces() {
            claims.finish(piece);
        }
        assignment.pieces.into()
    }

    /// Recomputes which connections have pieces we are missing.
    pub fn update(&self, own: &DataBitfield, statistics: &PieceStatistics) {
        let interesting: HashSet<SocketAddr> = statistics
            .addrs()
            .filter(|addr| statistics.has_missing(addr, own))
            .copied()
            .collect();
        self.lock().interesting = interesting;
    }

    pub fn is_interesting(&self, addr: &SocketAddr) -> bool {
        self.lock().interesting.contains(addr)
    }

    pub fn forget(&self, addr: &SocketAddr) {
        self.lock().interesting.remove(addr);
    }
}
