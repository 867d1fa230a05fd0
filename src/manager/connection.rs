use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use tokio::sync::{watch, Notify};

use crate::{
    manager::assignments::Assignment,
    torrent_protocol::{
        extension::{ExtensionTable, UT_METADATA},
        wire_protocol::{BlockRequest, Message},
    },
};

/// Everything a connection knows about its peer and about what it is exchanging with it.
/// Owned by the connection tasks, never locked together with another connection state.
#[derive(Debug)]
pub struct ConnectionState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub last_choke_transition: Option<Instant>,
    pub last_interest_update: Option<Instant>,

    pub pending: HashMap<u64, BlockRequest>, // requests sent and not yet answered
    request_queue: VecDeque<BlockRequest>,
    queued: HashSet<u64>,

    urgent: VecDeque<Message>,
    normal: VecDeque<Message>,
    cancelled: HashMap<u64, Instant>, // peer cancels, checked before sending a piece
    pub peer_requests: VecDeque<BlockRequest>,

    pub assignment: Option<Assignment>,

    pub remote_extensions: Arc<ExtensionTable>,
    pub remote_metadata_size: Option<usize>,

    // availability received before the torrent is known
    pub early_bitfield: Option<Vec<u8>>,
    pub early_haves: Vec<u32>,

    pub initial_announced: bool,
    pub have_cursor: usize, // position in the session announcements

    pub metadata_requested: HashMap<u32, Instant>,
    pub metadata_rejected_at: Option<Instant>,
    pub metadata_generation: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        ConnectionState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            last_choke_transition: None,
            last_interest_update: None,
            pending: HashMap::new(),
            request_queue: VecDeque::new(),
            queued: HashSet::new(),
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            cancelled: HashMap::new(),
            peer_requests: VecDeque::new(),
            assignment: None,
            remote_extensions: Arc::new(ExtensionTable::default()),
            remote_metadata_size: None,
            early_bitfield: None,
            early_haves: Vec::new(),
            initial_announced: false,
            have_cursor: 0,
            metadata_requested: HashMap::new(),
            metadata_rejected_at: None,
            metadata_generation: 0,
        }
    }

    pub fn supports_metadata(&self) -> bool {
        self.remote_extensions.get(UT_METADATA).is_some()
    }

    /// Queues an outbound message. Choke, unchoke and cancel jump ahead of everything else.
    pub fn post(&mut self, message: Message) {
        if message.is_urgent() {
            self.urgent.push_back(message);
        } else {
            self.normal.push_back(message);
        }
    }

    #[cfg(test)]
    pub fn has_outbound(&self) -> bool {
        !self.urgent.is_empty() || !self.normal.is_empty()
    }

    /// Next message to put on the wire; pieces cancelled by the peer in the meantime are dropped.
    pub fn next_outbound(&mut self) -> Option<Message> {
        if let Some(message) = self.urgent.pop_front() {
            return Some(message);
        }
        while let Some(message) = self.normal.pop_front() {
            if let Message::Piece(piece_idx, begin, _) = &message {
                let key = BlockRequest::new(*piece_idx, *begin, 0).key();
                if self.cancelled.remove(&key).is_some() {
                    log::trace!("dropping cancelled block {piece_idx}/{begin}");
                    continue;
                }
            }
            return Some(message);
        }
        None
    }

    pub fn drain_outbound(&mut self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.urgent.len() + self.normal.len());
        while let Some(message) = self.next_outbound() {
            messages.push(message);
        }
        messages
    }

    /// Handles a peer cancel: a request not served yet is forgotten, otherwise the reply is dropped when sent.
    pub fn record_cancel(&mut self, request: &BlockRequest, now: Instant) {
        let key = request.key();
        let before = self.peer_requests.len();
        self.peer_requests.retain(|r| r.key() != key);
        if self.peer_requests.len() != before {
            return;
        }
        let queued = self.normal.iter().any(|m| {
            matches!(m, Message::Piece(piece_idx, begin, _)
                if BlockRequest::new(*piece_idx, *begin, 0).key() == key)
        });
        if queued {
            self.cancelled.insert(key, now);
        }
    }

    /// Queues a block request from the peer, undoing an earlier cancel of the same block.
    pub fn accept_peer_request(&mut self, request: BlockRequest) {
        self.cancelled.remove(&request.key());
        if !self.peer_requests.iter().any(|r| r.key() == request.key()) {
            self.peer_requests.push_back(request);
        }
    }

    #[cfg(test)]
    pub fn is_cancelled(&self, key: u64) -> bool {
        self.cancelled.contains_key(&key)
    }

    pub fn expire_cancellations(&mut self, now: Instant, retention: Duration) {
        self.cancelled
            .retain(|_, at| now.saturating_duration_since(*at) <= retention);
    }

    /// Cancels every request in flight and forgets the queued ones.
    pub fn cancel_pending(&mut self) {
        let mut pending: Vec<BlockRequest> = self.pending.drain().map(|(_, r)| r).collect();
        pending.sort_by_key(BlockRequest::key);
        for request in pending {
            self.post(Message::Cancel(request));
        }
        self.request_queue.clear();
        self.queued.clear();
    }

    /// Cancels what is in flight or queued for a single piece.
    pub fn cancel_piece(&mut self, piece: u32) {
        let mut keys: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, r)| r.piece_idx == piece)
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        for key in keys {
            if let Some(request) = self.pending.remove(&key) {
                self.post(Message::Cancel(request));
            }
        }
        self.request_queue.retain(|r| r.piece_idx != piece);
        self.queued.retain(|k| (k >> 32) as u32 != piece);
    }

    pub fn queue_request(&mut self, request: BlockRequest) -> bool {
        let key = request.key();
        if self.pending.contains_key(&key) || !self.queued.insert(key) {
            return false;
        }
        self.request_queue.push_back(request);
        true
    }

    pub fn pop_request(&mut self) -> Option<BlockRequest> {
        let request = self.request_queue.pop_front()?;
        self.queued.remove(&request.key());
        Some(request)
    }

    #[cfg(test)]
    pub fn queued_requests(&self) -> usize {
        self.request_queue.len()
    }

    /// Whether a block is either in flight or waiting to be requested.
    pub fn is_requested(&self, key: u64) -> bool {
        self.pending.contains_key(&key) || self.queued.contains(&key)
    }
}

/// A registered peer connection.
pub struct Connection {
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],
    state: Mutex<ConnectionState>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    pub wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    pub fn new(addr: SocketAddr, peer_id: [u8; 20]) -> Self {
        let (shutdown, _) = watch::channel(false);
        Connection {
            addr,
            peer_id,
            state: Mutex::new(ConnectionState::new()),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state
            .lock()
            .expect("another user panicked while holding the lock")
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("another user panicked while holding the lock") = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(
            *self
                .last_activity
                .lock()
                .expect("another user panicked while holding the lock"),
        )
    }

    /// Returns true for the caller that actually closed the connection.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Stops the reader and writer tasks.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        time::{Duration, Instant},
    };

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn urgent_messages_go_first() {
        let mut state = ConnectionState::new();
        state.post(Message::Have(1));
        state.post(Message::Request(BlockRequest::new(0, 0, 16)));
        state.post(Message::Choke);
        state.post(Message::Cancel(BlockRequest::new(0, 0, 16)));

        assert_eq!(
            state.drain_outbound(),
            vec![
                Message::Choke,
                Message::Cancel(BlockRequest::new(0, 0, 16)),
                Message::Have(1),
                Message::Request(BlockRequest::new(0, 0, 16)),
            ]
        );
        assert!(!state.has_outbound());
    }

    #[test]
    fn cancelled_pieces_are_not_sent() {
        let now = Instant::now();
        let mut state = ConnectionState::new();
        state.post(Message::Piece(1, 0, vec![1; 4]));
        state.post(Message::Piece(1, 16, vec![2; 4]));
        state.record_cancel(&BlockRequest::new(1, 0, 4), now);
        assert!(state.is_cancelled(BlockRequest::new(1, 0, 4).key()));

        assert_matches!(state.next_outbound(), Some(Message::Piece(1, 16, _)));
        assert_matches!(state.next_outbound(), None);
        // the cancellation is consumed by the dropped piece
        assert!(!state.is_cancelled(BlockRequest::new(1, 0, 4).key()));
    }

    #[test]
    fn cancel_of_unserved_request_removes_it() {
        let now = Instant::now();
        let mut state = ConnectionState::new();
        state.peer_requests.push_back(BlockRequest::new(2, 0, 16));
        state.peer_requests.push_back(BlockRequest::new(2, 16, 16));
        state.record_cancel(&BlockRequest::new(2, 0, 16), now);
        assert_eq!(state.peer_requests.len(), 1);
        assert!(!state.is_cancelled(BlockRequest::new(2, 0, 16).key()));
    }

    #[test]
    fn cancel_without_queued_piece_is_ignored() {
        let now = Instant::now();
        let mut state = ConnectionState::new();
        // the piece already went out, then the peer cancels and asks again
        state.record_cancel(&BlockRequest::new(3, 0, 16384), now);
        assert!(!state.is_cancelled(BlockRequest::new(3, 0, 16384).key()));
        state.post(Message::Piece(3, 0, vec![7; 4]));
        assert_matches!(state.next_outbound(), Some(Message::Piece(3, 0, _)));
    }

    #[test]
    fn new_request_clears_the_cancellation() {
        let now = Instant::now();
        let mut state = ConnectionState::new();
        state.post(Message::Piece(3, 0, vec![7; 4]));
        state.record_cancel(&BlockRequest::new(3, 0, 16384), now);
        assert!(state.is_cancelled(BlockRequest::new(3, 0, 16384).key()));

        state.accept_peer_request(BlockRequest::new(3, 0, 16384));
        assert!(!state.is_cancelled(BlockRequest::new(3, 0, 16384).key()));
        assert_eq!(state.peer_requests.len(), 1);
        state.accept_peer_request(BlockRequest::new(3, 0, 16384));
        assert_eq!(state.peer_requests.len(), 1);
        assert_matches!(state.next_outbound(), Some(Message::Piece(3, 0, _)));
    }

    #[test]
    fn cancellations_expire() {
        let now = Instant::now();
        let mut state = ConnectionState::new();
        state.post(Message::Piece(0, 0, vec![1; 16]));
        state.record_cancel(&BlockRequest::new(0, 0, 16), now);
        state.expire_cancellations(now + Duration::from_secs(60), Duration::from_secs(120));
        assert!(state.is_cancelled(0));
        state.expire_cancellations(now + Duration::from_secs(121), Duration::from_secs(120));
        assert!(!state.is_cancelled(0));
    }

    #[test]
    fn request_queue_skips_duplicates() {
        let mut state = ConnectionState::new();
        assert!(state.queue_request(BlockRequest::new(0, 0, 16)));
        assert!(!state.queue_request(BlockRequest::new(0, 0, 16)));
        assert!(state.queue_request(BlockRequest::new(0, 16, 16)));
        assert_eq!(state.queued_requests(), 2);

        let request = state.pop_request().unwrap();
        state.pending.insert(request.key(), request);
        assert!(state.is_requested(request.key()));
        assert!(!state.queue_request(request));
    }

    #[test]
    fn cancel_pending_clears_everything() {
        let mut state = ConnectionState::new();
        for begin in [32, 0, 16] {
            let request = BlockRequest::new(3, begin, 16);
            state.pending.insert(request.key(), request);
        }
        state.queue_request(BlockRequest::new(4, 0, 16));

        state.cancel_pending();
        assert!(state.pending.is_empty());
        assert_eq!(state.queued_requests(), 0);
        assert_eq!(
            state.drain_outbound(),
            [0, 16, 32]
                .iter()
                .map(|b| Message::Cancel(BlockRequest::new(3, *b, 16)))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn cancel_single_piece() {
        let mut state = ConnectionState::new();
        let a = BlockRequest::new(1, 0, 16);
        let b = BlockRequest::new(2, 0, 16);
        state.pending.insert(a.key(), a);
        state.pending.insert(b.key(), b);
        state.queue_request(BlockRequest::new(1, 16, 16));

        state.cancel_piece(1);
        assert_eq!(state.pending.len(), 1);
        assert_eq!(state.queued_requests(), 0);
        assert_eq!(state.drain_outbound(), vec![Message::Cancel(a)]);
    }

    #[test]
    fn close_once() {
        let connection = Connection::new(SocketAddr::from(([127, 0, 0, 1], 1)), [0; 20]);
        let shutdown = connection.subscribe_shutdown();
        assert!(!connection.is_closed());
        assert!(connection.mark_closed());
        assert!(!connection.mark_closed());
        assert!(connection.is_closed());
        assert!(!*shutdown.borrow());
        connection.shutdown();
        assert!(*shutdown.borrow());
    }
}
