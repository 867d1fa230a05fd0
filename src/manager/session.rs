use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::Result;
use size::{Size, Style};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::Receiver,
    time::{interval, sleep, MissedTickBehavior},
};

use crate::{
    config::Config,
    data::piece_statistics::PieceStatistics,
    manager::{
        assignments::Assignments,
        bandwidth_tracker::{BandwidthTracker, TransferCounters},
        connection::Connection,
        metadata_exchange::MetadataExchange,
        peer,
        worker::Worker,
    },
    persistence::{
        data_storage::DataStorage,
        storage::{StorageError, StorageFactory},
        torrent::Torrent,
    },
    util::{force_string, pretty_info_hash},
};

// pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection of a transfer.
///
/// Locks are always taken in this order: connection state, storage, statistics, metadata,
/// assignments, announcements, connections.
pub struct Shared {
    pub config: Config,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub worker: Worker,
    pub assignments: Assignments,
    pub counters: TransferCounters,
    storage: Mutex<Option<DataStorage>>,
    statistics: Mutex<PieceStatistics>,
    metadata: Mutex<MetadataExchange>,
    announcements: Mutex<Vec<(u32, SocketAddr)>>, // verified pieces, and who delivered them
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    connecting: Mutex<HashSet<SocketAddr>>,
    storage_factory: StorageFactory,
    selected_files: Option<Vec<usize>>,
}

impl Shared {
    pub fn new(
        config: Config,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        storage_factory: StorageFactory,
        selected_files: Option<Vec<usize>>,
    ) -> Self {
        Shared {
            assignments: Assignments::new(config.max_pieces_per_assignment),
            config,
            info_hash,
            peer_id,
            worker: Worker::new(),
            counters: TransferCounters::default(),
            storage: Mutex::new(None),
            statistics: Mutex::new(PieceStatistics::new(0)),
            metadata: Mutex::new(MetadataExchange::new(info_hash)),
            announcements: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            storage_factory,
            selected_files,
        }
    }

    pub fn storage(&self) -> MutexGuard<'_, Option<DataStorage>> {
        self.storage
            .lock()
            .expect("another user panicked while holding the lock")
    }

    pub fn statistics(&self) -> MutexGuard<'_, PieceStatistics> {
        self.statistics
            .lock()
            .expect("another user panicked while holding the lock")
    }

    pub fn metadata(&self) -> MutexGuard<'_, MetadataExchange> {
        self.metadata
            .lock()
            .expect("another user panicked while holding the lock")
    }

    pub fn announcements(&self) -> MutexGuard<'_, Vec<(u32, SocketAddr)>> {
        self.announcements
            .lock()
            .expect("another user panicked while holding the lock")
    }

    fn connections_map(&self) -> MutexGuard<'_, HashMap<SocketAddr, Arc<Connection>>> {
        self.connections
            .lock()
            .expect("another user panicked while holding the lock")
    }

    fn connecting(&self) -> MutexGuard<'_, HashSet<SocketAddr>> {
        self.connecting
            .lock()
            .expect("another user panicked while holding the lock")
    }

    pub fn storage_ready(&self) -> bool {
        self.storage().is_some()
    }

    /// Sets up the piece store once the torrent is known. Later calls do nothing.
    pub fn initialize_storage(&self, torrent: Torrent, metadata: Vec<u8>) -> Result<(), StorageError> {
        let mut storage = self.storage();
        if storage.is_some() {
            return Ok(());
        }
        log::info!("torrent {}:\n{torrent}", pretty_info_hash(self.info_hash));
        let data_storage = DataStorage::initialize(
            torrent,
            metadata,
            (self.storage_factory)(self.info_hash),
            self.config.block_size,
            self.selected_files.as_deref(),
        )?;
        *self.statistics() = PieceStatistics::with_excluded(
            data_storage.bitfield().pieces_total(),
            data_storage.skipped(),
        );
        *self.metadata() = MetadataExchange::complete(self.info_hash);
        *storage = Some(data_storage);
        Ok(())
    }

    /// Makes a newly verified piece known to every other connection.
    pub fn announce(&self, piece: u32, from: SocketAddr) {
        self.announcements().push((piece, from));
        for connection in self.connections() {
            if !connection.is_closed() {
                connection.wake.notify_one();
            }
        }
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections_map().values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections_map().len()
    }

    pub fn is_known(&self, addr: &SocketAddr) -> bool {
        self.connecting().contains(addr) || self.connections_map().contains_key(addr)
    }

    pub fn start_connecting(&self, addr: SocketAddr) -> bool {
        self.connecting().insert(addr)
    }

    pub fn done_connecting(&self, addr: &SocketAddr) {
        self.connecting().remove(addr);
    }

    /// Fails when the address is already connected or there is no room left.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        let mut connections = self.connections_map();
        if connections.len() >= self.config.max_connections
            || connections.contains_key(&connection.addr)
        {
            return false;
        }
        log::debug!(
            "peer {}: connected, peer id {}",
            connection.addr,
            force_string(&connection.peer_id)
        );
        connections.insert(connection.addr, connection);
        true
    }

    /// Releases everything a connection holds. Only the first call has an effect.
    pub fn close_connection(&self, connection: &Connection) {
        if !connection.mark_closed() {
            return;
        }
        {
            let mut state = connection.state();
            let released = self.assignments.remove(&mut state);
            if !released.is_empty() {
                log::debug!("peer {}: released pieces {released:?}", connection.addr);
            }
            state.cancel_pending();
            state.peer_requests.clear();
        }
        self.statistics().remove_bitfield(&connection.addr);
        self.assignments.forget(&connection.addr);
        {
            let mut connections = self.connections_map();
            if connections
                .get(&connection.addr)
                .is_some_and(|c| std::ptr::eq(c.as_ref(), connection))
            {
                connections.remove(&connection.addr);
            }
        }
        connection.shutdown();
        log::debug!("peer {}: connection closed", connection.addr);
    }

    fn update_interest(&self) {
        let storage = self.storage();
        if let Some(storage) = storage.as_ref() {
            let statistics = self.statistics();
            self.assignments.update(storage.bitfield(), &statistics);
        }
    }

    fn purge_inactive(&self, now: Instant) {
        for connection in self.connections() {
            if connection.idle_for(now) > self.config.peer_inactivity_threshold {
                log::debug!("peer {}: inactive, closing", connection.addr);
                self.close_connection(&connection);
            }
        }
    }

    fn log_stats(&self, bandwidth: &mut BandwidthTracker) {
        bandwidth.update(Instant::now(), &self.counters);
        let connections = self.connections();
        let unchoked = connections
            .iter()
            .filter(|c| !c.state().peer_choking)
            .count();
        let progress = match self.storage().as_ref() {
            Some(storage) => format!(
                "pieces: {}/{}, left: {}",
                storage.bitfield().verified_count(),
                storage.bitfield().pieces_total(),
                Size::from_bytes(storage.bytes_left())
                    .format()
                    .with_style(Style::Abbreviated),
            ),
            None => {
                let (received, total) = self.metadata().blocks();
                format!(
                    "metadata blocks: {received}/{}",
                    total.map(|t| t.to_string()).unwrap_or("?".to_string())
                )
            }
        };
        log::info!(
            "{progress} | connected: {}, unchoked: {unchoked}, assigned: {}, claimed: {} | {bandwidth}",
            connections.len(),
            self.assignments.assignment_count(),
            self.assignments.claimed_count(),
        );
    }

    #[cfg(test)]
    pub fn with_storage(
        config: Config,
        metadata: Vec<u8>,
        storage: crate::persistence::storage::MemoryStorage,
    ) -> Self {
        use sha1::{Digest, Sha1};

        let info_hash: [u8; 20] = Sha1::digest(&metadata).into();
        let storage = Mutex::new(Some(storage));
        let shared = Shared::new(
            config,
            info_hash,
            crate::util::generate_peer_id(),
            Box::new(move |_: [u8; 20]| {
                let storage = storage.lock().unwrap().take().unwrap_or_default();
                Box::new(storage) as Box<dyn crate::persistence::storage::Storage>
            }),
            None,
        );
        let torrent = Torrent::from_metadata(&metadata).unwrap();
        shared.initialize_storage(torrent, metadata).unwrap();
        shared
    }
}

/// A transfer: accepts and dials peers, and runs the periodic sweeps.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(shared: Shared) -> Self {
        Session {
            shared: Arc::new(shared),
        }
    }

    #[cfg(test)]
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn connect(&self, addr: SocketAddr) {
        if self.shared.is_known(&addr) {
            log::trace!("peer {addr}: already known");
            return;
        }
        if self.shared.connection_count() >= self.shared.config.max_connections {
            log::trace!("peer {addr}: too many connections");
            return;
        }
        if !self.shared.start_connecting(addr) {
            return;
        }
        tokio::spawn(peer::connect(self.shared.clone(), addr));
    }

    async fn on_accept(&self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!("could not accept an incoming connection: {e}");
                sleep(ACCEPT_BACKOFF).await;
                return;
            }
        };
        if self.shared.connection_count() >= self.shared.config.max_connections {
            log::trace!("peer {addr}: refusing incoming connection, too many connections");
            return;
        }
        tokio::spawn(peer::accept(self.shared.clone(), stream, addr));
    }

    /// Accepts and dials peers forever; peer addresses come from `peers_rx`.
    pub async fn run(&self, listener: TcpListener, mut peers_rx: Receiver<SocketAddr>) -> Result<()> {
        log::info!(
            "session {} listening on {}",
            pretty_info_hash(self.shared.info_hash),
            listener.local_addr()?
        );
        let mut tick = interval(self.shared.config.update_assignments_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = interval(self.shared.config.stats_period);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut bandwidth = BandwidthTracker::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => self.on_accept(accepted).await,
                Some(addr) = peers_rx.recv() => self.connect(addr),
                _ = tick.tick() => {
                    self.shared.update_interest();
                    self.shared.purge_inactive(Instant::now());
                }
                _ = stats.tick() => self.shared.log_stats(&mut bandwidth),
            }
        }
    }
}
