use std::time::Duration;

pub const BLOCK_SIZE: u32 = 16384;

// largest block a peer may ask us for
pub const MAX_SERVED_BLOCK_SIZE: u32 = 131072;

/// Session tunables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub block_size: u32,
    pub max_connections: usize,
    /// Minimum time between two choke state transitions on the same connection.
    pub choking_threshold: Duration,
    /// Minimum time between two interest recomputations.
    pub update_assignments_interval: Duration,
    pub max_outstanding_requests: usize,
    pub max_pieces_per_assignment: usize,
    /// An assignment with no block received for this long is released.
    pub max_piece_receiving_time: Duration,
    pub first_block_arrival_timeout: Duration,
    pub wait_before_rerequesting_after_reject: Duration,
    pub peer_inactivity_threshold: Duration,
    pub connect_timeout: Duration,
    pub keep_alive_period: Duration,
    pub cancellation_retention: Duration,
    pub produce_period: Duration,
    pub stats_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_port: 8000,
            block_size: BLOCK_SIZE,
            max_connections: 200,
            choking_threshold: Duration::from_secs(10),
            update_assignments_interval: Duration::from_secs(1),
            max_outstanding_requests: 128,
            max_pieces_per_assignment: 3,
            max_piece_receiving_time: Duration::from_secs(30),
            first_block_arrival_timeout: Duration::from_secs(10),
            wait_before_rerequesting_after_reject: Duration::from_secs(10),
            peer_inactivity_threshold: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(10),
            keep_alive_period: Duration::from_secs(90),
            cancellation_retention: Duration::from_secs(120),
            produce_period: Duration::from_millis(100),
            stats_period: Duration::from_secs(5),
        }
    }
}
