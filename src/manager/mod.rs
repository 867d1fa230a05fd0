pub mod agents;
pub mod assignments;
pub mod bandwidth_tracker;
pub mod connection;
pub mod metadata_exchange;
pub mod peer;
pub mod session;
pub mod worker;
