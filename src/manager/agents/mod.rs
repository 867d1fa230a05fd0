pub mod availability;
pub mod choke;
pub mod have_producer;
pub mod metadata;
pub mod peer_request;
pub mod piece;
pub mod request_producer;
