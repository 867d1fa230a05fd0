pub mod bitmask;
pub mod block_set;
pub mod chunk;
pub mod data_bitfield;
pub mod piece_statistics;
