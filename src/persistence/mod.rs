pub mod data_storage;
pub mod storage;
pub mod torrent;
