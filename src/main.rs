use anyhow::Result;
use clap::{CommandFactory, Parser};
use rlimit::{getrlimit, setrlimit, Resource};
use std::cmp::min;
use std::path::PathBuf;
use std::process::exit;
use std::{fmt, fs};
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::mpsc;

use config::Config;
use manager::session::{Session, Shared};
use persistence::storage::{DirectoryStorage, Storage, StorageFactory};
use persistence::torrent::Torrent;

mod bencoding;
mod config;
mod data;
mod manager;
mod persistence;
mod torrent_protocol;
mod util;

#[derive(Parser, Debug)]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")"), about, long_about = None)]
struct Args {
    /// Path to the .torrent file (either this or an info hash must be provided)
    #[arg(short, long, env)]
    torrent_file: Option<String>,

    /// Hex encoded info hash, the metadata is then fetched from peers
    #[arg(short, long, env)]
    info_hash: Option<String>,

    /// Optional base path where pieces are stored (directory will be created if it does not exist)
    #[arg(short, long, env, default_value = ".")]
    base_path: PathBuf,

    /// Optional listening port
    #[arg(short, long, env, default_value_t = 8000)]
    port: u16,

    /// Peer to connect to, as host:port (can be repeated)
    #[arg(long = "peer", env = "PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Index of a file to download, every file when omitted (can be repeated)
    #[arg(short, long = "select-file")]
    select_files: Vec<usize>,

    /// Optional log level
    #[arg(short, long, env, default_value_t = LogLevels::Info)]
    log_level: LogLevels,
}

#[derive(clap::ValueEnum, Debug, Clone)]
enum LogLevels {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_lowercase())
    }
}

const MAX_OPENED_FILES: u64 = 16384;

// peer addresses waiting for the session to dial them
const PEER_QUEUE_SIZE: usize = 64;

fn bump_file_limit() {
    match getrlimit(Resource::NOFILE) {
        Ok((soft_limit, hard_limit)) if soft_limit < MAX_OPENED_FILES => {
            if let Err(e) = setrlimit(
                Resource::NOFILE,
                min(hard_limit, MAX_OPENED_FILES),
                hard_limit,
            ) {
                log::warn!("could not increase NOFILE ulimit: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => log::warn!("could not read current NOFILE ulimit: {e}"),
    }
}

// (torrent and raw info dictionary when known, info hash)
fn load_torrent(args: &Args) -> Result<(Option<(Torrent, Vec<u8>)>, [u8; 20])> {
    if let Some(torrent_file) = &args.torrent_file {
        let contents = fs::read(torrent_file)?;
        let (torrent, info_hash, metadata) = Torrent::from_torrent_file(&contents)?;
        if let Some(index) = args.select_files.iter().find(|i| **i >= torrent.files.len()) {
            log::warn!(
                "selected file {index} does not exist, the torrent has {} files",
                torrent.files.len()
            );
        }
        return Ok((Some((torrent, metadata)), info_hash));
    }
    if let Some(info_hash) = &args.info_hash {
        return Ok((None, util::parse_info_hash(info_hash)?));
    }
    log::error!("A .torrent file (-t) or an info hash (-i) must be provided.");
    Args::command().print_help()?;
    exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // init logging
    env_logger::init_from_env(
        env_logger::Env::default().filter_or("LOG_LEVEL", args.log_level.to_string()),
    );
    bump_file_limit();

    let (known, info_hash) = match load_torrent(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("could not load the torrent: {e}");
            exit(1);
        }
    };

    let config = Config {
        listen_port: args.port,
        ..Config::default()
    };
    let base_path = args.base_path.clone();
    let storage_factory: StorageFactory = Box::new(move |info_hash: [u8; 20]| {
        Box::new(DirectoryStorage::new(&base_path, info_hash)) as Box<dyn Storage>
    });
    let selected_files = (!args.select_files.is_empty()).then(|| args.select_files.clone());
    let shared = Shared::new(
        config,
        info_hash,
        util::generate_peer_id(),
        storage_factory,
        selected_files,
    );
    if let Some((torrent, metadata)) = known {
        if let Err(e) = shared.initialize_storage(torrent, metadata) {
            log::error!("could not initialize storage in {}: {e}", args.base_path.display());
            exit(1);
        }
    }

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    let (peers_tx, peers_rx) = mpsc::channel(PEER_QUEUE_SIZE);
    let peers = args.peers;
    tokio::spawn(async move {
        for peer in peers {
            match lookup_host(peer.as_str()).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if peers_tx.send(addr).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => log::warn!("could not resolve peer {peer}: {e}"),
            }
        }
    });

    Session::new(shared).run(listener, peers_rx).await
}
