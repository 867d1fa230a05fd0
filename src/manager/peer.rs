use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Result};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    join,
    net::TcpStream,
    sync::watch,
    time::{interval, timeout, MissedTickBehavior},
};

use crate::{
    manager::{
        agents::peer_request::MAX_PEER_REQUESTS, connection::Connection, session::Shared,
        worker::MessageContext,
    },
    torrent_protocol::{
        extension::{ExtendedHandshake, ExtensionTable, LOCAL_UT_METADATA_ID, UT_METADATA},
        wire_protocol::{Handshake, Message, Protocol, ProtocolReadHalf, ProtocolWriteHalf},
    },
    util::{force_string, pretty_info_hash},
};

static DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
static FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Dials `addr` and drives the connection until it closes.
pub async fn connect(shared: Arc<Shared>, addr: SocketAddr) {
    log::trace!("initiating connection to peer: {addr}");
    let established = match timeout(shared.config.connect_timeout, TcpStream::connect(addr)).await {
        Err(_elapsed) => {
            log::trace!("timed out connecting to peer {addr}");
            None
        }
        Ok(Err(e)) => {
            log::trace!("error initiating connection to peer {addr}: {e}");
            None
        }
        Ok(Ok(stream)) => establish(&shared, stream, addr).await,
    };
    shared.done_connecting(&addr);
    if let Some((connection, stream, extended)) = established {
        serve(&shared, &connection, stream, extended).await;
    }
}

/// Drives a connection accepted by the session listener until it closes.
pub async fn accept(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    log::trace!("incoming connection from peer {addr}");
    if let Some((connection, stream, extended)) = establish(&shared, stream, addr).await {
        serve(&shared, &connection, stream, extended).await;
    }
}

async fn handshake<T: Protocol>(shared: &Shared, stream: &mut T) -> Result<Handshake> {
    let handshake = stream.handshake(shared.info_hash, shared.peer_id).await?;
    log::trace!(
        "received handshake: info_hash: {}, peer_id: {}, reserved: {:?}",
        pretty_info_hash(handshake.info_hash),
        force_string(&handshake.peer_id),
        handshake.reserved,
    );
    if handshake.info_hash != shared.info_hash {
        bail!(
            "info hash does not match (own: {}, theirs: {})",
            pretty_info_hash(shared.info_hash),
            pretty_info_hash(handshake.info_hash)
        );
    }
    if handshake.peer_id == shared.peer_id {
        bail!("connected to ourselves");
    }
    Ok(handshake)
}

// handshake and registration, None when the connection must be dropped
async fn establish<T>(
    shared: &Shared,
    mut stream: T,
    addr: SocketAddr,
) -> Option<(Arc<Connection>, T, bool)>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    match timeout(DEFAULT_TIMEOUT, handshake(shared, &mut stream)).await {
        Err(_elapsed) => {
            log::trace!("handshake timeout with peer {addr}");
            None
        }
        Ok(Err(e)) => {
            log::trace!("handshake failed with peer {addr}: {e}");
            None
        }
        Ok(Ok(handshake)) => {
            let connection = Arc::new(Connection::new(addr, handshake.peer_id));
            if !shared.register(connection.clone()) {
                log::trace!("peer {addr}: refusing connection, already connected or too many connections");
                return None;
            }
            Some((connection, stream, handshake.supports_extension_protocol()))
        }
    }
}

// bitfield first, then the extended handshake when the peer speaks the extension protocol
fn initial_messages(shared: &Shared, connection: &Connection, extended: bool) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut state = connection.state();
    let storage = shared.storage();
    if let Some(storage) = storage.as_ref() {
        if storage.bitfield().verified_count() > 0 {
            messages.push(Message::Bitfield(storage.bitfield().encode()));
        }
        state.initial_announced = true;
        state.have_cursor = shared.announcements().len();
    }

    if extended {
        let metadata_size = storage
            .as_ref()
            .filter(|s| !s.torrent().private)
            .map(|s| s.metadata().len());
        messages.push(Message::ExtendedHandshake(ExtendedHandshake {
            extensions: HashMap::from([(UT_METADATA.to_string(), LOCAL_UT_METADATA_ID)]),
            listen_port: Some(shared.config.listen_port),
            client: Some(env!("CLIENT_VERSION").to_string()),
            metadata_size,
            encryption: Some(false),
            reqq: Some(MAX_PEER_REQUESTS as u32),
        }));
    }
    messages
}

async fn serve<T>(shared: &Shared, connection: &Connection, stream: T, extended: bool)
where
    T: AsyncRead + AsyncWrite + Send,
{
    let initial = initial_messages(shared, connection, extended);
    let (read, write) = tokio::io::split(stream);
    join!(
        read_loop(shared, connection, read),
        write_loop(shared, connection, write, initial)
    );
    log::trace!("peer {}: tasks ended", connection.addr);
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // an error means the connection is gone, which is a shutdown too
    let _ = shutdown.wait_for(|closed| *closed).await;
}

async fn read_loop<T: ProtocolReadHalf>(shared: &Shared, connection: &Connection, mut read: T) {
    let addr = connection.addr;
    let mut shutdown = connection.subscribe_shutdown();
    loop {
        let received = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            received = timeout(shared.config.peer_inactivity_threshold, read.receive()) => received,
        };
        let message = match received {
            Err(_elapsed) => {
                log::trace!(
                    "peer {addr}: nothing received (not even keep-alive messages) in {:?}",
                    shared.config.peer_inactivity_threshold
                );
                break;
            }
            Ok(Err(e)) => {
                log::trace!("peer {addr}: receive failed: {e}");
                break;
            }
            Ok(Ok(message)) => message,
        };
        log::trace!("received from {addr}: {message}");
        connection.touch();

        let result = {
            let mut state = connection.state();
            let mut ctx = MessageContext {
                addr,
                state: &mut state,
                shared,
                now: Instant::now(),
            };
            shared.worker.dispatch(&message, &mut ctx)
        };
        if let Err(e) = result {
            log::debug!("peer {addr}: closing after {message}: {e}");
            break;
        }
        connection.wake.notify_one();
    }
    shared.close_connection(connection);
}

async fn send<T: ProtocolWriteHalf>(
    shared: &Shared,
    write: &mut T,
    message: Message,
    extensions: &ExtensionTable,
) -> Result<()> {
    let uploaded = match &message {
        Message::Piece(_, _, data) => data.len() as u64,
        _ => 0,
    };
    match timeout(DEFAULT_TIMEOUT, write.send(message, extensions)).await {
        Err(_elapsed) => bail!("timeout sending message"),
        Ok(result) => result?,
    }
    shared.counters.add_uploaded(uploaded);
    Ok(())
}

async fn write_loop<T: ProtocolWriteHalf>(
    shared: &Shared,
    connection: &Connection,
    mut write: T,
    initial: Vec<Message>,
) {
    let addr = connection.addr;
    let mut shutdown = connection.subscribe_shutdown();
    let mut tick = interval(shared.config.produce_period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = Instant::now();
    let mut pending = initial;

    'cycle: loop {
        for message in pending.drain(..) {
            log::trace!("sending to {addr}: {message}");
            let extensions = connection.state().remote_extensions.clone();
            if let Err(e) = send(shared, &mut write, message, &extensions).await {
                log::trace!("peer {addr}: sending failed: {e}");
                break 'cycle;
            }
            last_sent = Instant::now();
        }

        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = tick.tick() => {}
            _ = connection.wake.notified() => {}
        }

        let produced = {
            let mut state = connection.state();
            let mut ctx = MessageContext {
                addr,
                state: &mut state,
                shared,
                now: Instant::now(),
            };
            shared
                .worker
                .produce(&mut ctx)
                .map(|_| ctx.state.drain_outbound())
        };
        pending = match produced {
            Ok(messages) => messages,
            Err(e) => {
                log::debug!("peer {addr}: closing: {e}");
                break;
            }
        };
        if pending.is_empty() && last_sent.elapsed() >= shared.config.keep_alive_period {
            pending.push(Message::KeepAlive);
        }
    }
    shared.close_connection(connection);

    // the cancels of our in-flight requests, best effort
    let (cancels, extensions) = {
        let mut state = connection.state();
        let cancels: Vec<Message> = state
            .drain_outbound()
            .into_iter()
            .filter(|m| matches!(m, Message::Cancel(_)))
            .collect();
        (cancels, state.remote_extensions.clone())
    };
    let _ = timeout(FLUSH_TIMEOUT, async {
        for message in cancels {
            if write.send(message, &extensions).await.is_err() {
                break;
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::{
        config::Config,
        persistence::{storage::MemoryStorage, torrent::Torrent},
        torrent_protocol::wire_protocol::BlockRequest,
    };

    fn seeder(data: &[u8]) -> Arc<Shared> {
        let config = Config {
            produce_period: Duration::from_millis(10),
            update_assignments_interval: Duration::from_millis(10),
            ..Config::default()
        };
        Arc::new(Shared::with_storage(
            config,
            Torrent::single_file_metadata("t", data, 64, false),
            MemoryStorage::seeded(data, 64),
        ))
    }

    fn start(shared: &Arc<Shared>) -> DuplexStream {
        let (local, remote) = duplex(1 << 20);
        let shared = shared.clone();
        tokio::spawn(async move {
            let addr = SocketAddr::from(([127, 0, 0, 1], 7000));
            if let Some((connection, stream, extended)) = establish(&shared, local, addr).await {
                serve(&shared, &connection, stream, extended).await;
            }
        });
        remote
    }

    async fn next_matching<F: Fn(&Message) -> bool>(stream: &mut DuplexStream, wanted: F) -> Message {
        loop {
            let message = stream.receive().await.unwrap();
            if wanted(&message) {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn serves_a_remote_peer() {
        let data: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let shared = seeder(&data);
        let mut remote = start(&shared);

        let handshake = remote.handshake(shared.info_hash, [9; 20]).await.unwrap();
        assert_eq!(handshake.peer_id, shared.peer_id);
        assert!(handshake.supports_extension_protocol());

        let none = ExtensionTable::default();
        let result = timeout(Duration::from_secs(5), async {
            assert_eq!(remote.receive().await.unwrap(), Message::Bitfield(vec![0b1111_0000]));
            assert_matches!(
                remote.receive().await.unwrap(),
                Message::ExtendedHandshake(h) if h.metadata_size.is_some() && h.reqq == Some(250)
            );

            remote.send(Message::Interested, &none).await.unwrap();
            next_matching(&mut remote, |m| *m == Message::Unchoke).await;

            remote
                .send(Message::Request(BlockRequest::new(2, 16, 32)), &none)
                .await
                .unwrap();
            next_matching(&mut remote, |m| matches!(m, Message::Piece(..))).await
        })
        .await
        .unwrap();

        assert_eq!(result, Message::Piece(2, 16, data[144..176].to_vec()));
        assert_eq!(shared.connection_count(), 1);
        assert_eq!(shared.counters.uploaded(), 32);
    }

    #[tokio::test]
    async fn wrong_info_hash_is_refused() {
        let shared = seeder(&[1u8; 128]);
        let mut remote = start(&shared);
        let handshake = remote.handshake([3; 20], [9; 20]).await;
        // the other side answers with its own info hash, then hangs up
        assert_matches!(handshake, Ok(h) if h.info_hash == shared.info_hash);
        assert!(remote.receive().await.is_err());
        assert_eq!(shared.connection_count(), 0);
    }

    #[tokio::test]
    async fn protocol_error_closes_the_connection() {
        let shared = seeder(&[1u8; 128]);
        let mut remote = start(&shared);
        remote.handshake(shared.info_hash, [9; 20]).await.unwrap();
        remote.receive().await.unwrap();

        // have for a piece that does not exist
        remote.send(Message::Have(10), &ExtensionTable::default()).await.unwrap();
        let closed = timeout(Duration::from_secs(5), async {
            while remote.receive().await.is_ok() {}
        })
        .await;
        assert!(closed.is_ok());
        assert_eq!(shared.connection_count(), 0);
    }
}
