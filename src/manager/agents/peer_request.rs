use anyhow::{bail, Result};

use crate::{
    config::MAX_SERVED_BLOCK_SIZE,
    manager::worker::{Consumer, MessageContext, Producer},
    torrent_protocol::wire_protocol::{Message, MessageKind},
};

// advertised as reqq in the extended handshake
pub const MAX_PEER_REQUESTS: usize = 250;

const BLOCKS_SERVED_PER_CYCLE: usize = 16;

/// Serves blocks of verified pieces to unchoked peers.
pub struct PeerRequestAgent;

impl Consumer for PeerRequestAgent {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Request, MessageKind::Cancel]
    }

    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        match message {
            Message::Request(request) => {
                let storage = ctx.shared.storage();
                let Some(storage) = storage.as_ref() else {
                    return Ok(());
                };
                let Some(skeleton) = storage.skeleton(request.piece_idx) else {
                    bail!("request for piece {} out of range", request.piece_idx);
                };
                if request.data_len == 0
                    || request.data_len > MAX_SERVED_BLOCK_SIZE
                    || request.block_begin as u64 + request.data_len as u64
                        > skeleton.length as u64
                {
                    bail!(
                        "request {}+{} outside of piece {}",
                        request.block_begin,
                        request.data_len,
                        request.piece_idx
                    );
                }
                if ctx.state.am_choking {
                    log::trace!("peer {}: ignoring request while choked", ctx.addr);
                    return Ok(());
                }
                if !storage.bitfield().is_verified(request.piece_idx as usize) {
                    log::trace!(
                        "peer {}: ignoring request for missing piece {}",
                        ctx.addr,
                        request.piece_idx
                    );
                    return Ok(());
                }
                if ctx.state.peer_requests.len() >= MAX_PEER_REQUESTS {
                    log::debug!("peer {}: too many requests queued, dropping", ctx.addr);
                    return Ok(());
                }
                ctx.state.accept_peer_request(*request);
            }
            Message::Cancel(request) => ctx.state.record_cancel(request, ctx.now),
            _ => {}
        }
        Ok(())
    }
}

impl Producer for PeerRequestAgent {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        ctx.state
            .expire_cancellations(ctx.now, ctx.shared.config.cancellation_retention);
        if ctx.state.am_choking {
            ctx.state.peer_requests.clear();
            return Ok(());
        }
        if ctx.state.peer_requests.is_empty() {
            return Ok(());
        }

        let storage = ctx.shared.storage();
        let Some(storage) = storage.as_ref() else {
            return Ok(());
        };
        for _ in 0..BLOCKS_SERVED_PER_CYCLE {
            let Some(request) = ctx.state.peer_requests.pop_front() else {
                break;
            };
            match storage.read_block(&request) {
                Ok(data) => ctx.state.post(Message::Piece(
                    request.piece_idx,
                    request.block_begin,
                    data,
                )),
                Err(e) => log::error!(
                    "peer {}: could not read block {}/{}: {e}",
                    ctx.addr,
                    request.piece_idx,
                    request.block_begin
                ),
            }
        }
        Ok(())
    }
}
