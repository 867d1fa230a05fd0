use anyhow::Result;

use crate::{
    manager::worker::{Consumer, MessageContext},
    persistence::data_storage::Completion,
    torrent_protocol::wire_protocol::{request_key, Message, MessageKind},
};

/// Writes requested blocks into their chunks and completes pieces.
pub struct PieceAgent;

impl Consumer for PieceAgent {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Piece]
    }

    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        let Message::Piece(piece, begin, data) = message else {
            return Ok(());
        };
        let Some(request) = ctx.state.pending.remove(&request_key(*piece, *begin)) else {
            log::trace!("peer {}: discarding unrequested block {piece}/{begin}", ctx.addr);
            return Ok(());
        };
        if request.data_len as usize != data.len() {
            log::debug!(
                "peer {}: discarding block {piece}/{begin} of length {} instead of {}",
                ctx.addr,
                data.len(),
                request.data_len
            );
            return Ok(());
        }
        ctx.shared.counters.add_downloaded(data.len() as u64);

        let ready = {
            let mut storage = ctx.shared.storage();
            let Some(storage) = storage.as_mut() else {
                return Ok(());
            };
            if storage.bitfield().is_verified(*piece as usize) || storage.is_persisting(*piece) {
                log::trace!("peer {}: discarding block of verified piece {piece}", ctx.addr);
                return Ok(());
            }
            if let Some(assignment) = ctx.state.assignment.as_mut() {
                if assignment.contains(*piece) {
                    assignment.progress(ctx.now);
                }
            }

            let chunk = storage.chunk(*piece)?;
            if chunk.has_block(*begin) {
                return Ok(());
            }
            chunk.write_block(*begin, data.clone())?;
            if !chunk.is_complete() {
                log::trace!(
                    "peer {}: piece {piece} has {}/{} blocks",
                    ctx.addr,
                    chunk.block_set().present_count(),
                    chunk.block_set().block_count()
                );
                return Ok(());
            }
            match storage.complete_chunk(*piece) {
                Completion::Ready(chunk) => chunk,
                Completion::Corrupted => {
                    log::warn!("peer {}: piece {piece} failed verification", ctx.addr);
                    return Ok(());
                }
                Completion::Incomplete => return Ok(()),
            }
        };

        // disk writes happen outside the storage lock
        let stored = ready.persist();

        let mut storage = ctx.shared.storage();
        let Some(storage) = storage.as_mut() else {
            return Ok(());
        };
        match storage.finish_chunk(ready, stored) {
            Ok(true) => {
                let remaining = storage.bitfield().pieces_remaining();
                log::debug!(
                    "peer {}: piece {piece} verified, {remaining} remaining",
                    ctx.addr
                );
                ctx.shared.announce(*piece, ctx.addr);
                if remaining == 0 {
                    log::info!("download complete");
                }
            }
            Ok(false) => log::warn!("piece {piece} did not read back intact from storage"),
            Err(e) => log::error!("could not store piece {piece}: {e}"),
        }
        Ok(())
    }
}
