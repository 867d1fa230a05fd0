use std::sync::Arc;

use anyhow::Result;

use crate::{
    manager::{
        metadata_exchange::Progress,
        worker::{Consumer, MessageContext, Producer},
    },
    persistence::torrent::Torrent,
    torrent_protocol::{
        extension::{ExtendedHandshake, MetadataMessage, METADATA_BLOCK_SIZE},
        wire_protocol::{Message, MessageKind},
    },
};

/// Extended handshakes and the ut_metadata exchange, in both directions.
pub struct MetadataAgent;

impl MetadataAgent {
    fn handshake(ctx: &mut MessageContext, handshake: &ExtendedHandshake) {
        log::debug!("peer {}: extended handshake: {handshake}", ctx.addr);
        Arc::make_mut(&mut ctx.state.remote_extensions).update(&handshake.extensions);
        if handshake.metadata_size.is_some() {
            ctx.state.remote_metadata_size = handshake.metadata_size;
        }
    }

    fn serve(ctx: &mut MessageContext, piece: u32) {
        if !ctx.state.supports_metadata() {
            log::trace!("peer {}: metadata request without ut_metadata", ctx.addr);
            return;
        }
        let reply = {
            let storage = ctx.shared.storage();
            match storage.as_ref() {
                Some(storage) if !storage.torrent().private => {
                    let metadata = storage.metadata();
                    let start = piece as usize * METADATA_BLOCK_SIZE;
                    if start < metadata.len() {
                        let end = (start + METADATA_BLOCK_SIZE).min(metadata.len());
                        MetadataMessage::Data(piece, metadata.len(), metadata[start..end].to_vec())
                    } else {
                        MetadataMessage::Reject(piece)
                    }
                }
                _ => MetadataMessage::Reject(piece),
            }
        };
        ctx.state.post(Message::Metadata(reply));
    }

    fn receive(ctx: &mut MessageContext, piece: u32, total_size: usize, data: &[u8]) {
        ctx.state.metadata_requested.remove(&piece);
        if let Some(advertised) = ctx.state.remote_metadata_size.filter(|s| *s != total_size) {
            log::debug!(
                "peer {}: metadata size {total_size} differs from the advertised {advertised}",
                ctx.addr
            );
        }
        let progress = ctx.shared.metadata().receive(piece, total_size, data.to_vec());
        match progress {
            Progress::Ignored => {
                log::trace!("peer {}: metadata block {piece} ignored", ctx.addr);
            }
            Progress::Progress => {
                log::trace!("peer {}: metadata block {piece} received", ctx.addr);
            }
            Progress::Mismatch => {
                ctx.state.metadata_requested.clear();
                ctx.state.metadata_generation = ctx.shared.metadata().generation();
            }
            Progress::Complete(metadata) => {
                log::info!("metadata received, {} bytes", metadata.len());
                let torrent = match Torrent::from_metadata(&metadata) {
                    Ok(torrent) => torrent,
                    Err(e) => {
                        log::warn!("received metadata is unusable, starting over: {e}");
                        ctx.shared.metadata().restart();
                        return;
                    }
                };
                if let Err(e) = ctx.shared.initialize_storage(torrent, metadata) {
                    log::error!("could not initialize storage: {e}");
                    ctx.shared.metadata().restart();
                }
            }
        }
    }
}

impl Consumer for MetadataAgent {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::ExtendedHandshake, MessageKind::Metadata]
    }

    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        match message {
            Message::ExtendedHandshake(handshake) => Self::handshake(ctx, handshake),
            Message::Metadata(MetadataMessage::Request(piece)) => Self::serve(ctx, *piece),
            Message::Metadata(MetadataMessage::Data(piece, total_size, data)) => {
                Self::receive(ctx, *piece, *total_size, data)
            }
            Message::Metadata(MetadataMessage::Reject(piece)) => {
                log::debug!("peer {}: metadata block {piece} rejected", ctx.addr);
                ctx.state.metadata_requested.remove(piece);
                ctx.state.metadata_rejected_at = Some(ctx.now);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Producer for MetadataAgent {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        if !ctx.state.supports_metadata() {
            return Ok(());
        }
        let missing = {
            let metadata = ctx.shared.metadata();
            if metadata.is_complete() {
                return Ok(());
            }
            if metadata.generation() != ctx.state.metadata_generation {
                ctx.state.metadata_requested.clear();
                ctx.state.metadata_generation = metadata.generation();
            }
            metadata.missing_blocks()
        };

        if let Some(rejected_at) = ctx.state.metadata_rejected_at {
            if ctx.now.saturating_duration_since(rejected_at)
                < ctx.shared.config.wait_before_rerequesting_after_reject
            {
                return Ok(());
            }
            ctx.state.metadata_rejected_at = None;
        }

        ctx.state
            .metadata_requested
            .retain(|piece, _| missing.contains(piece));
        let timeout = ctx.shared.config.first_block_arrival_timeout;
        for piece in missing {
            let due = ctx
                .state
                .metadata_requested
                .get(&piece)
                .is_none_or(|at| ctx.now.saturating_duration_since(*at) >= timeout);
            if due {
                ctx.state.metadata_requested.insert(piece, ctx.now);
                ctx.state
                    .post(Message::Metadata(MetadataMessage::Request(piece)));
            }
        }
        Ok(())
    }
}
