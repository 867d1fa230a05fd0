use anyhow::{bail, Result};

use crate::{
    data::data_bitfield::DataBitfield,
    manager::worker::{Consumer, MessageContext, Producer},
    torrent_protocol::wire_protocol::{Message, MessageKind},
};

// haves kept while the torrent is unknown
const MAX_EARLY_HAVES: usize = 1 << 16;

/// Feeds peer bitfields and haves into the piece statistics.
pub struct AvailabilityAgent;

fn apply_bitfield(ctx: &mut MessageContext, bitfield: &[u8]) -> Result<()> {
    let storage = ctx.shared.storage();
    let Some(storage) = storage.as_ref() else {
        return Ok(());
    };
    let bitfield = match DataBitfield::decode(bitfield, storage.bitfield().pieces_total()) {
        Ok(bitfield) => bitfield,
        Err(e) => bail!("invalid bitfield: {e}"),
    };
    log::trace!(
        "peer {}: has {} pieces",
        ctx.addr,
        bitfield.verified_count()
    );
    ctx.shared.statistics().add_bitfield(ctx.addr, bitfield);
    Ok(())
}

fn apply_have(ctx: &mut MessageContext, piece: u32) -> Result<()> {
    if !ctx.shared.statistics().add_piece(ctx.addr, piece as usize) {
        bail!("have for piece {piece} out of range");
    }
    Ok(())
}

// applies what was buffered while the torrent was unknown
fn flush_early(ctx: &mut MessageContext) -> Result<()> {
    if let Some(bitfield) = ctx.state.early_bitfield.take() {
        apply_bitfield(ctx, &bitfield)?;
    }
    for piece in std::mem::take(&mut ctx.state.early_haves) {
        apply_have(ctx, piece)?;
    }
    Ok(())
}

impl Consumer for AvailabilityAgent {
    fn kinds(&self) -> &'static [MessageKind] {
        &[MessageKind::Bitfield, MessageKind::Have]
    }

    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        let ready = ctx.shared.storage_ready();
        if ready {
            flush_early(ctx)?;
        }
        match message {
            Message::Bitfield(bitfield) if ready => apply_bitfield(ctx, bitfield),
            Message::Bitfield(bitfield) => {
                ctx.state.early_bitfield = Some(bitfield.clone());
                ctx.state.early_haves.clear();
                Ok(())
            }
            Message::Have(piece) if ready => apply_have(ctx, *piece),
            Message::Have(piece) => {
                if ctx.state.early_haves.len() < MAX_EARLY_HAVES {
                    ctx.state.early_haves.push(*piece);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Producer for AvailabilityAgent {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        if ctx.state.early_bitfield.is_none() && ctx.state.early_haves.is_empty() {
            return Ok(());
        }
        if !ctx.shared.storage_ready() {
            return Ok(());
        }
        flush_early(ctx)
    }
}
