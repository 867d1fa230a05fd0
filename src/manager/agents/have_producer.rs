use anyhow::Result;

use crate::{
    manager::worker::{MessageContext, Producer},
    torrent_protocol::wire_protocol::Message,
};

/// Tells the peer about the pieces we verify.
pub struct HaveProducer;

impl Producer for HaveProducer {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        let storage = ctx.shared.storage();
        let Some(storage) = storage.as_ref() else {
            return Ok(());
        };
        let announcements = ctx.shared.announcements();

        // the torrent became known after the connection started, no bitfield was sent
        if !ctx.state.initial_announced {
            ctx.state.initial_announced = true;
            ctx.state.have_cursor = announcements.len();
            for piece in storage.bitfield().verified().iter_ones() {
                ctx.state.post(Message::Have(piece as u32));
            }
            return Ok(());
        }

        for (piece, from) in &announcements[ctx.state.have_cursor..] {
            if *from != ctx.addr {
                ctx.state.post(Message::Have(*piece));
            }
        }
        ctx.state.have_cursor = announcements.len();
        Ok(())
    }
}
