use anyhow::Result;
use rand::seq::SliceRandom;

use crate::{
    manager::{
        assignments::AssignmentStatus,
        worker::{MessageContext, Producer},
    },
    torrent_protocol::wire_protocol::{BlockRequest, Message},
};

/// Keeps the request pipeline of a connection full with blocks of its assigned pieces.
pub struct RequestProducer;

impl RequestProducer {
    fn release(ctx: &mut MessageContext, reason: &str) {
        let released = ctx.shared.assignments.remove(ctx.state);
        ctx.state.cancel_pending();
        if !released.is_empty() {
            log::debug!("peer {}: {reason}, released pieces {released:?}", ctx.addr);
        }
    }
}

impl Producer for RequestProducer {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        if ctx.state.peer_choking {
            if ctx.state.assignment.is_some() || !ctx.state.pending.is_empty() {
                Self::release(ctx, "choked");
            }
            return Ok(());
        }
        let timeout = ctx.shared.config.max_piece_receiving_time;
        if ctx
            .state
            .assignment
            .as_ref()
            .is_some_and(|a| a.status(ctx.now, timeout) == AssignmentStatus::Timeout)
        {
            if let Some(assignment) = ctx.state.assignment.as_ref() {
                log::debug!(
                    "peer {}: assignment started {:?} ago made no progress",
                    ctx.addr,
                    ctx.now.saturating_duration_since(assignment.started())
                );
            }
            Self::release(ctx, "assignment timed out");
            return Ok(());
        }

        let mut storage = ctx.shared.storage();
        let Some(storage) = storage.as_mut() else {
            return Ok(());
        };

        // verified pieces, possibly by another connection in endgame
        let verified: Vec<u32> = ctx
            .state
            .assignment
            .iter()
            .flat_map(|a| a.pieces())
            .filter(|p| storage.bitfield().is_verified(*p as usize))
            .collect();
        for piece in verified {
            ctx.shared.assignments.complete(ctx.state, piece);
            ctx.state.cancel_piece(piece);
        }

        {
            let statistics = ctx.shared.statistics();
            ctx.shared
                .assignments
                .assign(&ctx.addr, ctx.state, storage, &statistics, ctx.now);
        }

        let pieces: Vec<u32> = ctx
            .state
            .assignment
            .iter()
            .flat_map(|a| a.pieces())
            .filter(|p| !storage.is_persisting(*p))
            .collect();
        for piece in pieces {
            let chunk = storage.chunk(piece)?;
            let block_set = chunk.block_set();
            let mut missing: Vec<BlockRequest> = block_set
                .missing_blocks()
                .map(|b| {
                    BlockRequest::new(piece, block_set.block_offset(b), block_set.block_length(b))
                })
                .filter(|r| !ctx.state.is_requested(r.key()))
                .collect();
            missing.shuffle(&mut rand::rng());
            for request in missing {
                ctx.state.queue_request(request);
            }
        }

        let max_outstanding = ctx.shared.config.max_outstanding_requests;
        while ctx.state.pending.len() <= max_outstanding {
            let Some(request) = ctx.state.pop_request() else {
                break;
            };
            ctx.state.pending.insert(request.key(), request);
            ctx.state.post(Message::Request(request));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        net::SocketAddr,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        config::Config,
        data::data_bitfield::DataBitfield,
        manager::{connection::ConnectionState, session::Shared},
        persistence::{storage::MemoryStorage, torrent::Torrent},
    };

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 1))
    }

    // 6 pieces of 32 bytes, 4 blocks of 8 bytes each
    fn shared(max_outstanding_requests: usize) -> Shared {
        let data = vec![5u8; 6 * 32];
        let config = Config {
            block_size: 8,
            max_outstanding_requests,
            max_piece_receiving_time: Duration::from_secs(30),
            ..Config::default()
        };
        let shared = Shared::with_storage(
            config,
            Torrent::single_file_metadata("t", &data, 32, false),
            MemoryStorage::new(),
        );
        let mut peer = DataBitfield::new(6);
        (0..6).for_each(|p| {
            peer.mark_verified(p);
        });
        shared.statistics().add_bitfield(addr(), peer);
        shared
    }

    fn produce(shared: &Shared, state: &mut ConnectionState, now: Instant) -> Vec<Message> {
        let mut ctx = MessageContext {
            addr: addr(),
            state,
            shared,
            now,
        };
        RequestProducer.produce(&mut ctx).unwrap();
        ctx.state.drain_outbound()
    }

    fn requests(messages: &[Message]) -> Vec<BlockRequest> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(*r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn nothing_while_choked() {
        let shared = shared(128);
        let mut state = ConnectionState::new();
        assert!(produce(&shared, &mut state, Instant::now()).is_empty());
        assert!(state.assignment.is_none());
    }

    #[test]
    fn requests_blocks_of_assigned_pieces() {
        let shared = shared(128);
        let mut state = ConnectionState::new();
        state.peer_choking = false;

        let sent = requests(&produce(&shared, &mut state, Instant::now()));
        assert_eq!(sent.len(), 12);
        let pieces: HashSet<u32> = sent.iter().map(|r| r.piece_idx).collect();
        assert_eq!(pieces.len(), 3);
        assert!(sent.iter().all(|r| r.data_len == 8 && r.block_begin % 8 == 0));
        assert_eq!(state.pending.len(), 12);

        // nothing new while everything is in flight
        assert!(produce(&shared, &mut state, Instant::now()).is_empty());
    }

    #[test]
    fn outstanding_requests_are_capped() {
        let shared = shared(5);
        let mut state = ConnectionState::new();
        state.peer_choking = false;

        // draining stops once the pending count exceeds the limit
        assert_eq!(requests(&produce(&shared, &mut state, Instant::now())).len(), 6);
        assert_eq!(state.queued_requests(), 6);
        assert!(produce(&shared, &mut state, Instant::now()).is_empty());

        // one answer frees one slot
        let answered = *state.pending.keys().next().unwrap();
        state.pending.remove(&answered);
        assert_eq!(requests(&produce(&shared, &mut state, Instant::now())).len(), 1);
        assert_eq!(state.pending.len(), 6);
    }

    #[test]
    fn choke_cancels_in_flight_requests() {
        let shared = shared(128);
        let mut state = ConnectionState::new();
        state.peer_choking = false;
        produce(&shared, &mut state, Instant::now());

        state.peer_choking = true;
        let messages = produce(&shared, &mut state, Instant::now());
        assert_eq!(messages.len(), 12);
        assert!(messages.iter().all(|m| matches!(m, Message::Cancel(_))));
        assert!(state.pending.is_empty());
        assert_eq!(state.queued_requests(), 0);
        assert_eq!(shared.assignments.claimed_count(), 0);
    }

    #[test]
    fn timed_out_assignment_is_released() {
        let shared = shared(128);
        let mut state = ConnectionState::new();
        state.peer_choking = false;
        let start = Instant::now();
        produce(&shared, &mut state, start);

        let messages = produce(&shared, &mut state, start + Duration::from_secs(31));
        assert!(messages.iter().all(|m| matches!(m, Message::Cancel(_))));
        assert!(state.assignment.is_none());
        assert_eq!(shared.assignments.claimed_count(), 0);
    }

    #[test]
    fn verified_pieces_are_replaced() {
        let shared = shared(128);
        let mut state = ConnectionState::new();
        state.peer_choking = false;
        produce(&shared, &mut state, Instant::now());

        let done = state.assignment.as_ref().unwrap().pieces().next().unwrap();
        {
            let mut storage = shared.storage();
            let storage = storage.as_mut().unwrap();
            let chunk = storage.chunk(done).unwrap();
            for offset in [0, 8, 16, 24] {
                chunk.write_block(offset, vec![5u8; 8]).unwrap();
            }
            storage.store_chunk(done).unwrap();
        }

        let messages = produce(&shared, &mut state, Instant::now());
        let cancels = messages
            .iter()
            .filter(|m| matches!(m, Message::Cancel(r) if r.piece_idx == done))
            .count();
        assert_eq!(cancels, 4);
        let new_requests = requests(&messages);
        assert_eq!(new_requests.len(), 4);
        assert!(new_requests.iter().all(|r| r.piece_idx != done));
        let assignment = state.assignment.as_ref().unwrap();
        assert_eq!(assignment.len(), 3);
        assert!(!assignment.contains(done));
    }
}
