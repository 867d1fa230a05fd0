use anyhow::Result;

use crate::{
    manager::worker::{Consumer, MessageContext, Producer},
    torrent_protocol::wire_protocol::{Message, MessageKind},
};

/// Choke and interest flags of both sides of a connection.
pub struct ChokeAgent;

impl Consumer for ChokeAgent {
    fn kinds(&self) -> &'static [MessageKind] {
        &[
            MessageKind::Choke,
            MessageKind::Unchoke,
            MessageKind::Interested,
            MessageKind::NotInterested,
        ]
    }

    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        match message {
            Message::Choke => {
                ctx.state.peer_choking = true;
                let released = ctx.shared.assignments.remove(ctx.state);
                ctx.state.cancel_pending();
                log::debug!("peer {}: choked us, released pieces {released:?}", ctx.addr);
            }
            Message::Unchoke => {
                ctx.state.peer_choking = false;
                log::debug!("peer {}: unchoked us", ctx.addr);
            }
            Message::Interested => ctx.state.peer_interested = true,
            Message::NotInterested => ctx.state.peer_interested = false,
            _ => {}
        }
        Ok(())
    }
}

impl Producer for ChokeAgent {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        let config = &ctx.shared.config;
        let now = ctx.now;

        let can_transition = ctx
            .state
            .last_choke_transition
            .is_none_or(|t| now.saturating_duration_since(t) >= config.choking_threshold);
        if can_transition {
            if ctx.state.peer_interested && ctx.state.am_choking && ctx.shared.storage_ready() {
                ctx.state.am_choking = false;
                ctx.state.last_choke_transition = Some(now);
                ctx.state.post(Message::Unchoke);
                log::debug!("peer {}: unchoking", ctx.addr);
            } else if !ctx.state.peer_interested && !ctx.state.am_choking {
                ctx.state.am_choking = true;
                ctx.state.last_choke_transition = Some(now);
                ctx.state.peer_requests.clear();
                ctx.state.post(Message::Choke);
                log::debug!("peer {}: choking", ctx.addr);
            }
        }

        let update_due = ctx
            .state
            .last_interest_update
            .is_none_or(|t| now.saturating_duration_since(t) >= config.update_assignments_interval);
        if update_due {
            ctx.state.last_interest_update = Some(now);
            let interesting = ctx.shared.assignments.is_interesting(&ctx.addr);
            if interesting && !ctx.state.am_interested {
                ctx.state.am_interested = true;
                ctx.state.post(Message::Interested);
            } else if !interesting && ctx.state.am_interested {
                ctx.state.am_interested = false;
                ctx.state.post(Message::NotInterested);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
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

    fn shared() -> Shared {
        let data = vec![1u8; 64];
        let config = Config {
            choking_threshold: Duration::from_secs(10),
            update_assignments_interval: Duration::from_secs(1),
            ..Config::default()
        };
        Shared::with_storage(
            config,
            Torrent::single_file_metadata("t", &data, 16, false),
            MemoryStorage::seeded(&data, 16),
        )
    }

    fn produce(shared: &Shared, state: &mut ConnectionState, now: Instant) -> Vec<Message> {
        let mut ctx = MessageContext {
            addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            state,
            shared,
            now,
        };
        ChokeAgent.produce(&mut ctx).unwrap();
        ctx.state.drain_outbound()
    }

    fn consume(shared: &Shared, state: &mut ConnectionState, message: Message) {
        let mut ctx = MessageContext {
            addr: SocketAddr::from(([127, 0, 0, 1], 1)),
            state,
            shared,
            now: Instant::now(),
        };
        ChokeAgent.consume(&message, &mut ctx).unwrap();
    }

    #[test]
    fn choke_transitions_are_throttled() {
        let shared = shared();
        let mut state = ConnectionState::new();
        let start = Instant::now();

        consume(&shared, &mut state, Message::Interested);
        assert_eq!(produce(&shared, &mut state, start), vec![Message::Unchoke]);
        assert!(!state.am_choking);

        // a burst of interest flips within the threshold changes nothing
        let mut transitions = 0;
        for i in 1..100 {
            let message = if i % 2 == 0 {
                Message::Interested
            } else {
                Message::NotInterested
            };
            consume(&shared, &mut state, message);
            transitions += produce(&shared, &mut state, start + Duration::from_millis(i * 50))
                .iter()
                .filter(|m| matches!(m, Message::Choke | Message::Unchoke))
                .count();
        }
        assert_eq!(transitions, 0);
        assert!(!state.am_choking);

        // peer is not interested (last flip), once the threshold passed it gets choked
        let messages = produce(&shared, &mut state, start + Duration::from_secs(10));
        assert_eq!(messages, vec![Message::Choke]);
        assert!(state.am_choking);
        assert!(produce(&shared, &mut state, start + Duration::from_secs(11)).is_empty());
    }

    #[test]
    fn choke_from_peer_releases_assignment() {
        let data = vec![1u8; 64];
        let shared = Shared::with_storage(
            Config::default(),
            Torrent::single_file_metadata("t", &data, 16, false),
            MemoryStorage::new(),
        );
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let mut peer = DataBitfield::new(4);
        (0..4).for_each(|p| {
            peer.mark_verified(p);
        });
        shared.statistics().add_bitfield(addr, peer);

        let mut state = ConnectionState::new();
        consume(&shared, &mut state, Message::Unchoke);
        {
            let storage = shared.storage();
            let statistics = shared.statistics();
            shared.assignments.assign(
                &addr,
                &mut state,
                storage.as_ref().unwrap(),
                &statistics,
                Instant::now(),
            );
        }
        let request = crate::torrent_protocol::wire_protocol::BlockRequest::new(0, 0, 16);
        state.pending.insert(request.key(), request);
        assert_eq!(shared.assignments.claimed_count(), 3);

        consume(&shared, &mut state, Message::Choke);
        assert!(state.peer_choking);
        assert!(state.assignment.is_none());
        assert!(state.pending.is_empty());
        assert_eq!(shared.assignments.claimed_count(), 0);
        assert_eq!(state.drain_outbound(), vec![Message::Cancel(request)]);
    }

    #[test]
    fn interest_follows_the_scheduler() {
        let data = vec![1u8; 64];
        let shared = Shared::with_storage(
            Config::default(),
            Torrent::single_file_metadata("t", &data, 16, false),
            MemoryStorage::new(),
        );
        let addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let mut state = ConnectionState::new();
        let start = Instant::now();
        assert!(produce(&shared, &mut state, start).is_empty());

        let mut peer = DataBitfield::new(4);
        peer.mark_verified(2);
        shared.statistics().add_bitfield(addr, peer);
        shared
            .assignments
            .update(shared.storage().as_ref().unwrap().bitfield(), &shared.statistics());

        // not yet due
        assert!(produce(&shared, &mut state, start + Duration::from_millis(500)).is_empty());
        assert_eq!(
            produce(&shared, &mut state, start + Duration::from_secs(1)),
            vec![Message::Interested]
        );
        assert!(state.am_interested);
    }
}
