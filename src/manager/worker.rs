use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};

use anyhow::Result;

use crate::{
    manager::{
        agents::{
            availability::AvailabilityAgent, choke::ChokeAgent, have_producer::HaveProducer,
            metadata::MetadataAgent, peer_request::PeerRequestAgent, piece::PieceAgent,
            request_producer::RequestProducer,
        },
        connection::ConnectionState,
        session::Shared,
    },
    torrent_protocol::wire_protocol::{Message, MessageKind},
};

/// What an agent sees of a connection while handling it.
pub struct MessageContext<'a> {
    pub addr: SocketAddr,
    pub state: &'a mut ConnectionState,
    pub shared: &'a Shared,
    pub now: Instant,
}

/// Handles received messages of the kinds it registers for.
pub trait Consumer: Send + Sync {
    fn kinds(&self) -> &'static [MessageKind];
    fn consume(&self, message: &Message, ctx: &mut MessageContext) -> Result<()>;
}

/// Posts outbound messages on every send cycle.
pub trait Producer: Send + Sync {
    fn produce(&self, ctx: &mut MessageContext) -> Result<()>;
}

/// Routing of received messages to consumers, and the ordered list of producers.
/// Built once per session; an error from any agent closes the connection.
pub struct Worker {
    consumers: HashMap<MessageKind, Vec<Arc<dyn Consumer>>>,
    producers: Vec<Arc<dyn Producer>>,
}

impl Worker {
    pub fn new() -> Self {
        let choke = Arc::new(ChokeAgent);
        let availability = Arc::new(AvailabilityAgent);
        let metadata = Arc::new(MetadataAgent);
        let peer_request = Arc::new(PeerRequestAgent);

        let mut worker = Worker {
            consumers: HashMap::new(),
            producers: Vec::new(),
        };
        worker.register_consumer(choke.clone());
        worker.register_consumer(availability.clone());
        worker.register_consumer(Arc::new(PieceAgent));
        worker.register_consumer(peer_request.clone());
        worker.register_consumer(metadata.clone());

        // availability first so that interest and assignments see it in the same cycle
        worker.producers.push(availability);
        worker.producers.push(metadata);
        worker.producers.push(Arc::new(HaveProducer));
        worker.producers.push(choke);
        worker.producers.push(Arc::new(RequestProducer));
        worker.producers.push(peer_request);
        worker
    }

    fn register_consumer(&mut self, consumer: Arc<dyn Consumer>) {
        for kind in consumer.kinds() {
            self.consumers
                .entry(*kind)
                .or_default()
                .push(consumer.clone());
        }
    }

    pub fn dispatch(&self, message: &Message, ctx: &mut MessageContext) -> Result<()> {
        if let Some(consumers) = self.consumers.get(&message.kind()) {
            for consumer in consumers {
                consumer.consume(message, ctx)?;
            }
        }
        Ok(())
    }

    pub fn produce(&self, ctx: &mut MessageContext) -> Result<()> {
        for producer in &self.producers {
            producer.produce(ctx)?;
        }
        Ok(())
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}
