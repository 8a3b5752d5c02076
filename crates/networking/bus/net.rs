use bytes::BytesMut;
use futures::stream::{BoxStream, StreamExt};
use rustc_hash::FxHashMap;
use spawned_rt::tasks::BroadcastStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::codec::Encoder;
use tokio_util::udp::UdpFramed;
use tracing::{info, trace, warn};

use automine_common::types::{AgentId, QuarryId};

use crate::codec::BusCodec;
use crate::error::BusError;
use crate::message::{Envelope, Message};

/// Capacity of the in-memory hub channel. Large enough that a whole fleet's
/// burst (config exchange during a version bump) cannot lag a subscriber.
const HUB_CAPACITY: usize = 1024;

/// Gap to add to a persisted sequence counter when rebuilding a bus after a
/// restart. Sends between two state saves may have consumed sequences the
/// store never recorded; skipping past them keeps receiver dedupe sound.
pub const RESTART_SEQ_SKIP: u64 = 1024;

/// The shared medium for in-process fleets: every [`Bus`] created from the
/// same hub sees every envelope, mirroring a UDP broadcast segment.
#[derive(Debug, Clone)]
pub struct BusHub {
    tx: broadcast::Sender<Envelope>,
}

impl BusHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }
}

impl Default for BusHub {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum BusInner {
    Udp {
        socket: Arc<UdpSocket>,
        broadcast_addr: SocketAddr,
    },
    InMemory {
        tx: broadcast::Sender<Envelope>,
    },
}

/// An agent's endpoint on the quarry bus. Sending allocates monotonic
/// sequence numbers; the caller persists the counter so sequences never
/// regress across restarts.
#[derive(Debug)]
pub struct Bus {
    inner: BusInner,
    quarry: QuarryId,
    local: AgentId,
    seq: u64,
}

impl Bus {
    /// Bind a UDP socket and aim it at the segment's broadcast address.
    pub async fn udp(
        bind: SocketAddr,
        broadcast_addr: SocketAddr,
        quarry: QuarryId,
        local: AgentId,
        initial_seq: u64,
    ) -> Result<Self, BusError> {
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;
        info!(%bind, %broadcast_addr, agent = %local, "bus bound");
        Ok(Self {
            inner: BusInner::Udp {
                socket: Arc::new(socket),
                broadcast_addr,
            },
            quarry,
            local,
            seq: initial_seq,
        })
    }

    pub fn in_memory(
        hub: &BusHub,
        quarry: QuarryId,
        local: AgentId,
        initial_seq: u64,
    ) -> Self {
        Self {
            inner: BusInner::InMemory {
                tx: hub.tx.clone(),
            },
            quarry,
            local,
            seq: initial_seq,
        }
    }

    pub fn local(&self) -> AgentId {
        self.local
    }

    /// Last allocated sequence; persist this after state-carrying sends.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn broadcast(&mut self, message: Message) -> Result<u64, BusError> {
        self.send(None, message).await
    }

    pub async fn send_to(&mut self, to: AgentId, message: Message) -> Result<u64, BusError> {
        self.send(Some(to), message).await
    }

    async fn send(&mut self, to: Option<AgentId>, message: Message) -> Result<u64, BusError> {
        self.seq += 1;
        let envelope = Envelope::new(self.quarry.clone(), self.local, self.seq, to, message);
        trace!(seq = envelope.seq, msg = %envelope.message, ?to, "bus send");
        match &self.inner {
            BusInner::Udp {
                socket,
                broadcast_addr,
            } => {
                let mut buf = BytesMut::new();
                BusCodec.encode(envelope, &mut buf)?;
                socket.send_to(&buf, *broadcast_addr).await?;
            }
            BusInner::InMemory { tx } => {
                tx.send(envelope).map_err(|_| BusError::NoSubscribers)?;
            }
        }
        Ok(self.seq)
    }

    /// The raw inbound envelope stream. Filtering (own traffic, foreign
    /// quarries, duplicate seqs) is the receiver's job via [`SeqFilter`].
    pub fn incoming(&self) -> BoxStream<'static, Envelope> {
        match &self.inner {
            BusInner::Udp { socket, .. } => UdpFramed::new(socket.clone(), BusCodec)
                .filter_map(|result| async move {
                    match result {
                        Ok((envelope, _addr)) => Some(envelope),
                        Err(err) => {
                            // Skip undecodable datagrams from bad peers.
                            trace!(%err, "dropping undecodable datagram");
                            None
                        }
                    }
                })
                .boxed(),
            BusInner::InMemory { tx } => BroadcastStream::new(tx.subscribe())
                .filter_map(|result| async move {
                    match result {
                        Ok(envelope) => Some(envelope),
                        Err(err) => {
                            warn!(%err, "in-memory bus receiver lagged");
                            None
                        }
                    }
                })
                .boxed(),
        }
    }
}

/// Receiver-side hardening of the medium's sender-FIFO promise: drops
/// envelopes not addressed here and replayed or reordered sequences.
#[derive(Debug)]
pub struct SeqFilter {
    local: AgentId,
    quarry: QuarryId,
    last_seq: FxHashMap<AgentId, u64>,
}

impl SeqFilter {
    pub fn new(local: AgentId, quarry: QuarryId) -> Self {
        Self {
            local,
            quarry,
            last_seq: FxHashMap::default(),
        }
    }

    /// `true` if the envelope should be handled.
    pub fn admit(&mut self, envelope: &Envelope) -> bool {
        if !envelope.accepted_by(self.local, &self.quarry) {
            return false;
        }
        match self.last_seq.get(&envelope.sender) {
            Some(last) if envelope.seq <= *last => {
                trace!(
                    sender = %envelope.sender,
                    seq = envelope.seq,
                    last,
                    "dropping stale envelope"
                );
                false
            }
            _ => {
                self.last_seq.insert(envelope.sender, envelope.seq);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat() -> Message {
        Message::Heartbeat {
            status: "idle".into(),
            job: None,
            fuel: 64,
            config_version: 1,
        }
    }

    #[tokio::test]
    async fn in_memory_bus_delivers_to_all_subscribers() {
        let hub = BusHub::new();
        let quarry = QuarryId::from("alpha");
        let mut alice = Bus::in_memory(&hub, quarry.clone(), AgentId(1), 0);
        let bob = Bus::in_memory(&hub, quarry.clone(), AgentId(2), 0);

        let mut bob_rx = bob.incoming();
        let seq = alice.broadcast(heartbeat()).await.expect("send");
        assert_eq!(seq, 1);

        let envelope = bob_rx.next().await.expect("delivered");
        assert_eq!(envelope.sender, AgentId(1));
        assert_eq!(envelope.seq, 1);
        assert!(envelope.accepted_by(AgentId(2), &quarry));
    }

    #[tokio::test]
    async fn udp_bus_loops_back_on_localhost() {
        let quarry = QuarryId::from("alpha");
        // Bind an ephemeral port and send to ourselves; loopback stands in
        // for the broadcast segment.
        let mut bus = Bus::udp(
            "127.0.0.1:0".parse().expect("addr"),
            "127.0.0.1:0".parse().expect("addr"),
            quarry.clone(),
            AgentId(1),
            0,
        )
        .await
        .expect("bind");
        let local_addr = match &bus.inner {
            BusInner::Udp { socket, .. } => socket.local_addr().expect("addr"),
            BusInner::InMemory { .. } => unreachable!(),
        };
        if let BusInner::Udp { broadcast_addr, .. } = &mut bus.inner {
            *broadcast_addr = local_addr;
        }

        let mut rx = bus.incoming();
        bus.broadcast(Message::Recall { active: true })
            .await
            .expect("send");
        let envelope = rx.next().await.expect("looped back");
        assert_eq!(envelope.message, Message::Recall { active: true });
    }

    #[tokio::test]
    async fn seq_filter_drops_replays_and_own_traffic() {
        let hub = BusHub::new();
        let quarry = QuarryId::from("alpha");
        let mut alice = Bus::in_memory(&hub, quarry.clone(), AgentId(1), 0);
        let bob = Bus::in_memory(&hub, quarry.clone(), AgentId(2), 0);

        let mut bob_rx = bob.incoming();
        let mut alice_rx = alice.incoming();
        let mut bob_filter = SeqFilter::new(AgentId(2), quarry.clone());
        let mut alice_filter = SeqFilter::new(AgentId(1), quarry);

        alice.broadcast(heartbeat()).await.expect("send");

        let at_bob = bob_rx.next().await.expect("delivered");
        assert!(bob_filter.admit(&at_bob));
        // A replay of the same seq is dropped.
        assert!(!bob_filter.admit(&at_bob));

        // The sender's own copy never passes its filter.
        let at_alice = alice_rx.next().await.expect("delivered");
        assert!(!alice_filter.admit(&at_alice));
    }
}
