//! Overlay transporter: joins the DHT mesh for a topic and carries cluster
//! RPC and broadcast over libp2p connections.
//!
//! All swarm state lives in one task. Callers talk to it over a command
//! channel and receive [`ClusterEvent`]s on an ordered event channel.
//!
//! Discovery announces the topic's discovery key as a Kademlia provider
//! record and periodically looks up other providers, dialing every one it
//! does not know yet. Only peers that pass the application handshake
//! (same discovery key, same protocol version, matching identity) become
//! cluster nodes; other DHT participants stay connected for routing only.

use super::behaviour::{BehaviourConfig, NodeBehaviour, NodeBehaviourEvent};
use super::connections::{Admission, ConnectionTable};
use super::transport;
use crate::domain::{
    ClusterMessage, ClusterReply, NodeId, SignalError, SignalResult, Topic, SIGNAL_PROTOCOL_VERSION,
};
use crate::infrastructure::gossip::{GossipTransport, Inbound, DEFAULT_MAX_AGE};
use crate::infrastructure::wire::{Frame, Packet};
use crate::port::cluster_transport::{ClusterEvent, ClusterTransport, InboundCall};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::{
    identify, identity::Keypair, kad,
    multiaddr::Protocol,
    ping,
    request_response::{self, OutboundFailure, OutboundRequestId, ResponseChannel},
    swarm::{
        dial_opts::{DialOpts, PeerCondition},
        SwarmEvent,
    },
    Multiaddr, PeerId, Swarm,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const TOPIC_HANDSHAKE: &str = "handshake";
const TOPIC_CALL: &str = "call";
const TOPIC_EMIT: &str = "emit";
const TOPIC_REPLY: &str = "reply";
const TOPIC_BROADCAST: &str = "broadcast";

/// Discovery ticks between provider re-announcements.
const REANNOUNCE_TICKS: u32 = 6;

impl From<PeerId> for NodeId {
    fn from(peer: PeerId) -> Self {
        NodeId::new(peer.to_string())
    }
}

fn peer_of(node: &NodeId) -> SignalResult<PeerId> {
    node.as_str()
        .parse()
        .map_err(|_| SignalError::RpcUnreachable(node.clone()))
}

/// Configuration for the overlay.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Listen addresses for node-to-node connections.
    pub listen_addrs: Vec<Multiaddr>,
    /// DHT bootstrap nodes to connect to.
    pub bootstrap_nodes: Vec<(PeerId, Multiaddr)>,
    /// Enable mDNS for local peer discovery.
    pub enable_mdns: bool,
    /// Add QUIC next to TCP.
    pub enable_quic: bool,
    /// Also act as a DHT bootstrap responder on `bootstrap_port`.
    pub as_bootstrap: bool,
    pub bootstrap_port: u16,
    /// Node identity. Generated when absent.
    pub keypair: Option<Keypair>,
    /// Interval between DHT lookups for other nodes.
    pub discovery_interval: Duration,
    /// Node-to-node request timeout. Kept above the client offer timeout so
    /// a slow client surfaces as the owner's timeout, not a transport one.
    pub request_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_addrs: vec![Multiaddr::empty()
                .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
                .with(Protocol::Tcp(0))],
            bootstrap_nodes: vec![],
            enable_mdns: false,
            enable_quic: false,
            as_bootstrap: false,
            bootstrap_port: 4001,
            keypair: None,
            discovery_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Identity exchange sent as the first direct packet on a new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Handshake {
    node_id: String,
    discovery_key: String,
    version: u32,
}

/// Commands sent to the swarm event loop.
enum OverlayCommand {
    Call {
        peer: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<SignalResult<ClusterReply>>,
    },
    Emit {
        peer: PeerId,
        payload: Vec<u8>,
        reply: oneshot::Sender<SignalResult<()>>,
    },
    Broadcast {
        payload: Vec<u8>,
        reply: oneshot::Sender<usize>,
    },
    Respond {
        id: u64,
        reply: ClusterReply,
    },
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<()>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<NodeId>>,
    },
}

/// Pending requests tracking.
#[derive(Default)]
struct PendingRequests {
    handshakes: HashMap<OutboundRequestId, PeerId>,
    calls: HashMap<OutboundRequestId, oneshot::Sender<SignalResult<ClusterReply>>>,
    emits: HashMap<OutboundRequestId, oneshot::Sender<SignalResult<()>>>,
    inbound: HashMap<u64, ResponseChannel<Vec<u8>>>,
    next_inbound: u64,
}

/// libp2p-backed cluster transport.
pub struct OverlayTransporter {
    local_peer_id: PeerId,
    local_node: NodeId,
    discovery_key: [u8; 32],
    command_tx: mpsc::Sender<OverlayCommand>,
}

impl OverlayTransporter {
    /// Start the overlay for `topic`. Returns the transporter and the
    /// stream of cluster events.
    pub async fn new(
        config: OverlayConfig,
        topic: Topic,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClusterEvent>)> {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut overlay_loop = OverlayLoop::new(&config, topic, event_tx, command_tx.downgrade())?;
        let local_peer_id = overlay_loop.local_peer_id;

        overlay_loop.ensure_responder();
        overlay_loop.join_bootstrap(&config.bootstrap_nodes);

        tokio::spawn(overlay_loop.run(command_rx, config.discovery_interval));

        Ok((
            Self {
                local_peer_id,
                local_node: NodeId::from(local_peer_id),
                discovery_key: topic.discovery_key(),
                command_tx,
            },
            event_rx,
        ))
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn discovery_key(&self) -> [u8; 32] {
        self.discovery_key
    }

    /// Dial a peer at the given multiaddr.
    pub async fn dial(&self, addr: Multiaddr) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(OverlayCommand::Dial {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("Failed to send dial command"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("Dial response channel closed"))?
    }

    /// Get the addresses this node is listening on.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(OverlayCommand::ListenAddrs { reply: reply_tx })
            .await
            .is_err()
        {
            return vec![];
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Close every connection and stop the bootstrap responder. Every open
    /// node is reported as disconnected before this returns. Returns those nodes.
    pub async fn shutdown(&self) -> Vec<NodeId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(OverlayCommand::Shutdown { reply: reply_tx })
            .await
            .is_err()
        {
            return vec![];
        }
        reply_rx.await.unwrap_or_default()
    }

    async fn send_command(&self, command: OverlayCommand) -> SignalResult<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| SignalError::Transport("overlay is shut down".to_string()))
    }
}

#[async_trait]
impl ClusterTransport for OverlayTransporter {
    fn local_node_id(&self) -> NodeId {
        self.local_node.clone()
    }

    async fn nodes(&self) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        if self
            .send_command(OverlayCommand::Nodes { reply: tx })
            .await
            .is_err()
        {
            return vec![];
        }
        rx.await
            .unwrap_or_default()
            .into_iter()
            .map(NodeId::from)
            .collect()
    }

    async fn call(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<ClusterReply> {
        let peer = peer_of(node)?;
        let (tx, rx) = oneshot::channel();
        self.send_command(OverlayCommand::Call {
            peer,
            payload: message.to_bytes()?,
            reply: tx,
        })
        .await?;
        rx.await
            .map_err(|_| SignalError::Transport("call dropped by overlay".to_string()))?
    }

    async fn emit(&self, node: &NodeId, message: ClusterMessage) -> SignalResult<()> {
        let peer = peer_of(node)?;
        let (tx, rx) = oneshot::channel();
        self.send_command(OverlayCommand::Emit {
            peer,
            payload: message.to_bytes()?,
            reply: tx,
        })
        .await?;
        rx.await
            .map_err(|_| SignalError::Transport("emit dropped by overlay".to_string()))?
    }

    async fn broadcast(&self, message: ClusterMessage) -> SignalResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send_command(OverlayCommand::Broadcast {
            payload: message.to_bytes()?,
            reply: tx,
        })
        .await?;
        let sent = rx
            .await
            .map_err(|_| SignalError::Transport("broadcast dropped by overlay".to_string()))?;
        debug!("Broadcast {} to {} nodes", message.action(), sent);
        Ok(())
    }
}

/// State owned by the swarm task.
struct OverlayLoop {
    swarm: Swarm<NodeBehaviour>,
    local_peer_id: PeerId,
    table: ConnectionTable,
    gossip: GossipTransport<PeerId>,
    pending: PendingRequests,
    events: mpsc::UnboundedSender<ClusterEvent>,
    commands: mpsc::WeakSender<OverlayCommand>,
    discovery_key: kad::RecordKey,
    handshake: Vec<u8>,
    expected_key: String,
    request_timeout: Duration,
    announce_in: u32,
    responder: Option<ListenerId>,
    bootstrap_port: Option<u16>,
}

impl OverlayLoop {
    /// Build the swarm and listen on `listen_addrs`.
    fn new(
        config: &OverlayConfig,
        topic: Topic,
        events: mpsc::UnboundedSender<ClusterEvent>,
        commands: mpsc::WeakSender<OverlayCommand>,
    ) -> Result<Self> {
        let keypair = config
            .keypair
            .clone()
            .unwrap_or_else(Keypair::generate_ed25519);
        let local_peer_id = PeerId::from(keypair.public());
        let discovery_key = topic.discovery_key();

        info!("Local node ID: {}", local_peer_id);
        info!("Discovery key: {}", hex::encode(discovery_key));

        let transport = if config.enable_quic {
            transport::build_transport(&keypair)
        } else {
            transport::build_tcp_transport(&keypair)
        }
        .context("Failed to build transport")?;

        let behaviour = NodeBehaviour::new(
            local_peer_id,
            &keypair,
            BehaviourConfig {
                enable_mdns: config.enable_mdns,
                request_timeout: config.request_timeout,
                ..BehaviourConfig::default()
            },
        )?;

        // Connections are kept until ping fails or the overlay shuts down.
        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(u64::MAX));
        let mut swarm = Swarm::new(transport, behaviour, local_peer_id, swarm_config);

        for addr in &config.listen_addrs {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => info!("Listening on {}", addr),
                Err(e) => warn!("Failed to listen on {}: {}", addr, e),
            }
        }

        let handshake = Handshake {
            node_id: local_peer_id.to_string(),
            discovery_key: hex::encode(discovery_key),
            version: SIGNAL_PROTOCOL_VERSION,
        };

        Ok(Self {
            swarm,
            local_peer_id,
            table: ConnectionTable::new(local_peer_id),
            gossip: GossipTransport::new(local_peer_id.to_bytes()),
            pending: PendingRequests::default(),
            events,
            commands,
            discovery_key: kad::RecordKey::new(&discovery_key),
            handshake: serde_json::to_vec(&handshake)?,
            expected_key: handshake.discovery_key.clone(),
            request_timeout: config.request_timeout,
            announce_in: 0,
            responder: None,
            bootstrap_port: config.as_bootstrap.then_some(config.bootstrap_port),
        })
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<OverlayCommand>, discovery_interval: Duration) {
        let mut discovery = tokio::time::interval(discovery_interval);
        let mut prune = tokio::time::interval(DEFAULT_MAX_AGE);

        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(OverlayCommand::Shutdown { reply }) => {
                        let closed = self.shutdown();
                        let _ = reply.send(closed);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                _ = discovery.tick() => {
                    self.discover();
                }
                _ = prune.tick() => {
                    let pruned = self.gossip.prune(Instant::now());
                    if pruned > 0 {
                        debug!("Pruned {} gossip cache entries", pruned);
                    }
                }
            }
        }
        info!("Overlay stopped");
    }

    fn handle_command(&mut self, command: OverlayCommand) {
        match command {
            OverlayCommand::Call {
                peer,
                payload,
                reply,
            } => match self.gossip.direct(&peer, Packet::new(TOPIC_CALL, payload)) {
                Some(out) => {
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .messenger
                        .send_request(&out.to, out.frame);
                    self.pending.calls.insert(id, reply);
                }
                None => {
                    let _ = reply.send(Err(SignalError::RpcUnreachable(peer.into())));
                }
            },
            OverlayCommand::Emit {
                peer,
                payload,
                reply,
            } => match self.gossip.direct(&peer, Packet::new(TOPIC_EMIT, payload)) {
                Some(out) => {
                    let id = self
                        .swarm
                        .behaviour_mut()
                        .messenger
                        .send_request(&out.to, out.frame);
                    self.pending.emits.insert(id, reply);
                }
                None => {
                    let _ = reply.send(Err(SignalError::RpcUnreachable(peer.into())));
                }
            },
            OverlayCommand::Broadcast { payload, reply } => {
                let outbound = self
                    .gossip
                    .broadcast(Packet::new(TOPIC_BROADCAST, payload), Instant::now());
                let sent = outbound.len();
                for out in outbound {
                    self.swarm
                        .behaviour_mut()
                        .messenger
                        .send_request(&out.to, out.frame);
                }
                let _ = reply.send(sent);
            }
            OverlayCommand::Respond { id, reply } => {
                if let Some(channel) = self.pending.inbound.remove(&id) {
                    self.respond(channel, reply_frame(&reply));
                }
            }
            OverlayCommand::Dial { addr, reply } => {
                if let Some(Protocol::P2p(peer)) = addr.iter().last() {
                    self.table.dialing(peer);
                }
                let result = self
                    .swarm
                    .dial(addr.clone())
                    .map_err(|e| anyhow::anyhow!("Failed to dial {}: {:?}", addr, e));
                let _ = reply.send(result);
            }
            OverlayCommand::ListenAddrs { reply } => {
                let addrs: Vec<Multiaddr> = self.swarm.listeners().cloned().collect();
                let _ = reply.send(addrs);
            }
            OverlayCommand::Nodes { reply } => {
                let nodes = self.table.open_nodes().into_iter().map(|(p, _)| p).collect();
                let _ = reply.send(nodes);
            }
            OverlayCommand::Shutdown { reply } => {
                let _ = reply.send(self.shutdown());
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeBehaviourEvent::Messenger(event)) => {
                self.handle_messenger_event(event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Ping(event)) => {
                self.handle_ping_event(event);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(event)) => {
                self.handle_mdns_event(event);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let dialer = endpoint.is_dialer();
                debug!(
                    "Connection established with {} at {} (dialer: {})",
                    peer_id,
                    endpoint.get_remote_address(),
                    dialer
                );
                match self.table.on_established(peer_id, connection_id, dialer) {
                    Admission::Handshake { initiator: true } => {
                        let id = self
                            .swarm
                            .behaviour_mut()
                            .messenger
                            .send_request(&peer_id, handshake_frame(&self.handshake));
                        self.pending.handshakes.insert(id, peer_id);
                    }
                    Admission::Handshake { initiator: false } => {}
                    Admission::Duplicate { close, redirected } => {
                        debug!("{}", SignalError::DuplicateConnection(peer_id.into()));
                        if let Some(connection) = close {
                            self.swarm.close_connection(connection);
                        }
                        if let Some(initiator) = redirected {
                            debug!("Link to {} now initiated by {}", peer_id, if initiator { "us" } else { "them" });
                            self.emit_event(ClusterEvent::LinkRedirected {
                                node: peer_id.into(),
                                initiator,
                            });
                        }
                    }
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                if let Some(departure) = self.table.on_closed(&peer_id, connection_id) {
                    self.gossip.remove_peer(&peer_id);
                    if departure.was_open {
                        info!("Node disconnected: {}", peer_id);
                        self.emit_event(ClusterEvent::NodeDisconnected {
                            node: peer_id.into(),
                            initiator: departure.initiator,
                        });
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    debug!("{}", SignalError::Transport(format!("dial {} failed: {}", peer, error)));
                    self.table.on_dial_failed(&peer);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if self.responder == Some(listener_id) {
                    warn!("Bootstrap responder closed ({:?}), restarting", reason);
                    self.responder = None;
                    self.ensure_responder();
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                if self.responder == Some(listener_id) {
                    warn!("Bootstrap responder failed: {}, restarting", error);
                    self.swarm.remove_listener(listener_id);
                    self.responder = None;
                    self.ensure_responder();
                }
            }
            _ => {}
        }
    }

    fn handle_messenger_event(&mut self, event: request_response::Event<Vec<u8>, Vec<u8>>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.handle_inbound_frame(peer, request, channel);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    self.handle_response(peer, request_id, response);
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                let failure = match error {
                    OutboundFailure::Timeout => SignalError::Timeout(self.request_timeout),
                    other => SignalError::Transport(other.to_string()),
                };
                if self.pending.handshakes.remove(&request_id).is_some() {
                    debug!("Handshake with {} failed: {}", peer, failure);
                } else if let Some(reply) = self.pending.calls.remove(&request_id) {
                    warn!("Call to {} failed: {}", peer, failure);
                    let _ = reply.send(Err(failure));
                } else if let Some(reply) = self.pending.emits.remove(&request_id) {
                    let _ = reply.send(Err(failure));
                } else {
                    debug!("Frame to {} not delivered: {}", peer, failure);
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!("Inbound frame from {} failed: {}", peer, error);
            }
            _ => {}
        }
    }

    fn handle_inbound_frame(&mut self, peer: PeerId, bytes: Vec<u8>, channel: ResponseChannel<Vec<u8>>) {
        let inbound = match self.gossip.on_frame(&peer, &bytes, Instant::now()) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", peer, e);
                self.respond(channel, Vec::new());
                return;
            }
        };

        match inbound {
            Inbound::Direct(packet) if packet.topic == TOPIC_HANDSHAKE => {
                self.accept_handshake(peer, &packet.data, channel);
            }
            Inbound::Direct(packet) if !self.table.is_open(&peer) => {
                debug!("Ignoring {} from {} before handshake", packet.topic, peer);
                self.respond(
                    channel,
                    reply_frame(&ClusterReply::Failed {
                        message: "handshake required".to_string(),
                    }),
                );
            }
            Inbound::Direct(packet) if packet.topic == TOPIC_CALL => {
                self.accept_call(peer, &packet.data, Some(channel));
            }
            Inbound::Direct(packet) if packet.topic == TOPIC_EMIT => {
                self.respond(channel, Vec::new());
                self.accept_call(peer, &packet.data, None);
            }
            Inbound::Direct(packet) => {
                debug!("Unknown direct topic {} from {}", packet.topic, peer);
                self.respond(channel, Vec::new());
            }
            Inbound::Broadcast {
                origin,
                packet,
                forward,
            } => {
                self.respond(channel, Vec::new());
                for out in forward {
                    self.swarm
                        .behaviour_mut()
                        .messenger
                        .send_request(&out.to, out.frame);
                }
                self.deliver_broadcast(&origin, packet);
            }
            Inbound::Duplicate => {
                self.respond(channel, Vec::new());
            }
            Inbound::Rejected => {
                debug!("Ignoring broadcast from {} before handshake", peer);
                self.respond(channel, Vec::new());
            }
        }
    }

    fn accept_handshake(&mut self, peer: PeerId, data: &[u8], channel: ResponseChannel<Vec<u8>>) {
        match self.check_handshake(&peer, data) {
            Ok(()) => {
                self.respond(channel, handshake_frame(&self.handshake));
                self.complete_handshake(peer);
            }
            Err(reason) => {
                warn!("Rejected handshake from {}: {}", peer, reason);
                self.respond(channel, Vec::new());
            }
        }
    }

    fn accept_call(&mut self, peer: PeerId, data: &[u8], channel: Option<ResponseChannel<Vec<u8>>>) {
        let message = match ClusterMessage::from_bytes(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable call from {}: {}", peer, e);
                if let Some(channel) = channel {
                    self.respond(channel, reply_frame(&ClusterReply::from_error(&e)));
                }
                return;
            }
        };

        let Some(channel) = channel else {
            self.emit_event(ClusterEvent::Call(InboundCall {
                from: peer.into(),
                message,
                reply: None,
            }));
            return;
        };

        let id = self.pending.next_inbound;
        self.pending.next_inbound += 1;
        self.pending.inbound.insert(id, channel);

        let (tx, rx) = oneshot::channel();
        self.emit_event(ClusterEvent::Call(InboundCall {
            from: peer.into(),
            message,
            reply: Some(tx),
        }));

        let commands = self.commands.clone();
        tokio::spawn(async move {
            let reply = rx.await.unwrap_or_else(|_| ClusterReply::Failed {
                message: "call was not handled".to_string(),
            });
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(OverlayCommand::Respond { id, reply }).await;
            }
        });
    }

    fn deliver_broadcast(&mut self, origin: &[u8], packet: Packet) {
        if packet.topic != TOPIC_BROADCAST {
            debug!("Unknown broadcast topic {}", packet.topic);
            return;
        }
        let Ok(from) = PeerId::from_bytes(origin) else {
            warn!("Broadcast with invalid origin");
            return;
        };
        match ClusterMessage::from_bytes(&packet.data) {
            Ok(message) => self.emit_event(ClusterEvent::Broadcast {
                from: from.into(),
                message,
            }),
            Err(e) => warn!("Undecodable broadcast from {}: {}", from, e),
        }
    }

    fn handle_response(&mut self, peer: PeerId, request_id: OutboundRequestId, response: Vec<u8>) {
        if self.pending.handshakes.remove(&request_id).is_some() {
            let result = match Frame::decode(&response) {
                Ok(Frame::Direct(packet)) if packet.topic == TOPIC_HANDSHAKE => {
                    self.check_handshake(&peer, &packet.data)
                }
                _ => Err("peer does not speak the signal protocol".to_string()),
            };
            match result {
                Ok(()) => self.complete_handshake(peer),
                Err(reason) => debug!("Handshake with {} failed: {}", peer, reason),
            }
            return;
        }

        if let Some(reply) = self.pending.calls.remove(&request_id) {
            let result = match Frame::decode(&response) {
                Ok(Frame::Direct(packet)) if packet.topic == TOPIC_REPLY => {
                    ClusterReply::from_bytes(&packet.data)
                }
                Ok(_) => Err(SignalError::InvalidMessage("unexpected reply frame".to_string())),
                Err(e) => Err(e.into()),
            };
            let _ = reply.send(result);
            return;
        }

        if let Some(reply) = self.pending.emits.remove(&request_id) {
            let _ = reply.send(Ok(()));
        }
    }

    fn check_handshake(&self, peer: &PeerId, data: &[u8]) -> Result<(), String> {
        let handshake: Handshake = serde_json::from_slice(data).map_err(|e| e.to_string())?;
        if handshake.node_id != peer.to_string() {
            return Err(format!("identity mismatch: claims {}", handshake.node_id));
        }
        if handshake.version != SIGNAL_PROTOCOL_VERSION {
            return Err(format!("protocol version {}", handshake.version));
        }
        if handshake.discovery_key != self.expected_key {
            return Err("different topic".to_string());
        }
        Ok(())
    }

    fn complete_handshake(&mut self, peer: PeerId) {
        if let Some(initiator) = self.table.on_handshake_complete(&peer) {
            self.gossip.add_peer(peer);
            info!("Node connected: {} (initiator: {})", peer, initiator);
            self.emit_event(ClusterEvent::NodeConnected {
                node: peer.into(),
                initiator,
            });
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { result, .. } => match result {
                kad::QueryResult::StartProviding(Ok(_)) => {
                    debug!("Announced discovery key");
                }
                kad::QueryResult::StartProviding(Err(e)) => {
                    debug!("Announce failed, retrying: {:?}", e);
                    self.announce_in = 0;
                }
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    for provider in providers {
                        self.dial_node(provider);
                    }
                }
                kad::QueryResult::GetProviders(Err(e)) => {
                    debug!("Provider lookup failed: {:?}", e);
                }
                kad::QueryResult::Bootstrap(Err(e)) => {
                    debug!("Kademlia bootstrap failed: {:?}", e);
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!("Kademlia routing updated for peer: {}", peer);
            }
            _ => {}
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            debug!(
                "Identified peer {}: {} with {} addresses",
                peer_id,
                info.agent_version,
                info.listen_addrs.len()
            );
            for addr in &info.listen_addrs {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(&peer_id, addr.clone());
            }
        }
    }

    fn handle_ping_event(&mut self, event: ping::Event) {
        if let Err(e) = event.result {
            warn!("Ping to {} failed: {}, closing connection", event.peer, e);
            self.swarm.close_connection(event.connection);
        }
    }

    fn handle_mdns_event(&mut self, event: libp2p::mdns::Event) {
        match event {
            libp2p::mdns::Event::Discovered(peers) => {
                for (peer_id, addr) in peers {
                    debug!("mDNS discovered peer {} at {}", peer_id, addr);
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                    self.dial_node(peer_id);
                }
            }
            libp2p::mdns::Event::Expired(peers) => {
                for (peer_id, addr) in peers {
                    debug!("mDNS peer expired: {} at {}", peer_id, addr);
                }
            }
        }
    }

    /// Announce (every few ticks, or after a failure) and look up the discovery key.
    fn discover(&mut self) {
        if self.announce_in == 0 {
            match self
                .swarm
                .behaviour_mut()
                .kademlia
                .start_providing(self.discovery_key.clone())
            {
                Ok(_) => self.announce_in = REANNOUNCE_TICKS,
                Err(e) => warn!("Failed to announce discovery key: {:?}", e),
            }
        } else {
            self.announce_in -= 1;
        }
        self.swarm
            .behaviour_mut()
            .kademlia
            .get_providers(self.discovery_key.clone());

        if self.bootstrap_port.is_some() && self.responder.is_none() {
            self.ensure_responder();
        }
    }

    fn dial_node(&mut self, peer: PeerId) {
        if peer == self.local_peer_id || self.table.is_known(&peer) {
            return;
        }
        self.table.dialing(peer);
        let opts = DialOpts::peer_id(peer)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .build();
        if let Err(e) = self.swarm.dial(opts) {
            debug!("Dial {} failed: {}", peer, e);
            self.table.on_dial_failed(&peer);
        }
    }

    fn join_bootstrap(&mut self, nodes: &[(PeerId, Multiaddr)]) {
        for (peer_id, addr) in nodes {
            self.swarm
                .behaviour_mut()
                .kademlia
                .add_address(peer_id, addr.clone());
            info!("Added bootstrap node: {} at {}", peer_id, addr);
            self.dial_node(*peer_id);
        }
        if !nodes.is_empty() {
            if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
                warn!("Failed to bootstrap Kademlia: {:?}", e);
            }
        }
    }

    /// (Re)start the bootstrap responder listener. Failures are logged and
    /// retried on the next discovery tick.
    fn ensure_responder(&mut self) {
        let Some(port) = self.bootstrap_port else {
            return;
        };
        if self.responder.is_some() {
            return;
        }
        let addr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::UNSPECIFIED))
            .with(Protocol::Tcp(port));
        match self.swarm.listen_on(addr.clone()) {
            Ok(id) => {
                info!("Bootstrap responder listening on {}", addr);
                self.responder = Some(id);
            }
            Err(e) => warn!("Bootstrap responder failed to listen on {}: {}", addr, e),
        }
    }

    fn shutdown(&mut self) -> Vec<NodeId> {
        let open = self.table.open_nodes();
        let mut closed = Vec::with_capacity(open.len());
        for (peer, initiator) in open {
            self.gossip.remove_peer(&peer);
            self.emit_event(ClusterEvent::NodeDisconnected {
                node: peer.into(),
                initiator,
            });
            closed.push(NodeId::from(peer));
        }

        let connected: Vec<PeerId> = self.swarm.connected_peers().copied().collect();
        for peer in connected {
            let _ = self.swarm.disconnect_peer_id(peer);
        }
        if let Some(id) = self.responder.take() {
            self.swarm.remove_listener(id);
        }
        self.bootstrap_port = None;

        for (_, reply) in self.pending.calls.drain() {
            let _ = reply.send(Err(SignalError::Transport("overlay closed".to_string())));
        }
        for (_, reply) in self.pending.emits.drain() {
            let _ = reply.send(Err(SignalError::Transport("overlay closed".to_string())));
        }
        info!("Overlay closed, {} nodes disconnected", closed.len());
        closed
    }

    fn respond(&mut self, channel: ResponseChannel<Vec<u8>>, frame: Vec<u8>) {
        if self
            .swarm
            .behaviour_mut()
            .messenger
            .send_response(channel, frame)
            .is_err()
        {
            debug!("Response channel closed before reply");
        }
    }

    fn emit_event(&self, event: ClusterEvent) {
        if self.events.send(event).is_err() {
            debug!("No receiver for cluster events");
        }
    }
}

fn handshake_frame(handshake: &[u8]) -> Vec<u8> {
    Frame::Direct(Packet::new(TOPIC_HANDSHAKE, handshake.to_vec())).encode()
}

fn reply_frame(reply: &ClusterReply) -> Vec<u8> {
    let data = reply.to_bytes().unwrap_or_default();
    Frame::Direct(Packet::new(TOPIC_REPLY, data)).encode()
}
