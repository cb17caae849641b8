//! The relay state machine: one instance per accepted connection.
//!
//! A relay moves through three phases.  `Handshaking` covers the first
//! frame: the peer announces itself with a block, queues and pipes get
//! created, flow-network edges are added, and a genesis announcement is
//! persisted and broadcast to the other live beams.  `Relaying` is the
//! steady state driven by [`Relay::do_relaying`], one frame per call.
//! `Closed` is terminal; further calls are no-ops.
//!
//! Read failures and undecodable frames never panic the connection task;
//! they mark the beam not-alive and return zero bytes relayed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::net::TcpStream;

use crate::beacon::{BeaconRow, BeaconStore, StoreError};
use crate::beam::{Beam, BeamError};
use crate::block::{Block, BlockError};
use crate::crypto::{CryptoError, NodeKeypair};
use crate::flow_net::{FlowNetwork, PathError};
use crate::logging;
use crate::mlog;
use crate::packager::{self, NetworkCommand, Packet, PacketTarget, PackagerError, Unpacked};
use crate::publisher::{BlockPublisher, ChannelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Handshaking,
    Relaying,
    Closed,
}

/// What to do when a steady-state block has no route to its destination.
/// During the handshake a missing route always closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoPathPolicy {
    /// Log and discard the block, keep the connection.
    DropBlock,
    /// Treat the missing route as fatal for the connection.
    CloseConnection,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Routes longer than this are logged as suspect.
    pub max_route_length: usize,
    /// Capacity recorded on edges learned from connections; `None` means
    /// unbounded.
    pub default_capacity: Option<u64>,
    pub no_path_policy: NoPathPolicy,
    /// Version stamped on persisted beacon records.
    pub node_version: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            max_route_length: 8,
            default_capacity: Some(100),
            no_path_policy: NoPathPolicy::DropBlock,
            node_version: 1,
        }
    }
}

/// Last-observation gauges, shared with the status server.
#[derive(Default)]
pub struct RelayMetrics {
    pub block_process_ms: AtomicU64,
    pub data_received: AtomicU64,
    pub path_length: AtomicU64,
    pub data_published: AtomicU64,
    pub blocks_relayed: AtomicU64,
    pub connections: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub block_process_ms: u64,
    pub data_received: u64,
    pub path_length: u64,
    pub data_published: u64,
    pub blocks_relayed: u64,
    pub connections: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        RelayMetrics::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            block_process_ms: self.block_process_ms.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            path_length: self.path_length.load(Ordering::Relaxed),
            data_published: self.data_published.load(Ordering::Relaxed),
            blocks_relayed: self.blocks_relayed.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Observer hook for peer lifecycle: `(peer public key, action)` where the
/// action is one of `connect`, `ping`, `disconnect`, `broadcast`,
/// `synchronize`, `delivered`.
pub type PeerEventCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Everything a connection task needs beyond its socket.  Cheap to clone;
/// the store, registries, and metrics are shared handles.
#[derive(Clone)]
pub struct RelayContext {
    pub store: BeaconStore,
    pub pipes: ChannelRegistry,
    pub publisher: BlockPublisher,
    pub config: RelayConfig,
    pub metrics: Arc<RelayMetrics>,
    pub callback: Option<PeerEventCallback>,
    pub keypair: NodeKeypair,
}

impl RelayContext {
    pub fn new(store: BeaconStore, keypair: NodeKeypair, config: RelayConfig) -> Self {
        RelayContext {
            store,
            pipes: ChannelRegistry::new(),
            publisher: BlockPublisher::new(ChannelRegistry::new()),
            config,
            metrics: Arc::new(RelayMetrics::new()),
            callback: None,
            keypair,
        }
    }

    pub fn with_callback(mut self, callback: PeerEventCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Debug)]
pub enum RelayError {
    ConnectionClosed,
    Beam(BeamError),
    Packager(PackagerError),
    Block(BlockError),
    Store(StoreError),
    Crypto(CryptoError),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::ConnectionClosed => write!(f, "connection closed before handshake"),
            RelayError::Beam(e) => write!(f, "beam error: {e}"),
            RelayError::Packager(e) => write!(f, "packager error: {e}"),
            RelayError::Block(e) => write!(f, "block error: {e}"),
            RelayError::Store(e) => write!(f, "store error: {e}"),
            RelayError::Crypto(e) => write!(f, "crypto error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<BeamError> for RelayError {
    fn from(e: BeamError) -> Self {
        RelayError::Beam(e)
    }
}

impl From<PackagerError> for RelayError {
    fn from(e: PackagerError) -> Self {
        RelayError::Packager(e)
    }
}

impl From<BlockError> for RelayError {
    fn from(e: BlockError) -> Self {
        RelayError::Block(e)
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Store(e)
    }
}

impl From<CryptoError> for RelayError {
    fn from(e: CryptoError) -> Self {
        RelayError::Crypto(e)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Relay {
    pub phase: RelayPhase,
    beam: Beam,
    network: FlowNetwork,
    ctx: RelayContext,
    own_key: String,
    /// The peer's signing key, learned from the first frame.
    pub beam_pub_key: String,
    pub target_key: PacketTarget,
}

impl Relay {
    /// Run the handshake on a freshly accepted socket.
    ///
    /// Reads the peer's first frame, sets up the beam and its registries,
    /// records the peer in the flow network, and for a genesis announcement
    /// persists the beacon and broadcasts the connection to the other live
    /// beams.  A first frame carrying a signed command is dispatched and
    /// the handshake stops there, with none of that setup.  A failed
    /// one-hop relay of the first block closes the connection but still
    /// yields a (closed) relay.
    pub async fn accept(socket: TcpStream, ctx: RelayContext) -> Result<Relay, RelayError> {
        let own_key = ctx.keypair.public_key_b64()?;
        let beam = Beam::from_socket(
            socket,
            ctx.keypair.clone(),
            ctx.store.clone(),
            PacketTarget::Unknown,
        )?;
        Self::handshake(beam, ctx, own_key).await
    }

    /// Continue on an already-established beam, e.g. after an out-of-band
    /// negotiation.  The handshake frame is still expected first.
    pub async fn resume(beam: Beam, ctx: RelayContext) -> Result<Relay, RelayError> {
        let own_key = ctx.keypair.public_key_b64()?;
        Self::handshake(beam, ctx, own_key).await
    }

    async fn handshake(
        mut beam: Beam,
        ctx: RelayContext,
        own_key: String,
    ) -> Result<Relay, RelayError> {
        let frame = beam
            .read_frame()
            .await?
            .ok_or(RelayError::ConnectionClosed)?;
        let unpacked = packager::unpack(&frame, None)?;
        packager::check_verified(&unpacked.packet, unpacked.verified)?;

        let packet = unpacked.packet;
        let sender = packet.sender.clone();
        let target = packet.target.clone();
        beam.target_key = target.clone();

        // A pure command packet ends the handshake right here: the command
        // runs, but no chains are seeded and no edges or beacon records are
        // created for the sender.
        if let Some(cmd) = packet.command.as_ref() {
            if unpacked.verified_csig != Some(true) {
                return Err(RelayError::Packager(PackagerError::Authentication {
                    sender,
                }));
            }
            let mut relay = Relay {
                phase: RelayPhase::Handshaking,
                beam,
                network: FlowNetwork::new(),
                ctx,
                own_key,
                beam_pub_key: sender,
                target_key: target,
            };
            relay.execute_network_cmd(&packet, cmd.command).await?;
            relay.phase = RelayPhase::Closed;
            relay
                .ctx
                .metrics
                .connections
                .fetch_add(1, Ordering::Relaxed);
            return Ok(relay);
        }

        let mut block = Block::from_bytes(&packet.data)?;
        block.signature = Some(packet.sig.clone());

        ctx.pipes.ensure(&sender).await;
        ctx.pipes.ensure(target.to_wire()).await;
        ctx.publisher.queues().ensure(&sender).await;
        ctx.publisher.queues().ensure(target.to_wire()).await;

        beam.initialize_incoming_transmission(block.clone()).await?;
        beam.lock();

        let mut relay = Relay {
            phase: RelayPhase::Handshaking,
            beam,
            network: FlowNetwork::new(),
            ctx,
            own_key,
            beam_pub_key: sender.clone(),
            target_key: target.clone(),
        };

        if target.known().is_some() {
            relay.relay_message_by_one(&packet, &frame, true).await;
        }

        let capacity = relay.ctx.config.default_capacity;
        relay.network.add_edge(&relay.own_key, &sender, capacity);
        relay.network.add_edge(target.to_wire(), &sender, capacity);

        // A failed one-hop relay above already tore the beam down; a dead
        // connection must not be recorded as reachable or announced.
        if relay.beam.alive {
            if block.index == 0 {
                let peer_addr = relay.beam.peer_addr();
                relay.ctx.store.save_beacon(&BeaconRow {
                    pub_key: sender.clone(),
                    ipv4: peer_addr.ip().to_string(),
                    port: peer_addr.port(),
                    version: relay.ctx.config.node_version,
                    last_ping: now_secs(),
                })?;
                relay.ctx.store.mark_beam_alive(&sender, true)?;
                relay.broadcast_connected(&packet)?;
                relay.notify(&sender, "connect");
                mlog!(
                    "relay: new beacon {} from {}",
                    logging::peer_key(&sender),
                    peer_addr
                );
            } else {
                if relay.ctx.store.update_beacon(&sender)? {
                    relay.notify(&sender, "ping");
                }
                relay.ctx.store.mark_beam_alive(&sender, true)?;
                relay
                    .network
                    .add_edge(&sender, target.to_wire(), capacity);
            }
        }

        relay.phase = if relay.beam.alive {
            RelayPhase::Relaying
        } else {
            RelayPhase::Closed
        };

        relay.beam.save_new_pub_key(
            &sender,
            relay.beam.encryption_negotiated(),
            "relay peer",
        )?;
        relay
            .ctx
            .metrics
            .connections
            .fetch_add(1, Ordering::Relaxed);
        Ok(relay)
    }

    pub fn is_alive(&self) -> bool {
        self.phase == RelayPhase::Relaying && self.beam.alive
    }

    pub fn network(&self) -> &FlowNetwork {
        &self.network
    }

    pub fn beam(&self) -> &Beam {
        &self.beam
    }

    fn notify(&self, pub_key: &str, action: &str) {
        if let Some(callback) = &self.ctx.callback {
            callback(pub_key, action);
        }
    }

    /// Process the next frame from the peer.  Returns the number of raw
    /// bytes received; zero means the connection is done.
    pub async fn do_relaying(&mut self) -> usize {
        if self.phase != RelayPhase::Relaying {
            return 0;
        }

        let frame = match self.beam.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                mlog!(
                    "relay: {} disconnected",
                    logging::peer_key(&self.beam_pub_key)
                );
                self.close_connection().await;
                return 0;
            }
            Err(e) => {
                mlog!(
                    "relay: read error from {}: {}",
                    logging::peer_key(&self.beam_pub_key),
                    e
                );
                self.close_connection().await;
                return 0;
            }
        };

        let size = frame.len();
        self.ctx
            .metrics
            .data_received
            .store(size as u64, Ordering::Relaxed);

        let unpacked = match packager::unpack(&frame, self.beam.inbound_cipher()) {
            Ok(unpacked) => unpacked,
            Err(e) => {
                mlog!(
                    "relay: undecodable frame from {}: {}",
                    logging::peer_key(&self.beam_pub_key),
                    e
                );
                self.beam.unlock();
                self.close_connection().await;
                return 0;
            }
        };

        let started = Instant::now();
        if let Err(e) = self.relay_request(unpacked, &frame).await {
            mlog!(
                "relay: request from {} failed: {}",
                logging::peer_key(&self.beam_pub_key),
                e
            );
            self.close_connection().await;
            return 0;
        }
        self.ctx
            .metrics
            .block_process_ms
            .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        size
    }

    /// Steady-state handling of one decoded frame.
    async fn relay_request(&mut self, unpacked: Unpacked, raw: &[u8]) -> Result<(), RelayError> {
        let packet = unpacked.packet;

        // Once the channel cipher authenticates the transport the envelope
        // signature is no longer enforced per frame.
        if !self.beam.encryption_negotiated() {
            packager::check_verified(&packet, unpacked.verified)?;
        }

        if let Some(cmd) = packet.command.as_ref() {
            if unpacked.verified_csig == Some(true) {
                let command = cmd.command;
                self.execute_network_cmd(&packet, command).await?;
            } else {
                mlog!(
                    "relay: rejected unauthenticated {} command from {}",
                    cmd.command.name(),
                    logging::peer_key(&packet.sender)
                );
            }
            return Ok(());
        }

        let mut block = Block::from_bytes(&packet.data)?;
        block.signature = Some(packet.sig.clone());

        if self.ctx.store.update_beacon(&packet.sender)? {
            self.notify(&packet.sender, "ping");
        }

        self.beam.comm_bc.difficulty = block.difficulty;
        if let Err(e) = self.beam.comm_bc.insert(block.clone()) {
            mlog!(
                "relay: invalid block from {}: {}",
                logging::peer_key(&packet.sender),
                e
            );
            self.close_connection().await;
            return Ok(());
        }

        if packet.target.known() == Some(self.own_key.as_str()) {
            self.ctx
                .publisher
                .publish_message(&self.own_key, raw.to_vec())
                .await;
            self.notify(&packet.sender, "delivered");
            mlog!(
                "relay: block {} from {} delivered locally",
                block.index,
                logging::peer_key(&packet.sender)
            );
            return Ok(());
        }

        if block.index > 0 {
            self.relay_message_by_one(&packet, raw, false).await;
        }
        Ok(())
    }

    /// Forward a packet one hop along the shortest route to its target.
    ///
    /// During the handshake any routing failure is fatal for the
    /// connection.  In the steady state an unknown node closes the
    /// connection while a missing path follows the configured policy.
    async fn relay_message_by_one(&mut self, packet: &Packet, raw: &[u8], handshake: bool) {
        let Some(dest) = packet.target.known() else {
            return;
        };

        let path = match self.network.get_path(&packet.sender, dest) {
            Ok((path, _bottleneck)) => path,
            Err(PathError::NodeNotFound(node)) => {
                mlog!(
                    "relay: no route for {}: node {} unknown",
                    logging::peer_key(&packet.sender),
                    logging::peer_key(&node)
                );
                self.close_connection().await;
                return;
            }
            Err(PathError::NoPath { .. }) => {
                if handshake || self.ctx.config.no_path_policy == NoPathPolicy::CloseConnection {
                    mlog!(
                        "relay: no path from {} to {}, closing",
                        logging::peer_key(&packet.sender),
                        logging::peer_key(dest)
                    );
                    self.close_connection().await;
                } else {
                    mlog!(
                        "relay: no path from {} to {}, block dropped",
                        logging::peer_key(&packet.sender),
                        logging::peer_key(dest)
                    );
                }
                return;
            }
        };

        if path.len() > self.ctx.config.max_route_length {
            mlog!(
                "relay: route of {} hops: {}",
                path.len(),
                logging::route(&path)
            );
        }
        self.ctx
            .metrics
            .path_length
            .store(path.len() as u64, Ordering::Relaxed);

        if path.len() == 1 {
            return;
        }
        let next_hop = &path[1];

        if self.ctx.pipes.contains(next_hop).await {
            self.ctx.pipes.send(next_hop, packet.data.clone()).await;
        }
        self.ctx
            .publisher
            .publish_message(next_hop, raw.to_vec())
            .await;

        self.ctx
            .metrics
            .data_published
            .store(raw.len() as u64, Ordering::Relaxed);
        self.ctx
            .metrics
            .blocks_relayed
            .fetch_add(1, Ordering::Relaxed);
        mlog!(
            "relay: forwarded block from {} towards {} via {}",
            logging::peer_key(&packet.sender),
            logging::peer_key(dest),
            logging::peer_key(next_hop)
        );
    }

    /// Apply a verified network command.
    async fn execute_network_cmd(
        &mut self,
        packet: &Packet,
        command: NetworkCommand,
    ) -> Result<(), RelayError> {
        match command {
            NetworkCommand::Broadcast => self.process_broadcast_block(packet)?,
            NetworkCommand::Synchronize => {
                let mut block = Block::from_bytes(&packet.data)?;
                block.signature = Some(packet.sig.clone());
                self.beam.comm_bc.difficulty = block.difficulty;
                if let Err(e) = self.beam.comm_bc.insert(block) {
                    mlog!(
                        "relay: synchronize block from {} rejected: {}",
                        logging::peer_key(&packet.sender),
                        e
                    );
                }
            }
        }
        self.notify(&packet.sender, command.name());
        Ok(())
    }

    /// Merge a broadcast announcement into the local flow network: the
    /// command's data is a mined block whose payload is the announced
    /// peer's genesis packet.
    fn process_broadcast_block(&mut self, packet: &Packet) -> Result<(), RelayError> {
        let block = Block::from_bytes(&packet.data)?;
        let inner = packager::unpack(&block.data, None)?;
        if !inner.verified {
            mlog!(
                "relay: broadcast from {} wraps an unverifiable packet, ignored",
                logging::peer_key(&packet.sender)
            );
            return Ok(());
        }

        let Some(signed) = packet.command.as_ref() else {
            return Ok(());
        };
        let announced = &inner.packet.sender;
        let via = &signed.cpub;
        let capacity = self.ctx.config.default_capacity;
        self.network.add_edge(via, announced, capacity);
        self.network.add_edge(announced, via, capacity);
        mlog!(
            "relay: learned {} reachable via {}",
            logging::peer_key(announced),
            logging::peer_key(via)
        );
        Ok(())
    }

    /// Announce a newly connected beacon to every other live beam.
    ///
    /// The announcement block is mined onto `conn_bc` synchronously; the
    /// fan-out to the per-peer queues runs on its own task so a slow queue
    /// never stalls the handshake.
    fn broadcast_connected(&mut self, packet: &Packet) -> Result<(), RelayError> {
        let beams = self.ctx.store.list_ready_beams()?;
        let connected = packet.sender.clone();
        if beams.is_empty() {
            mlog!(
                "relay: no live beams to notify about {}",
                logging::peer_key(&connected)
            );
            return Ok(());
        }

        let inner = Packet {
            data: packet.data.clone(),
            sig: packet.sig.clone(),
            sender: packet.sender.clone(),
            target: packet.target.clone(),
            command: None,
        };
        let inner_bytes = packager::pack_packet(&inner)?;

        let difficulty = self.beam.conn_bc.difficulty;
        let mut announcement = self
            .beam
            .conn_bc
            .template_next_block(difficulty, inner_bytes)?;
        announcement.mine()?;
        self.beam.conn_bc.insert(announcement.clone())?;

        let signing_key = self.ctx.keypair.signing_key()?;
        let block_bytes = announcement.to_bytes()?;
        let sig = packager::sign_block(&signing_key, &block_bytes);
        let outgoing = Packet {
            data: block_bytes,
            sig,
            sender: self.own_key.clone(),
            target: packet.target.clone(),
            command: None,
        };
        let outgoing = packager::add_cmd(&outgoing, &signing_key, NetworkCommand::Broadcast);
        let raw = packager::pack_packet(&outgoing)?;

        let publisher = self.ctx.publisher.clone();
        tokio::spawn(async move {
            for beam in beams {
                if beam.pub_key == connected {
                    continue;
                }
                publisher.publish_message(&beam.pub_key, raw.clone()).await;
            }
        });
        Ok(())
    }

    /// Tear the connection down and forget the peer's live-beam record.
    pub async fn close_connection(&mut self) {
        if self.phase == RelayPhase::Closed {
            return;
        }
        self.beam.close().await;
        self.phase = RelayPhase::Closed;
        if let Err(e) = self.ctx.store.remove_alive_beam(&self.beam_pub_key) {
            mlog!(
                "relay: failed to drop live beam {}: {}",
                logging::peer_key(&self.beam_pub_key),
                e
            );
        }
        self.notify(&self.beam_pub_key, "disconnect");
    }
}
