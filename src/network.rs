//! Gossip-network provider: the abstract capability the defense drives, plus a
//! libp2p gossipsub implementation that runs the swarm on its own task.

use crate::{
    config,
    error::{DefenseError, DefenseResult},
    relay::FriendNode,
    subnet::SubnetId,
};
use async_trait::async_trait;
use libp2p::gossipsub::{
    AllowAllSubscriptionFilter, Behaviour as Gossipsub, Event as GossipsubEvent, IdentTopic,
    IdentityTransform, MessageAuthenticity,
};
use libp2p::{
    core::muxing::StreamMuxerBox, futures::StreamExt, gossipsub, identity, quic,
    swarm::SwarmEvent, Multiaddr, PeerId, Swarm, Transport,
};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// What the core needs from the peer-to-peer layer. Every call may fail
/// transiently; callers bound each one with their own timeout.
#[async_trait]
pub trait GossipNetwork: Send + Sync {
    async fn subscribe(&self, subnet: SubnetId) -> DefenseResult<()>;
    async fn unsubscribe(&self, subnet: SubnetId) -> DefenseResult<()>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DefenseResult<()>;
    async fn push_to_peer(&self, friend: &FriendNode, payload: Vec<u8>) -> DefenseResult<()>;
}

/// Topic a friend listens on for envelopes addressed to it.
pub fn relay_topic(peer_id: &str) -> String {
    format!("/stealth-relay/1/{}", peer_id)
}

#[derive(Debug)]
enum NetworkCommand {
    Subscribe { subnet: SubnetId, reply: oneshot::Sender<DefenseResult<()>> },
    Unsubscribe { subnet: SubnetId, reply: oneshot::Sender<DefenseResult<()>> },
    Publish { topic: String, data: Vec<u8>, reply: oneshot::Sender<DefenseResult<()>> },
    Push { address: Option<Multiaddr>, topic: String, data: Vec<u8>, reply: oneshot::Sender<DefenseResult<()>> },
}

/// Handle to the gossipsub swarm task.
#[derive(Clone)]
pub struct GossipsubNetwork {
    command_tx: mpsc::UnboundedSender<NetworkCommand>,
    inbound_tx: broadcast::Sender<Vec<u8>>,
    peers: Arc<AtomicUsize>,
    local_peer_id: PeerId,
    fork_digest: String,
}

pub fn load_or_create_peer_identity(path: &str) -> anyhow::Result<identity::Keypair> {
    if Path::new(path).exists() {
        let key_data = fs::read(path)?;
        return Ok(identity::Keypair::from_protobuf_encoding(&key_data)?);
    }
    let keypair = identity::Keypair::generate_ed25519();
    fs::write(path, keypair.to_protobuf_encoding()?)?;
    Ok(keypair)
}

fn transient<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> DefenseError {
    move |e| DefenseError::TransientNetwork(format!("{}: {}", context, e))
}

impl GossipsubNetwork {
    pub async fn spawn(net_cfg: config::Net) -> anyhow::Result<Self> {
        let id_keys = load_or_create_peer_identity(&net_cfg.identity_path)?;
        let peer_id = PeerId::from(id_keys.public());
        info!("🆔 Local peer ID: {}", peer_id);

        let transport = quic::tokio::Transport::new(quic::Config::new(&id_keys))
            .map(|(peer_id, muxer), _| (peer_id, StreamMuxerBox::new(muxer)))
            .boxed();

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(std::time::Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .mesh_n_low(0)
            .mesh_outbound_min(0)
            .flood_publish(true)
            .build()?;

        let mut gs: Gossipsub<IdentityTransform, AllowAllSubscriptionFilter> =
            Gossipsub::new(MessageAuthenticity::Signed(id_keys.clone()), gossipsub_config)
                .map_err(|e| anyhow::anyhow!(e))?;
        let own_relay_topic = relay_topic(&peer_id.to_string());
        gs.subscribe(&IdentTopic::new(own_relay_topic.clone()))?;

        let mut swarm = Swarm::new(
            transport,
            gs,
            peer_id,
            libp2p::swarm::Config::with_tokio_executor()
                .with_idle_connection_timeout(std::time::Duration::from_secs(60)),
        );

        let mut port = net_cfg.listen_port;
        loop {
            let listen_addr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", port);
            match swarm.listen_on(listen_addr.parse()?) {
                Ok(_) => break,
                Err(e) if e.to_string().contains("Address already in use") => {
                    port += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        for addr in &net_cfg.bootstrap {
            debug!("🔗 Dialing bootstrap node: {}", addr);
            match addr.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma) {
                        warn!("❌ Failed to dial bootstrap node {}: {}", addr, e);
                    }
                }
                Err(e) => warn!("❌ Invalid bootstrap address {}: {}", addr, e),
            }
        }

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<NetworkCommand>();
        let (inbound_tx, _) = broadcast::channel(256);
        let peers = Arc::new(AtomicUsize::new(0));

        let handle = Self {
            command_tx,
            inbound_tx: inbound_tx.clone(),
            peers: peers.clone(),
            local_peer_id: peer_id,
            fork_digest: net_cfg.fork_digest.clone(),
        };

        tokio::spawn(async move {
            let mut connected: HashSet<PeerId> = HashSet::new();
            loop {
                tokio::select! {
                    event = swarm.select_next_some() => match event {
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            debug!("🤝 Connected to peer: {}", peer_id);
                            connected.insert(peer_id);
                            peers.store(connected.len(), Ordering::Relaxed);
                        }
                        SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                            debug!("👋 Disconnected from peer: {} due to {:?}", peer_id, cause);
                            connected.remove(&peer_id);
                            peers.store(connected.len(), Ordering::Relaxed);
                        }
                        SwarmEvent::Behaviour(GossipsubEvent::Message { message, .. }) => {
                            if message.topic.as_str() == own_relay_topic {
                                let _ = inbound_tx.send(message.data);
                            }
                        }
                        _ => {}
                    },
                    Some(command) = command_rx.recv() => match command {
                        NetworkCommand::Subscribe { subnet, reply } => {
                            let topic = IdentTopic::new(subnet.topic(&net_cfg.fork_digest));
                            let res = swarm.behaviour_mut().subscribe(&topic)
                                .map(|_| ())
                                .map_err(transient("subscribe"));
                            let _ = reply.send(res);
                        }
                        NetworkCommand::Unsubscribe { subnet, reply } => {
                            let topic = IdentTopic::new(subnet.topic(&net_cfg.fork_digest));
                            let res = swarm.behaviour_mut().unsubscribe(&topic)
                                .map(|_| ())
                                .map_err(transient("unsubscribe"));
                            let _ = reply.send(res);
                        }
                        NetworkCommand::Publish { topic, data, reply } => {
                            let res = swarm.behaviour_mut().publish(IdentTopic::new(topic), data)
                                .map(|_| ())
                                .map_err(transient("publish"));
                            let _ = reply.send(res);
                        }
                        NetworkCommand::Push { address, topic, data, reply } => {
                            if let Some(addr) = address {
                                if let Err(e) = swarm.dial(addr) {
                                    debug!("friend dial skipped: {}", e);
                                }
                            }
                            let res = swarm.behaviour_mut().publish(IdentTopic::new(topic), data)
                                .map(|_| ())
                                .map_err(transient("push"));
                            let _ = reply.send(res);
                        }
                    },
                }
            }
        });

        Ok(handle)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn fork_digest(&self) -> &str {
        &self.fork_digest
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    /// Raw relay envelopes addressed to this node by its friends.
    pub fn inbound_relays(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inbound_tx.subscribe()
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<DefenseResult<()>>) -> NetworkCommand,
    ) -> DefenseResult<()> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .map_err(|_| DefenseError::TransientNetwork("network task stopped".into()))?;
        rx.await
            .map_err(|_| DefenseError::TransientNetwork("network task dropped reply".into()))?
    }
}

#[async_trait]
impl GossipNetwork for GossipsubNetwork {
    async fn subscribe(&self, subnet: SubnetId) -> DefenseResult<()> {
        self.request(|reply| NetworkCommand::Subscribe { subnet, reply }).await
    }

    async fn unsubscribe(&self, subnet: SubnetId) -> DefenseResult<()> {
        self.request(|reply| NetworkCommand::Unsubscribe { subnet, reply }).await
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> DefenseResult<()> {
        let topic = topic.to_string();
        self.request(|reply| NetworkCommand::Publish { topic, data: payload, reply }).await
    }

    async fn push_to_peer(&self, friend: &FriendNode, payload: Vec<u8>) -> DefenseResult<()> {
        let address = friend.address.parse::<Multiaddr>().ok();
        let topic = relay_topic(&friend.peer_id);
        self.request(|reply| NetworkCommand::Push { address, topic, data: payload, reply }).await
    }
}
