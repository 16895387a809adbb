//! libp2p behaviour composition for the signal overlay.

use super::protocol::{FrameCodec, KAD_PROTOCOL, MESSENGER_PROTOCOL};
use libp2p::{
    identify, identity::Keypair, kad, mdns, ping, request_response,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    PeerId, StreamProtocol,
};
use std::time::Duration;

/// Agent string advertised through identify.
pub const AGENT_VERSION: &str = concat!("signal-node/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct BehaviourConfig {
    pub enable_mdns: bool,
    pub request_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for BehaviourConfig {
    fn default() -> Self {
        Self {
            enable_mdns: false,
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(15),
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    /// DHT used to announce and look up the topic's discovery key.
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    /// Liveness. A failed ping closes the connection.
    pub ping: ping::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Direct and broadcast frames between nodes.
    pub messenger: request_response::Behaviour<FrameCodec>,
}

impl NodeBehaviour {
    pub fn new(local_peer_id: PeerId, keypair: &Keypair, config: BehaviourConfig) -> anyhow::Result<Self> {
        let mut kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
        kad_config.set_query_timeout(Duration::from_secs(30));
        let mut kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad_config,
        );
        // Nodes rarely learn a confirmed external address; answer DHT queries anyway.
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new("/signal-mesh/1.0.0".to_string(), keypair.public())
                .with_agent_version(AGENT_VERSION.to_string()),
        );

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(config.ping_interval));

        let mdns = if config.enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        let messenger = request_response::Behaviour::with_codec(
            FrameCodec,
            [(
                StreamProtocol::new(MESSENGER_PROTOCOL),
                request_response::ProtocolSupport::Full,
            )],
            request_response::Config::default().with_request_timeout(config.request_timeout),
        );

        Ok(Self {
            kademlia,
            identify,
            ping,
            mdns: Toggle::from(mdns),
            messenger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_behaviour_builds_without_mdns() {
        let keypair = Keypair::generate_ed25519();
        let peer_id = PeerId::from(keypair.public());
        let behaviour = NodeBehaviour::new(peer_id, &keypair, BehaviourConfig::default());
        assert!(behaviour.is_ok());
        assert!(!behaviour.unwrap().mdns.is_enabled());
    }
}
