//! The cluster services of one node, wired around a shared directory.

use super::cluster_sync::{ClusterSync, SharedDirectory, DEFAULT_SYNC_DELAY};
use super::presence_service::{PresenceService, DEFAULT_PUBLISH_DELAY};
use super::signal_relay::{SignalRelay, DEFAULT_OFFER_TIMEOUT};
use crate::domain::{NodeId, PeerDirectory};
use crate::port::cluster_transport::ClusterTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Timing knobs for the services.
#[derive(Debug, Clone, Copy)]
pub struct ServiceSettings {
    pub sync_delay: Duration,
    pub publish_delay: Duration,
    pub offer_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            sync_delay: DEFAULT_SYNC_DELAY,
            publish_delay: DEFAULT_PUBLISH_DELAY,
            offer_timeout: DEFAULT_OFFER_TIMEOUT,
        }
    }
}

pub struct NodeServices<T: ClusterTransport + 'static> {
    pub transport: Arc<T>,
    pub directory: SharedDirectory,
    pub sync: ClusterSync<T>,
    pub presence: PresenceService<T>,
    pub relay: SignalRelay<T>,
}

impl<T: ClusterTransport + 'static> NodeServices<T> {
    pub fn new(transport: Arc<T>, settings: ServiceSettings) -> Self {
        let directory: SharedDirectory = Arc::new(Mutex::new(PeerDirectory::new(transport.local_node_id())));
        Self {
            sync: ClusterSync::new(transport.clone(), directory.clone(), settings.sync_delay),
            presence: PresenceService::new(transport.clone(), settings.publish_delay),
            relay: SignalRelay::new(transport.clone(), directory.clone(), settings.offer_timeout),
            directory,
            transport,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.transport.local_node_id()
    }
}
