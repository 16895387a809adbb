//! Application services - cluster sync, presence and signal relay, plus node wiring.

pub mod cluster_sync;
pub mod dispatcher;
pub mod node;
pub mod presence_service;
pub mod services;
pub mod signal_relay;

pub use cluster_sync::{ClusterSync, PushReport, SharedDirectory};
pub use node::{SignalNode, SignalNodeConfig};
pub use presence_service::PresenceService;
pub use services::{NodeServices, ServiceSettings};
pub use signal_relay::SignalRelay;
