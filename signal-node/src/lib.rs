pub mod application_service;
pub mod domain;
pub mod infrastructure;
pub mod port;
pub mod presentation;
pub mod test_utils;

pub use domain::*;
pub use port::*;

pub use application_service::node::{SignalNode, SignalNodeConfig};
