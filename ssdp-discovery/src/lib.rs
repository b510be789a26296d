//! SSDP-style service discovery over IP multicast.
//!
//! [`SsdpDiscovery`] runs a server role that answers `M-SEARCH` requests for
//! locally registered services and a client role that searches for them.

pub mod api;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod registry;
pub mod server;
pub mod transport;

pub use config::DiscoveryConfig;
pub use discovery::{Backoff, DiscoveryState, ReadySignal, SsdpDiscovery, StartSignals};
pub use error::DiscoveryError;
