use std::net::{IpAddr, SocketAddr};
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// A service advertised by the local server role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Opaque service identifier, e.g. "store"
    pub id: String,

    /// Advertised address; `0.0.0.0` means "whatever address the request reached us on"
    pub address: IpAddr,

    pub port: u16,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, address: IpAddr, port: u16) -> Self {
        Self {
            id: id.into(),
            address,
            port,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.address.is_unspecified()
    }

    /// Address to advertise to a requester that contacted us from `source`
    pub fn resolve(&self, source: IpAddr) -> SocketAddr {
        if self.is_wildcard() {
            SocketAddr::new(source, self.port)
        } else {
            SocketAddr::new(self.address, self.port)
        }
    }
}

/// A peer reported by a search response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    /// Service id the search was filtered on; `None` for an unfiltered search
    pub service: Option<String>,

    /// Address and port taken from the SERVER header
    pub address: SocketAddr,

    /// Last time a response for this peer was delivered
    pub last_seen: DateTime<Utc>,
}
