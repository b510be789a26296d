use std::net::{Ipv4Addr, SocketAddrV4};

/// SSDP multicast group all search requests are sent to
pub const SSDP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;

/// Fixed search target identifying this runtime's discovery service class
pub const SERVICE_UUID: &str = "1693326a-abb9-11e4-8dfb-9cb654a16426";

/// Default host used in the LOCATION header of search responses
pub const LOCATION_HOST: &str = "calvin@github.se";

/// MX value sent in search requests
pub const DEFAULT_MX: u32 = 2;

/// Upper bound on a responder's randomized reply delay, whatever MX says
pub const MAX_REPLY_DELAY_SECS: u32 = 5;

pub const CACHE_MAX_AGE_SECS: u32 = 1800;

/// Stands for "the address the request arrived from" in a service registration
pub const WILDCARD_ADDR: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

pub fn ssdp_socket_addr() -> SocketAddrV4 {
    SocketAddrV4::new(SSDP_ADDR, SSDP_PORT)
}
