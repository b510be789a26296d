use std::collections::BTreeMap;
use std::net::IpAddr;
use shared::types::ServiceRecord;

/// Services advertised by the server role, keyed by service id.
///
/// Owned by a single task; no internal locking.
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceRecord>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Re-registering an id replaces the previous record.
    pub fn add(&mut self, id: impl Into<String>, address: IpAddr, port: u16) {
        let record = ServiceRecord::new(id, address, port);
        self.services.insert(record.id.clone(), record);
    }

    /// Remove a service; unknown ids are ignored
    pub fn remove(&mut self, id: &str) {
        self.services.remove(id);
    }

    pub fn all(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_reregistration_overwrites() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9000);
        registry.add("store", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 9001);

        let all: Vec<_> = registry.all().collect();
        assert_eq!(all.len(), 1, "Same id must not produce two records");
        assert_eq!(all[0].address, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(all[0].port, 9001);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

        registry.remove("missing");
        assert_eq!(registry.len(), 1);

        registry.remove("store");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wildcard_is_stored_unresolved() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

        let record = registry.all().next().unwrap();
        assert!(record.is_wildcard());
    }
}
