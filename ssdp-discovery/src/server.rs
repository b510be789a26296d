//! Server role: answers `M-SEARCH` requests for locally registered services.
//!
//! One task owns the multicast socket and the registry. Replies are delayed
//! by a random amount bounded by the request's MX so that many responders
//! do not answer a multicast query at the same instant.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use shared::codec::{self, RawMessage, SearchRequest, SearchResponse};
use shared::types::ServiceRecord;
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::registry::ServiceRegistry;
use crate::transport::Membership;

const MAX_DATAGRAM: usize = 2048;

pub enum ServerCommand {
    AddService(ServiceRecord),
    RemoveService(String),
    ListServices(oneshot::Sender<Vec<ServiceRecord>>),
    Shutdown,
}

/// Handle to the server role task
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<ServerCommand>,
}

/// What a responder needs to know to build its replies
#[derive(Debug, Clone)]
pub struct ReplySettings {
    pub service_uuid: String,
    pub location_host: String,
    pub max_reply_delay_secs: u32,
}

impl From<&DiscoveryConfig> for ReplySettings {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            service_uuid: config.service_uuid.clone(),
            location_host: config.location_host.clone(),
            max_reply_delay_secs: config.max_reply_delay_secs,
        }
    }
}

/// A response waiting for its randomized send time
#[derive(Debug, Clone)]
pub struct ScheduledReply {
    pub response: SearchResponse,
    pub destination: SocketAddr,
    pub delay: Duration,
}

type ReplyFuture = Pin<Box<dyn Future<Output = (Vec<u8>, SocketAddr)> + Send>>;

fn make_reply_future(reply: ScheduledReply) -> ReplyFuture {
    Box::pin(async move {
        tokio::time::sleep(reply.delay).await;
        (reply.response.encode(), reply.destination)
    })
}

impl ServerHandle {
    /// Spawn the server task on an already bound socket.
    ///
    /// `ready` fires with the local address once the receive loop runs.
    /// `membership` is left again on shutdown.
    pub fn spawn(
        socket: UdpSocket,
        membership: Option<Membership>,
        registry: ServiceRegistry,
        settings: ReplySettings,
        ready: oneshot::Sender<SocketAddr>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<ServerCommand>(64);
        let role = ServerRole {
            socket,
            membership,
            registry,
            settings,
        };
        let task = tokio::spawn(role.run(rx, ready));
        (Self { tx }, task)
    }

    pub async fn add_service(&self, id: &str, address: IpAddr, port: u16) -> Result<()> {
        self.send(ServerCommand::AddService(ServiceRecord::new(id, address, port)))
            .await
    }

    pub async fn remove_service(&self, id: &str) -> Result<()> {
        self.send(ServerCommand::RemoveService(id.to_string())).await
    }

    /// Snapshot of the registered services
    pub async fn services(&self) -> Result<Vec<ServiceRecord>> {
        let (reply, rx) = oneshot::channel();
        self.send(ServerCommand::ListServices(reply)).await?;
        rx.await.map_err(|_| DiscoveryError::ChannelClosed("server"))
    }

    /// Leave the multicast group and close the socket
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ServerCommand::Shutdown).await
    }

    async fn send(&self, cmd: ServerCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| DiscoveryError::ChannelClosed("server"))
    }
}

struct ServerRole {
    socket: UdpSocket,
    membership: Option<Membership>,
    registry: ServiceRegistry,
    settings: ReplySettings,
}

impl ServerRole {
    async fn run(mut self, mut rx: mpsc::Receiver<ServerCommand>, ready: oneshot::Sender<SocketAddr>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut pending: FuturesUnordered<ReplyFuture> = FuturesUnordered::new();

        match self.socket.local_addr() {
            Ok(addr) => {
                tracing::info!("SSDP server listening on {}", addr);
                let _ = ready.send(addr);
            }
            Err(e) => tracing::warn!("SSDP server has no local address: {}", e),
        }

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => {
                            for reply in self.handle_datagram(&buf[..len], source) {
                                tracing::debug!(
                                    "Replying to {} for {} in {:?}",
                                    reply.destination,
                                    reply.response.service,
                                    reply.delay
                                );
                                pending.push(make_reply_future(reply));
                            }
                        }
                        Err(e) => {
                            tracing::warn!("SSDP server receive error: {}", e);
                        }
                    }
                }

                Some((payload, destination)) = pending.next() => {
                    if let Err(e) = self.socket.send_to(&payload, destination).await {
                        tracing::warn!("Failed to send search response to {}: {}", destination, e);
                    }
                }

                cmd = rx.recv() => {
                    match cmd {
                        Some(ServerCommand::AddService(record)) => {
                            tracing::debug!("Registering {} at {}:{}", record.id, record.address, record.port);
                            self.registry.add(record.id, record.address, record.port);
                        }
                        Some(ServerCommand::RemoveService(id)) => {
                            tracing::debug!("Unregistering {}", id);
                            self.registry.remove(&id);
                        }
                        Some(ServerCommand::ListServices(reply)) => {
                            let _ = reply.send(self.registry.all().cloned().collect());
                        }
                        Some(ServerCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        if !pending.is_empty() {
            tracing::debug!("No transport, dropping {} pending search responses", pending.len());
        }

        if let Some(Membership { group, interface }) = self.membership {
            if let Err(e) = self.socket.leave_multicast_v4(group, interface) {
                tracing::warn!("Failed to leave {} on {}: {}", group, interface, e);
            }
        }

        tracing::info!("SSDP server shutting down");
    }

    fn handle_datagram(&self, data: &[u8], source: SocketAddr) -> Vec<ScheduledReply> {
        match codec::decode(data) {
            Ok(raw) => {
                tracing::debug!("Received {:?}, {:?} from {}", raw.command, raw.headers, source);
                plan_replies(&raw, source, &self.registry, &self.settings)
            }
            Err(e) => {
                tracing::debug!("Dropping datagram from {}: {}", source, e);
                Vec::new()
            }
        }
    }
}

/// Build one reply per registered service for a search aimed at our UUID.
///
/// Wildcard registrations advertise the address the request came from.
pub fn plan_replies(
    raw: &RawMessage,
    source: SocketAddr,
    registry: &ServiceRegistry,
    settings: &ReplySettings,
) -> Vec<ScheduledReply> {
    if !raw.is_search_request() || !raw.targets(&settings.service_uuid) {
        return Vec::new();
    }

    let Some(request) = SearchRequest::from_raw(raw) else {
        tracing::warn!("Ignoring M-SEARCH from {} with invalid MX", source);
        return Vec::new();
    };
    let max_delay_ms = u64::from(request.max_delay_secs.min(settings.max_reply_delay_secs)) * 1000;

    registry
        .all()
        .map(|record| {
            let advertised = record.resolve(source.ip());
            ScheduledReply {
                response: SearchResponse::new(
                    &record.id,
                    &advertised.to_string(),
                    &settings.service_uuid,
                    &settings.location_host,
                ),
                destination: source,
                delay: Duration::from_millis(fastrand::u64(0..=max_delay_ms)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use shared::protocol::SERVICE_UUID;

    fn settings() -> ReplySettings {
        ReplySettings::from(&DiscoveryConfig::default())
    }

    fn search(mx: u32, uuid: &str) -> RawMessage {
        codec::decode(&SearchRequest::new("239.255.255.250:1900", mx, uuid).encode()).unwrap()
    }

    fn peer() -> SocketAddr {
        "192.168.1.33:40000".parse().unwrap()
    }

    #[test]
    fn test_wildcard_resolved_to_source_address() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

        let replies = plan_replies(&search(2, SERVICE_UUID), peer(), &registry, &settings());

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].response.server, "192.168.1.33:9000");
        assert_eq!(replies[0].response.service, "store");
        assert_eq!(replies[0].destination, peer());
    }

    #[test]
    fn test_one_reply_per_service() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9000);
        registry.add("proxy", IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 5000);

        let replies = plan_replies(&search(2, SERVICE_UUID), peer(), &registry, &settings());
        let mut servers: Vec<_> = replies.iter().map(|r| r.response.server.as_str()).collect();
        servers.sort();

        assert_eq!(servers, vec!["10.0.0.1:5000", "10.0.0.1:9000"]);
    }

    #[test]
    fn test_foreign_search_target_ignored() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);

        let replies = plan_replies(&search(2, "upnp:rootdevice"), peer(), &registry, &settings());
        assert!(replies.is_empty());
    }

    #[test]
    fn test_responses_not_answered() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);
        let response = SearchResponse::new("store", "10.0.0.1:9000", SERVICE_UUID, "host");
        let raw = codec::decode(&response.encode()).unwrap();

        assert!(plan_replies(&raw, peer(), &registry, &settings()).is_empty());
    }

    #[test]
    fn test_delay_bounded_by_mx_and_cap() {
        let mut registry = ServiceRegistry::new();
        for i in 0..50 {
            registry.add(format!("svc-{}", i), IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);
        }

        let short = plan_replies(&search(1, SERVICE_UUID), peer(), &registry, &settings());
        assert!(short.iter().all(|r| r.delay <= Duration::from_secs(1)));

        let long = plan_replies(&search(120, SERVICE_UUID), peer(), &registry, &settings());
        assert!(long.iter().all(|r| r.delay <= Duration::from_secs(5)));

        let immediate = plan_replies(&search(0, SERVICE_UUID), peer(), &registry, &settings());
        assert!(immediate.iter().all(|r| r.delay.is_zero()));
    }

    #[test]
    fn test_invalid_mx_ignored() {
        let mut registry = ServiceRegistry::new();
        registry.add("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000);
        let raw = codec::decode(
            format!("M-SEARCH * HTTP/1.1\r\nST: uuid:{}\r\n\r\n", SERVICE_UUID).as_bytes(),
        )
        .unwrap();

        assert!(plan_replies(&raw, peer(), &registry, &settings()).is_empty());
    }

    #[tokio::test]
    async fn test_server_answers_over_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (server, task) = ServerHandle::spawn(socket, None, ServiceRegistry::new(), settings(), ready_tx);
        let server_addr = ready_rx.await.unwrap();

        server
            .add_service("store", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9000)
            .await
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"not ssdp at all \xff", server_addr).await.unwrap();
        let request = SearchRequest::new("239.255.255.250:1900", 0, SERVICE_UUID).encode();
        peer.send_to(&request, server_addr).await.unwrap();

        let mut buf = [0u8; 2048];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .expect("No response within timeout")
            .unwrap();
        let raw = codec::decode(&buf[..len]).unwrap();

        assert_eq!(from, server_addr);
        assert!(raw.is_ok_response());
        assert_eq!(raw.header("server"), Some("127.0.0.1:9000"));
        assert_eq!(raw.header("service"), Some("store"));

        server.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_service_list_tracks_registrations() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (ready_tx, _ready_rx) = oneshot::channel();
        let mut initial = ServiceRegistry::new();
        initial.add("early", IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1000);
        let (server, task) = ServerHandle::spawn(socket, None, initial, settings(), ready_tx);

        server.add_service("store", IpAddr::V4(Ipv4Addr::LOCALHOST), 9000).await.unwrap();
        server.remove_service("early").await.unwrap();
        server.remove_service("never-registered").await.unwrap();

        let services = server.services().await.unwrap();
        assert_eq!(services, vec![ServiceRecord::new("store", IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)]);

        server.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(server.services().await.is_err(), "Handle must fail once the task has exited");
    }
}
