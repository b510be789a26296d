//! Discovery coordinator: owns both roles and drives repeating searches.
//!
//! Lifecycle is `Idle -> Started -> SearchActive -> Stopped`. A stopped
//! coordinator cannot be started again.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use shared::codec::SearchRequest;
use shared::types::ServiceRecord;
use crate::client::{ClientHandle, SearchCallback};
use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, Result};
use crate::registry::ServiceRegistry;
use crate::server::{ReplySettings, ServerHandle};
use crate::transport::{self, Membership};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Started,
    SearchActive,
    Stopped,
}

/// Resolves once a role's socket is listening.
pub struct ReadySignal(oneshot::Receiver<SocketAddr>);

impl ReadySignal {
    /// The role's local address, or `None` if the role never started
    pub async fn wait(self) -> Option<SocketAddr> {
        self.0.await.ok()
    }
}

/// Readiness of both roles, as returned by [`SsdpDiscovery::start`]
pub struct StartSignals {
    pub server: ReadySignal,
    pub client: ReadySignal,
}

/// Search retry interval: grows by a constant factor up to a cap and
/// never gives up.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            multiplier,
            max,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.initial_backoff(), config.backoff_multiplier, config.max_backoff())
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(self.current.as_secs_f64() * self.multiplier)
            .map_or(self.max, |next| next.min(self.max));
        delay
    }
}

struct RoleTask<H> {
    handle: H,
    task: JoinHandle<()>,
}

/// Live sockets of both roles and the interface they are bound to
struct NetworkBinding {
    interface: Ipv4Addr,
    server: Option<RoleTask<ServerHandle>>,
    client: RoleTask<ClientHandle>,
}

pub struct SsdpDiscovery {
    config: DiscoveryConfig,
    state: DiscoveryState,
    /// Registrations made before `start`, handed to the server role
    pending: ServiceRegistry,
    binding: Option<NetworkBinding>,
    /// Cancels the running search loop when replaced or dropped
    search: Option<DropGuard>,
}

impl SsdpDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            state: DiscoveryState::Idle,
            pending: ServiceRegistry::new(),
            binding: None,
            search: None,
        }
    }

    /// Current lifecycle state. A search that ended through auto-stop
    /// reports `Started` again.
    pub fn state(&self) -> DiscoveryState {
        match self.state {
            DiscoveryState::SearchActive if self.client().is_ok_and(ClientHandle::is_stopped) => {
                DiscoveryState::Started
            }
            state => state,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Bind both roles and spawn their tasks.
    ///
    /// Joining the multicast group is best effort: when it fails (another
    /// listener owns the port, no multicast route...) the server role stays
    /// down and discovery continues client-only. Failing to bind the client
    /// socket is an error.
    pub fn start(&mut self) -> Result<StartSignals> {
        if self.state != DiscoveryState::Idle {
            return Err(DiscoveryError::InvalidState(self.state));
        }
        self.check_config()?;

        let interface = self.config.interface;
        let server = match transport::bind_multicast(self.config.multicast_addr, interface) {
            Ok((socket, membership)) => Some((socket, Some(membership))),
            Err(e) => {
                tracing::warn!("Multicast listen/join failed, not answering searches: {}", e);
                None
            }
        };
        let client = transport::bind_unicast(interface)?;

        Ok(self.attach(server, client))
    }

    /// Like [`start`](Self::start) but never joins the multicast group:
    /// only the client role runs, so the instance can search but does not
    /// answer searches. The server signal resolves to `None`.
    pub fn start_client_only(&mut self) -> Result<StartSignals> {
        if self.state != DiscoveryState::Idle {
            return Err(DiscoveryError::InvalidState(self.state));
        }
        self.check_config()?;

        let client = transport::bind_unicast(self.config.interface)?;
        Ok(self.attach(None, client))
    }

    fn check_config(&self) -> Result<()> {
        self.config
            .validate()
            .map_err(|e| DiscoveryError::InvalidConfig(format!("{:#}", e)))
    }

    /// Spawn the roles on sockets that are already bound
    fn attach(
        &mut self,
        server: Option<(UdpSocket, Option<Membership>)>,
        client: UdpSocket,
    ) -> StartSignals {
        let (server_ready_tx, server_ready_rx) = oneshot::channel();
        let (client_ready_tx, client_ready_rx) = oneshot::channel();

        let server = server.map(|(socket, membership)| {
            let registry = std::mem::take(&mut self.pending);
            let (handle, task) = ServerHandle::spawn(
                socket,
                membership,
                registry,
                ReplySettings::from(&self.config),
                server_ready_tx,
            );
            RoleTask { handle, task }
        });

        match client.local_addr() {
            Ok(addr) => tracing::debug!("SSDP host: {}", addr),
            Err(e) => tracing::debug!("SSDP host unknown: {}", e),
        }
        let (handle, task) = ClientHandle::spawn(client, self.config.service_uuid.clone(), client_ready_tx);

        self.binding = Some(NetworkBinding {
            interface: self.config.interface,
            server,
            client: RoleTask { handle, task },
        });
        self.state = DiscoveryState::Started;

        StartSignals {
            server: ReadySignal(server_ready_rx),
            client: ReadySignal(client_ready_rx),
        }
    }

    /// Advertise `id` at `address:port`. `0.0.0.0` advertises whichever
    /// address a search arrives on.
    pub async fn register_service(&mut self, id: &str, address: IpAddr, port: u16) -> Result<()> {
        match self.state {
            DiscoveryState::Idle => {
                self.pending.add(id, address, port);
                Ok(())
            }
            DiscoveryState::Stopped => Err(DiscoveryError::InvalidState(self.state)),
            _ => self.server()?.add_service(id, address, port).await,
        }
    }

    pub async fn unregister_service(&mut self, id: &str) -> Result<()> {
        match self.state {
            DiscoveryState::Idle => {
                self.pending.remove(id);
                Ok(())
            }
            DiscoveryState::Stopped => Err(DiscoveryError::InvalidState(self.state)),
            _ => self.server()?.remove_service(id).await,
        }
    }

    /// Services this instance currently advertises
    pub async fn registered_services(&self) -> Result<Vec<ServiceRecord>> {
        match self.state {
            DiscoveryState::Idle => Ok(self.pending.all().cloned().collect()),
            DiscoveryState::Stopped => Err(DiscoveryError::InvalidState(self.state)),
            _ => self.server()?.services().await,
        }
    }

    /// Handle to the running server role, if the multicast join succeeded
    pub fn server(&self) -> Result<ServerHandle> {
        self.binding
            .as_ref()
            .and_then(|binding| binding.server.as_ref())
            .map(|role| role.handle.clone())
            .ok_or(DiscoveryError::RoleUnavailable("server"))
    }

    fn client(&self) -> Result<&ClientHandle> {
        self.binding
            .as_ref()
            .map(|binding| &binding.client.handle)
            .ok_or(DiscoveryError::InvalidState(self.state))
    }

    /// Start a repeating search.
    ///
    /// `callback` receives one address per matching response. The first
    /// request goes out right away, then the interval grows from
    /// `initial_backoff_secs` by `backoff_multiplier` up to
    /// `max_backoff_secs` until [`stop_search`](Self::stop_search) or, with
    /// `auto_stop`, the first match. Calling this again restarts the
    /// sequence from the initial interval.
    pub async fn start_search<F>(&mut self, callback: F, auto_stop: bool) -> Result<()>
    where
        F: FnMut(Vec<SocketAddr>) + Send + 'static,
    {
        self.check_config()?;
        // Dropping the guard cancels the previous loop
        self.search = None;

        let client = self.client()?.clone();
        let callback: SearchCallback = Box::new(callback);
        client.start_session(Some(callback), auto_stop).await?;

        let cancel = CancellationToken::new();
        tokio::spawn(run_search_loop(
            client,
            self.search_request(),
            self.search_target(),
            Backoff::from_config(&self.config),
            cancel.clone(),
        ));
        self.search = Some(cancel.drop_guard());
        self.state = DiscoveryState::SearchActive;
        Ok(())
    }

    /// Stop the repeating search and stop reporting responses
    pub async fn stop_search(&mut self) -> Result<()> {
        self.search = None;
        self.client()?.stop_session().await?;
        if self.state == DiscoveryState::SearchActive {
            self.state = DiscoveryState::Started;
        }
        Ok(())
    }

    /// Only report responses advertising `service`; `None` reports all
    pub async fn set_client_filter(&self, service: Option<String>) -> Result<()> {
        self.client()?.set_filter(service).await
    }

    /// Send a single search request
    pub async fn search(&self) -> Result<()> {
        self.client()?
            .send_to(self.search_request(), self.search_target())
            .await
    }

    /// Leave the multicast group and close both sockets. Resolves when both
    /// role tasks have finished.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == DiscoveryState::Stopped {
            return Ok(());
        }
        self.search = None;

        let mut tasks = Vec::new();
        if let Some(binding) = self.binding.take() {
            if let Some(server) = binding.server {
                if let Err(e) = server.handle.shutdown().await {
                    tracing::debug!("Server role already gone: {}", e);
                }
                tasks.push(server.task);
            }

            let client = binding.client;
            if let Err(e) = client.handle.stop_session().await {
                tracing::debug!("Client role already gone: {}", e);
            }
            if let Err(e) = client.handle.shutdown().await {
                tracing::debug!("Client role already gone: {}", e);
            }
            tasks.push(client.task);

            tracing::info!("SSDP discovery on {} stopping", binding.interface);
        }

        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!("Discovery role task failed: {}", e);
            }
        }

        self.state = DiscoveryState::Stopped;
        Ok(())
    }

    fn search_request(&self) -> Vec<u8> {
        SearchRequest::new(
            self.config.multicast_addr.to_string(),
            self.config.search_mx,
            self.config.service_uuid.clone(),
        )
        .encode()
    }

    fn search_target(&self) -> SocketAddr {
        SocketAddr::V4(self.config.multicast_addr)
    }
}

async fn run_search_loop(
    client: ClientHandle,
    request: Vec<u8>,
    target: SocketAddr,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    let mut stopped = client.subscribe_stopped();

    loop {
        match client.send_to(request.clone(), target).await {
            Ok(()) => {}
            Err(DiscoveryError::ChannelClosed(_)) => break,
            Err(e) => tracing::warn!("Failed to send M-SEARCH to {}: {}", target, e),
        }

        if client.is_stopped() {
            break;
        }

        let delay = backoff.next_delay();
        tracing::debug!("Next M-SEARCH in {:?}", delay);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
            _ = until_stopped(&mut stopped) => break,
        }
    }

    tracing::debug!("Search loop finished");
}

/// Resolves once the flag is set or the client task is gone
async fn until_stopped(stopped: &mut watch::Receiver<bool>) {
    while !*stopped.borrow_and_update() {
        if stopped.changed().await.is_err() {
            return;
        }
    }
}
