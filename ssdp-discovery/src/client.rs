//! Client role: sends `M-SEARCH` requests and reports matching responses.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use shared::codec::{self, RawMessage};
use crate::error::{DiscoveryError, Result};

const MAX_DATAGRAM: usize = 2048;

/// Receives discovered peers.
///
/// Always called with exactly one address per matching response datagram;
/// the list shape is kept for callers that treat results as batches.
/// Runs on the client task, so it should return quickly.
pub type SearchCallback = Box<dyn FnMut(Vec<SocketAddr>) + Send>;

pub enum ClientCommand {
    StartSession {
        callback: Option<SearchCallback>,
        auto_stop: bool,
    },
    SetFilter(Option<String>),
    StopSession,
    Send {
        payload: Vec<u8>,
        target: SocketAddr,
        reply: oneshot::Sender<std::io::Result<()>>,
    },
    Shutdown,
}

/// Handle to the client role task
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::Sender<ClientCommand>,
    stopped: watch::Receiver<bool>,
}

impl ClientHandle {
    /// Spawn the client task on an already bound socket.
    pub fn spawn(
        socket: UdpSocket,
        service_uuid: String,
        ready: oneshot::Sender<SocketAddr>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<ClientCommand>(64);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let role = ClientRole {
            socket,
            service_uuid,
            session: SearchSession::new(stopped_tx),
        };
        let task = tokio::spawn(role.run(rx, ready));
        (
            Self {
                tx,
                stopped: stopped_rx,
            },
            task,
        )
    }

    /// Install a fresh search session: callback, auto-stop, not stopped.
    /// The service filter is kept.
    pub async fn start_session(&self, callback: Option<SearchCallback>, auto_stop: bool) -> Result<()> {
        self.send(ClientCommand::StartSession { callback, auto_stop })
            .await
    }

    pub async fn set_filter(&self, service: Option<String>) -> Result<()> {
        self.send(ClientCommand::SetFilter(service)).await
    }

    /// Drop the callback and mark the session stopped
    pub async fn stop_session(&self) -> Result<()> {
        self.send(ClientCommand::StopSession).await
    }

    /// Send one datagram from the client socket
    pub async fn send_to(&self, payload: Vec<u8>, target: SocketAddr) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ClientCommand::Send { payload, target, reply }).await?;
        rx.await
            .map_err(|_| DiscoveryError::ChannelClosed("client"))?
            .map_err(DiscoveryError::from)
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Watch the session's stopped flag
    pub fn subscribe_stopped(&self) -> watch::Receiver<bool> {
        self.stopped.clone()
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ClientCommand::Shutdown).await
    }

    async fn send(&self, cmd: ClientCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| DiscoveryError::ChannelClosed("client"))
    }
}

struct SearchSession {
    callback: Option<SearchCallback>,
    filter: Option<String>,
    auto_stop: bool,
    stopped: watch::Sender<bool>,
}

impl SearchSession {
    fn new(stopped: watch::Sender<bool>) -> Self {
        Self {
            callback: None,
            filter: None,
            auto_stop: false,
            stopped,
        }
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    fn deliver(&mut self, address: SocketAddr) {
        if self.is_stopped() {
            tracing::debug!("Search stopped, not reporting {}", address);
            return;
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(vec![address]);
        }
        if self.auto_stop {
            self.stopped.send_replace(true);
        }
    }
}

struct ClientRole {
    socket: UdpSocket,
    service_uuid: String,
    session: SearchSession,
}

impl ClientRole {
    async fn run(mut self, mut rx: mpsc::Receiver<ClientCommand>, ready: oneshot::Sender<SocketAddr>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        match self.socket.local_addr() {
            Ok(addr) => {
                tracing::debug!("SSDP client bound to {}", addr);
                let _ = ready.send(addr);
            }
            Err(e) => tracing::warn!("SSDP client has no local address: {}", e),
        }

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, source)) => self.handle_datagram(&buf[..len], source),
                        Err(e) => tracing::warn!("SSDP client receive error: {}", e),
                    }
                }

                cmd = rx.recv() => {
                    match cmd {
                        Some(ClientCommand::StartSession { callback, auto_stop }) => {
                            self.session.callback = callback;
                            self.session.auto_stop = auto_stop;
                            self.session.stopped.send_replace(false);
                        }
                        Some(ClientCommand::SetFilter(service)) => {
                            self.session.filter = service;
                        }
                        Some(ClientCommand::StopSession) => {
                            self.session.callback = None;
                            self.session.stopped.send_replace(true);
                        }
                        Some(ClientCommand::Send { payload, target, reply }) => {
                            tracing::debug!("Sending M-SEARCH to {}", target);
                            let result = self.socket.send_to(&payload, target).await.map(|_| ());
                            let _ = reply.send(result);
                        }
                        Some(ClientCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        tracing::debug!("SSDP client shutting down");
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let raw = match codec::decode(data) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!("Dropping datagram from {}: {}", source, e);
                return;
            }
        };

        if let Some(address) = match_response(&raw, &self.service_uuid, self.session.filter.as_deref()) {
            tracing::debug!(
                "Received service {} from {} ({})",
                raw.header("service").unwrap_or("-"),
                address,
                source
            );
            self.session.deliver(address);
        }
    }
}

/// Extract the advertised address from a search response.
///
/// Accepts only `HTTP/1.x 200` responses whose ST names `service_uuid` and
/// whose SERVER header is an `address:port`. With a filter set, the
/// SERVICE header must equal it.
pub fn match_response(raw: &RawMessage, service_uuid: &str, filter: Option<&str>) -> Option<SocketAddr> {
    if !raw.is_ok_response() || !raw.targets(service_uuid) {
        return None;
    }

    let server = raw.header("server")?;
    let address = match server.trim().parse::<SocketAddr>() {
        Ok(address) => address,
        Err(_) => {
            tracing::debug!("Ignoring response with SERVER {:?}", server);
            return None;
        }
    };

    match filter {
        Some(wanted) if raw.header("service") != Some(wanted) => None,
        _ => Some(address),
    }
}
