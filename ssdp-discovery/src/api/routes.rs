use std::net::SocketAddr;
use std::sync::Arc;
use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use tokio::sync::watch;
use shared::types::{DiscoveredPeer, ServiceRecord};
use crate::config::DiscoveryConfig;
use crate::server::ServerHandle;

#[derive(Clone)]
pub struct AppState {
    /// `None` when the node runs client-only
    pub server: Option<ServerHandle>,
    pub peers_rx: watch::Receiver<Vec<DiscoveredPeer>>,
    pub config: Arc<DiscoveryConfig>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/config", get(get_config))
        .route("/v1/services", get(get_services))
        .route("/v1/peers", get(get_peers))
        .with_state(state)
}

async fn get_config(State(state): State<AppState>) -> Json<DiscoveryConfig> {
    Json(state.config.as_ref().clone())
}

async fn get_services(State(state): State<AppState>) -> Result<Json<Vec<ServiceRecord>>, StatusCode> {
    let Some(server) = state.server else {
        return Ok(Json(Vec::new()));
    };

    server.services().await.map(Json).map_err(|e| {
        tracing::error!("Failed to query services: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

async fn get_peers(State(state): State<AppState>) -> Json<Vec<DiscoveredPeer>> {
    Json(state.peers_rx.borrow().clone())
}

/// Record a peer reported by the search callback, refreshing `last_seen`
/// when it is already known.
pub fn record_peer(peers: &watch::Sender<Vec<DiscoveredPeer>>, address: SocketAddr, service: Option<String>) {
    let now = Utc::now();
    peers.send_modify(|peers| {
        match peers.iter_mut().find(|p| p.address == address && p.service == service) {
            Some(peer) => peer.last_seen = now,
            None => peers.push(DiscoveredPeer {
                service,
                address,
                last_seen: now,
            }),
        }
    });
}
