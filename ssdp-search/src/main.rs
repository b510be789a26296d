//! One-off SSDP search from the command line.
//!
//! `ssdp-search [SERVICE|-] [TIMEOUT_SECS] [INTERFACE]`
//!
//! With a service id, prints the first peer advertising it and exits.
//! Without one (or with `-`), prints every peer seen until the timeout.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use ssdp_discovery::{DiscoveryConfig, SsdpDiscovery};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ssdp_search=info,ssdp_discovery=warn"))
        )
        .init();

    let mut args = std::env::args().skip(1);
    let service = args.next().filter(|s| s != "-");
    let timeout_secs = match args.next() {
        Some(s) => s.parse::<u64>().with_context(|| format!("Invalid timeout: {}", s))?,
        None => DEFAULT_TIMEOUT_SECS,
    };
    let interface = match args.next() {
        Some(s) => s.parse::<Ipv4Addr>().with_context(|| format!("Invalid interface address: {}", s))?,
        None => Ipv4Addr::UNSPECIFIED,
    };

    let mut discovery = SsdpDiscovery::new(DiscoveryConfig::default().with_interface(interface));
    let signals = discovery.start_client_only().context("Failed to start discovery")?;
    signals.client.wait().await.context("Client socket never became ready")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let auto_stop = service.is_some();
    discovery.set_client_filter(service.clone()).await?;
    discovery
        .start_search(
            move |addresses| {
                for address in addresses {
                    let _ = tx.send(address);
                }
            },
            auto_stop,
        )
        .await?;

    tracing::info!(
        "Searching for {} for up to {}s",
        service.as_deref().unwrap_or("any service"),
        timeout_secs
    );

    let mut seen = HashSet::new();
    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(address) = rx.recv() => {
                if seen.insert(address) {
                    println!("{}", address);
                }
                if auto_stop {
                    break;
                }
            }
            _ = &mut deadline => break,
        }
    }

    discovery.stop().await?;

    if auto_stop && seen.is_empty() {
        bail!("No peer advertising {} found", service.unwrap_or_default());
    }
    Ok(())
}
