//! ssdn-net: overlay network node.
//!
//! Joins this host's containers to a tenant's overlay network:
//! - Listens for and dials peer nodes, exchanging subnet routes
//! - Gives each attached container a tun, or a port on the tenant bridge
//! - Gives the host its own interface on the gateway address
//! - In layer 2 mode, bridges Ethernet frames between nodes instead

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssdn_net::config::{Args, Config, Mode};
use ssdn_net::control::{
    Connector, FileDirectory, REGISTRY_POLL, RegistryConsumer, watch_registry,
};
use ssdn_net::iface::{HostTun, InterfaceProvider, L3Bridge, L3Tap, L3Tuns, OsInterfaces};
use ssdn_net::ippool::AddressPool;
use ssdn_net::l2::{L2Bridge, L2Listener, L2Uplinks};
use ssdn_net::peer::{InboundHandler, Listener, Peers};
use ssdn_net::route::{Ipv4Route, RouteTable};
use ssdn_net::state::State;
use ssdn_net::tls::TlsConfig;
use ssdn_net::transport::TransportListener;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ssdn_net=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_args(args)?;
    info!(
        tenant = %config.tenant,
        tenant_id = %config.tenant_id,
        mode = ?config.mode,
        "Starting ssdn-net"
    );

    let tls = if config.tls_cert.is_some() || config.tls_ca.is_some() {
        TlsConfig::load(
            config.tls_cert.as_deref(),
            config.tls_key.as_deref(),
            config.tls_ca.as_deref(),
        )?
    } else {
        TlsConfig::default()
    };
    let provider: Arc<dyn InterfaceProvider> =
        Arc::new(OsInterfaces::new(&config.actions_dir, config.mtu));

    match config.mode {
        Mode::L2 => run_l2(&config, tls, provider).await,
        Mode::Tun | Mode::Bridge => run_l3(&config, tls, provider).await,
    }
}

async fn run_l3(
    config: &Config,
    tls: TlsConfig,
    provider: Arc<dyn InterfaceProvider>,
) -> Result<()> {
    let subnet = Ipv4Route::from(config.subnet);
    info!(
        network = %config.network,
        subnet = %subnet,
        gateway = %config.gateway,
        "Layer 3 overlay"
    );

    let routes = Arc::new(RouteTable::new());
    let pool = Arc::new(AddressPool::new(
        u32::from(config.subnet.network()),
        u32::from(config.subnet.netmask()),
    ));
    pool.acquire(config.gateway)
        .context("Failed to reserve gateway address")?;

    let local_url = config.advertise_url();
    let handler: Arc<dyn InboundHandler> = routes.clone();
    let peers = Peers::new(
        local_url.clone(),
        subnet,
        Arc::clone(&routes),
        tls.clone(),
        config.mtu,
        Some(handler),
    );
    info!(url = %local_url, "Peer identity");

    if let Some(address) = &config.listen {
        let listener = TransportListener::bind(address, tls.acceptor().cloned())
            .await
            .with_context(|| format!("Failed to listen on {}", address.socket_addr()))?;
        Listener::new(Arc::clone(&peers), listener).start();
    }

    let gateway_with_mask = format!("{}/{}", config.gateway, config.network.prefix_len());
    let host_tun = if config.host_tun {
        let host = HostTun::new(
            config.gateway,
            gateway_with_mask,
            config
                .alternate_networks
                .iter()
                .map(ToString::to_string)
                .collect(),
            Arc::clone(&routes),
            Arc::clone(&provider),
            config.mtu,
        );
        host.start().await.context("Failed to create host tun")?;
        Some(host)
    } else {
        None
    };

    let state = Arc::new(State::new(&config.run_dir, &config.tenant));
    state.start();

    let mut gateway_tap = None;
    let mut tuns = None;
    let connector: Arc<dyn Connector> = if config.mode == Mode::Bridge {
        let tap = L3Tap::new(
            config.gateway,
            config.bridge_name(),
            Arc::clone(&routes),
            Arc::clone(&provider),
            config.mtu,
        );
        tap.start().await.context("Failed to create gateway tap")?;
        let bridge = L3Bridge::new(
            Arc::clone(&tap),
            Arc::clone(&provider),
            Arc::clone(&pool),
            config.network,
            Arc::clone(&state),
        );
        if let Err(e) = bridge.restore().await {
            warn!(error = %e, "Failed to restore container connections");
        }
        gateway_tap = Some(tap);
        Arc::new(bridge)
    } else {
        let connector = Arc::new(L3Tuns::new(
            Arc::clone(&routes),
            Arc::clone(&provider),
            Arc::clone(&pool),
            config.network,
            config.mtu,
            Arc::clone(&state),
        ));
        if let Err(e) = connector.restore().await {
            warn!(error = %e, "Failed to restore container connections");
        }
        tuns = Some(Arc::clone(&connector));
        connector
    };

    for url in &config.peers {
        if let Err(e) = peers.add_peer(url) {
            warn!(peer = %url, error = %e, "Failed to add peer");
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    start_registry(config, local_url, peers.clone(), stop_rx);

    wait_for_signal().await?;

    stop_tx.send_replace(true);
    info!(
        connections = connector.list_connections().len(),
        "Leaving container connections in place"
    );
    peers.stop_all();
    if let Some(tuns) = tuns {
        tuns.stop_all();
    }
    if let Some(tap) = gateway_tap {
        tap.stop();
    }
    if let Some(host) = host_tun {
        host.stop();
    }
    state.flush().await;

    info!(routes = ?routes.describe(), "Stopped");
    Ok(())
}

async fn run_l2(
    config: &Config,
    tls: TlsConfig,
    provider: Arc<dyn InterfaceProvider>,
) -> Result<()> {
    let bridge = L2Bridge::new(config.bridge_name(), provider);
    bridge.start().await.context("Failed to create bridge")?;

    let uplinks = Arc::new(L2Uplinks::new(Arc::clone(&bridge), tls.clone()));
    let listener = match &config.listen {
        Some(address) => {
            let listener = TransportListener::bind(address, tls.acceptor().cloned())
                .await
                .with_context(|| format!("Failed to listen on {}", address.socket_addr()))?;
            let listener = L2Listener::new(Arc::clone(&bridge), listener);
            Some(listener.start())
        }
        None => None,
    };

    for url in &config.peers {
        if let Err(e) = uplinks.add_uplink(url) {
            warn!(uplink = %url, error = %e, "Failed to add uplink");
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    start_registry(config, config.advertise_url(), uplinks.clone(), stop_rx);

    wait_for_signal().await?;

    stop_tx.send_replace(true);
    if let Some(listener) = listener {
        listener.abort();
    }
    uplinks.stop_all();
    info!(connections = bridge.list_connections().len(), "Stopped");
    Ok(())
}

fn start_registry(
    config: &Config,
    advertise_url: String,
    consumer: Arc<dyn RegistryConsumer>,
    stop: watch::Receiver<bool>,
) {
    if let Some(dir) = &config.registry_dir {
        tokio::spawn(watch_registry(
            Arc::new(FileDirectory::new(dir)),
            config.registry_key(),
            advertise_url,
            consumer,
            REGISTRY_POLL,
            stop,
        ));
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
    }
    Ok(())
}
