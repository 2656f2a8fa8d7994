//! Agogos sidecar proxy entry point.

use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{error, info};
use tokio::signal;

use agogos_proxy::config::Config;
use agogos_proxy::control_plane::{run_poller, HttpControlPlane};
use agogos_proxy::proxy::Proxy;
use agogos_proxy::topology::TopologyCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting agogos proxy on node {}", cfg.hostname);

    // Shared topology view
    let cache = Arc::new(TopologyCache::new());

    // System resolver for the public-hostname passthrough check
    let dns = match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            error!(
                "Failed to load system resolv.conf: {}. Falling back to default upstreams.",
                e
            );
            TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
        }
    };

    // Topology watcher
    info!("Starting topology watcher");
    let poller_cache = Arc::clone(&cache);
    let poller_handle = tokio::spawn(async move {
        if let Err(e) = run_poller(HttpControlPlane::new(), poller_cache).await {
            error!("Topology watcher failed: {}", e);
        }
    });

    // Proxy server
    info!("Starting proxy");
    let proxy = Arc::new(Proxy::new(cache, cfg.hostname, dns));
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!("Proxy server failed: {}", e);
        }
    });

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Abort tasks
    poller_handle.abort();
    proxy_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
