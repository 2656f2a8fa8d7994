//! Control-plane consumption.
//!
//! The orchestrator is the source of truth for applications and nodes.  The
//! poller fetches both every cycle and replaces the topology cache; it never
//! exits while the process runs, and a failed cycle leaves the previous
//! values in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::sleep;

use crate::topology::TopologyCache;
use crate::types::{Application, Node};

pub mod http;
pub use http::HttpControlPlane;

/// Cadence of the topology refresh.  The control plane is co-located and
/// cheap to poll, so there is no backoff.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait ControlPlane {
    async fn applications(&self) -> Result<Vec<Application>>;
    async fn nodes(&self) -> Result<Vec<Node>>;
}

/// Polls the control plane forever, refreshing the cache on each success.
pub async fn run_poller<C>(control_plane: C, cache: Arc<TopologyCache>) -> Result<()>
where
    C: ControlPlane + Send + Sync,
{
    loop {
        sleep(POLL_INTERVAL).await;
        if let Err(e) = poll_once(&control_plane, &cache).await {
            warn!("Topology refresh failed: {:#}", e);
        }
    }
}

/// One refresh cycle: applications first, then the node address map.
///
/// The halves are replaced independently, so a nodes failure leaves the
/// freshly stored applications in place.  Only active nodes enter the
/// address map.
pub async fn poll_once<C>(control_plane: &C, cache: &TopologyCache) -> Result<()>
where
    C: ControlPlane + Send + Sync,
{
    let apps = control_plane
        .applications()
        .await
        .context("fetching applications")?;
    debug!("Fetched {} applications", apps.len());
    cache.set_apps(apps).await;

    let nodes = control_plane.nodes().await.context("fetching nodes")?;
    let addrs: HashMap<String, String> = nodes
        .into_iter()
        .filter(|node| node.active)
        .map(|node| (node.name, node.address))
        .collect();
    debug!("Fetched {} active nodes", addrs.len());
    cache.set_node_addrs(addrs).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct MockControlPlane {
        apps: Result<Vec<Application>, String>,
        nodes: Result<Vec<Node>, String>,
    }

    #[async_trait]
    impl ControlPlane for MockControlPlane {
        async fn applications(&self) -> Result<Vec<Application>> {
            match &self.apps {
                Ok(apps) => Ok(apps.clone()),
                Err(e) => Err(anyhow!(e.clone())),
            }
        }

        async fn nodes(&self) -> Result<Vec<Node>> {
            match &self.nodes {
                Ok(nodes) => Ok(nodes.clone()),
                Err(e) => Err(anyhow!(e.clone())),
            }
        }
    }

    fn app(name: &str) -> Application {
        Application {
            name: name.to_string(),
            node: "n1".to_string(),
            networks: vec!["bridge".to_string()],
            components: Vec::new(),
        }
    }

    fn node(name: &str, address: &str, active: bool) -> Node {
        Node {
            name: name.to_string(),
            address: address.to_string(),
            active,
        }
    }

    #[tokio::test]
    async fn refresh_replaces_both_halves() {
        let cache = TopologyCache::new();
        let control_plane = MockControlPlane {
            apps: Ok(vec![app("web"), app("db")]),
            nodes: Ok(vec![node("n1", "192.168.1.1", true)]),
        };

        poll_once(&control_plane, &cache).await.expect("poll should succeed");

        let snapshot = cache.read().await;
        assert_eq!(snapshot.apps.len(), 2);
        assert_eq!(snapshot.node_addrs["n1"], "192.168.1.1");
    }

    #[tokio::test]
    async fn inactive_nodes_are_excluded() {
        let cache = TopologyCache::new();
        let control_plane = MockControlPlane {
            apps: Ok(Vec::new()),
            nodes: Ok(vec![
                node("n1", "192.168.1.1", true),
                node("n2", "192.168.1.2", false),
            ]),
        };

        poll_once(&control_plane, &cache).await.expect("poll should succeed");

        let snapshot = cache.read().await;
        assert_eq!(snapshot.node_addrs.len(), 1);
        assert!(snapshot.node_addrs.contains_key("n1"));
        assert!(!snapshot.node_addrs.contains_key("n2"));
    }

    #[tokio::test]
    async fn applications_failure_leaves_cache_untouched() {
        let cache = TopologyCache::new();
        cache.set_apps(vec![app("web")]).await;

        let control_plane = MockControlPlane {
            apps: Err("503 unavailable".to_string()),
            nodes: Ok(vec![node("n1", "192.168.1.1", true)]),
        };

        assert!(poll_once(&control_plane, &cache).await.is_err());

        let snapshot = cache.read().await;
        assert_eq!(snapshot.apps.len(), 1);
        assert!(snapshot.node_addrs.is_empty());
    }

    #[tokio::test]
    async fn nodes_failure_keeps_fresh_applications() {
        let cache = TopologyCache::new();
        cache
            .set_node_addrs(HashMap::from([("n9".to_string(), "10.9.9.9".to_string())]))
            .await;

        let control_plane = MockControlPlane {
            apps: Ok(vec![app("web")]),
            nodes: Err("decode error".to_string()),
        };

        assert!(poll_once(&control_plane, &cache).await.is_err());

        // Applications were stored before the nodes fetch failed; the node
        // map keeps its previous value.
        let snapshot = cache.read().await;
        assert_eq!(snapshot.apps.len(), 1);
        assert_eq!(snapshot.node_addrs["n9"], "10.9.9.9");
    }
}
