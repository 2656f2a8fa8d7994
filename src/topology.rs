//! Shared view of the mesh topology.
//!
//! The poller is the only writer; every request handler reads one snapshot
//! at the start of handling and keeps using it for the whole request, so a
//! refresh mid-request is never observed.  The two halves are replaced
//! independently and may briefly be out of phase with each other; stale
//! halves only degrade routing quality.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::Application;

/// Immutable pair of (applications, active-node addresses).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub apps: Arc<Vec<Application>>,
    /// Node name to routable address, active nodes only.
    pub node_addrs: Arc<HashMap<String, String>>,
}

#[derive(Debug, Default)]
pub struct TopologyCache {
    inner: RwLock<Snapshot>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot.  Cheap: clones two `Arc`s, no data is copied.
    pub async fn read(&self) -> Snapshot {
        self.inner.read().await.clone()
    }

    pub async fn set_apps(&self, apps: Vec<Application>) {
        self.inner.write().await.apps = Arc::new(apps);
    }

    pub async fn set_node_addrs(&self, addrs: HashMap<String, String>) {
        self.inner.write().await.node_addrs = Arc::new(addrs);
    }
}
