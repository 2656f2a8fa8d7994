//! Topology data structures exchanged with the control plane.
//!
//! These types are deserialised with [`serde`](https://serde.rs/) from the
//! JSON the orchestrator serves at `/applications` and `/nodes`.  They are
//! never mutated in place: every poll produces fresh values and the old ones
//! are dropped wholesale.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The pseudo-network every component joins implicitly.  Bridge addresses
/// are only meaningful on the node that assigned them, so the bridge never
/// counts as a shared mesh network.
pub const BRIDGE_NETWORK: &str = "bridge";

/// An orchestrator-managed unit of one or more containers, scheduled on
/// exactly one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    /// Name of the node currently hosting this application.
    pub node: String,
    /// Logical networks the application joins.
    pub networks: Vec<String>,
    pub components: Vec<Component>,
}

/// A container within an application.  The component name doubles as the
/// service hostname peers use to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    /// Network name to the list of IPs the component holds on that network.
    /// The `bridge` entry is always present.
    pub network_info: HashMap<String, Vec<String>>,
}

/// A host machine participating in the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    /// Routable address peer sidecars can dial.
    pub address: String,
    pub active: bool,
}

/// Whether two network sets share any mesh network.  The bridge is per-node
/// and never counts as shared.
pub fn overlap(a: &[String], b: &[String]) -> bool {
    a.iter()
        .any(|network| network != BRIDGE_NETWORK && b.contains(network))
}
