//! Endpoint resolution and request rewriting.
//!
//! Requests arriving at the proxy name their targets by component name.  The
//! resolver first lets anything the OS resolver knows pass through untouched,
//! then identifies which application the request came from (by source IP,
//! scoped to this node), and rewrites the request to either a co-located
//! component's bridge IP or a peer node's sidecar.  When nothing matches the
//! request is forwarded as-is and the caller sees the downstream error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use hickory_resolver::TokioAsyncResolver;
use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::Authority;
use hyper::{Request, Uri};
use log::{info, warn};
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::topology::Snapshot;
use crate::types::{overlap, Application, BRIDGE_NETWORK};

/// Deadline for one candidate liveness dial.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Well-known port of the sidecar proxy on peer nodes.
pub const PEER_PROXY_PORT: u16 = 14442;

/// Carries the port the caller originally asked for to the peer sidecar.
const REQUESTED_PORT_HEADER: &str = "x-agogos-requested-port";
/// Carries the caller's original URL to the peer sidecar.
const ORIGINAL_QUERY_HEADER: &str = "x-agogos-query";

/// Resolve-and-rewrite prelude shared by the plain and CONNECT handlers.
///
/// Hostnames the OS resolver knows are public and skip rewriting entirely.
/// An unidentifiable caller is logged and the request forwarded untouched.
pub async fn resolve_request<B>(
    req: &mut Request<B>,
    remote_addr: SocketAddr,
    snapshot: &Snapshot,
    local_node: &str,
    dns: &TokioAsyncResolver,
) {
    let hostname = match request_host(req) {
        Some(hostname) => hostname,
        None => return,
    };
    if dns.lookup_ip(hostname.as_str()).await.is_ok() {
        return;
    }

    let caller = match identify_caller(&snapshot.apps, &remote_addr.to_string(), local_node) {
        Ok(app) => app,
        Err(e) => {
            warn!("{}", e);
            warn!("Can't find what application this request came from, forwarding it untouched");
            return;
        }
    };

    if !check_local_match(req, caller, &snapshot.apps).await {
        check_remote_match(req, caller, snapshot).await;
    }
}

/// Maps a `ip:port` source address to the application it belongs to.
///
/// Bridge IP ranges collide across nodes, so only applications scheduled on
/// this node are considered.
pub fn identify_caller<'a>(
    apps: &'a [Application],
    remote_addr: &str,
    local_node: &str,
) -> Result<&'a Application> {
    let parts: Vec<&str> = remote_addr.split(':').collect();
    if parts.len() != 2 {
        bail!("address should be in the form IP:PORT");
    }
    let caller_ip = parts[0];

    for app in apps {
        if app.node != local_node {
            continue;
        }
        for component in &app.components {
            for ips in component.network_info.values() {
                if ips.iter().any(|ip| ip == caller_ip) {
                    return Ok(app);
                }
            }
        }
    }
    bail!("could not find app")
}

/// Tries to point the request at a component reachable on this node.
///
/// Returns `true` when the request was rewritten; `false` sends the caller
/// on to the remote resolver.
pub async fn check_local_match<B>(
    req: &mut Request<B>,
    caller: &Application,
    apps: &[Application],
) -> bool {
    let hostname = match request_host(req) {
        Some(hostname) => hostname,
        None => return false,
    };
    let candidates = find_local_ips(caller, apps, &hostname);
    if candidates.is_empty() {
        info!("No valid local IPs for {}", hostname);
        return false;
    }

    let port = requested_port(req);
    let mut live = Vec::new();
    for ip in &candidates {
        if probe(&format!("{}:{}", ip, port)).await {
            live.push(ip.clone());
        }
    }

    let chosen = match choose(&live, &candidates) {
        Some(ip) => ip.clone(),
        None => return false,
    };
    info!("Picked IP {} for {}", chosen, hostname);
    rewrite_authority(req, &chosen)
}

/// Bridge IPs of components named `hostname` that the caller may reach:
/// the caller's own components, and components of other applications on the
/// same node whose networks overlap the caller's.
pub fn find_local_ips(caller: &Application, apps: &[Application], hostname: &str) -> Vec<String> {
    let mut ips = Vec::new();

    // The proxy always reaches co-located components over the node bridge.
    for component in &caller.components {
        if component.name == hostname {
            if let Some(bridge_ips) = component.network_info.get(BRIDGE_NETWORK) {
                ips.extend(bridge_ips.iter().cloned());
            }
        }
    }

    for app in apps {
        if app.name == caller.name || app.node != caller.node {
            continue;
        }
        if !overlap(&caller.networks, &app.networks) {
            continue;
        }
        for component in &app.components {
            if component.name == hostname {
                if let Some(bridge_ips) = component.network_info.get(BRIDGE_NETWORK) {
                    ips.extend(bridge_ips.iter().cloned());
                }
            }
        }
    }

    ips
}

/// Redirects the request to the sidecar of a peer node hosting `hostname`.
pub async fn check_remote_match<B>(
    req: &mut Request<B>,
    caller: &Application,
    snapshot: &Snapshot,
) {
    let hostname = match request_host(req) {
        Some(hostname) => hostname,
        None => return,
    };
    let candidates = find_remote_apps(caller, snapshot, &hostname);
    if candidates.is_empty() {
        info!("No valid remote apps for {}", hostname);
        return;
    }

    let mut live: Vec<&Application> = Vec::new();
    for &app in &candidates {
        if let Some(node_ip) = snapshot.node_addrs.get(&app.node) {
            // The dial targets the peer sidecar, not the component itself.
            if probe(&format!("{}:{}", node_ip, PEER_PROXY_PORT)).await {
                live.push(app);
            }
        }
    }

    let chosen = match choose(&live, &candidates) {
        Some(&app) => app,
        None => return,
    };
    let node_ip = match snapshot.node_addrs.get(&chosen.node) {
        Some(ip) => ip,
        None => return,
    };
    info!("Picked node {} for {}", chosen.node, hostname);

    let original_url = req.uri().to_string();
    let original_port = requested_port(req).to_string();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_default();

    let new_uri: Uri = match format!(
        "http://{}:{}/{}/{}{}",
        node_ip, PEER_PROXY_PORT, chosen.name, hostname, path_and_query
    )
    .parse()
    {
        Ok(uri) => uri,
        Err(e) => {
            warn!("Could not form new URL for proxied request: {}", e);
            return;
        }
    };

    // The peer sidecar reconstructs the component-local query from these.
    if let Ok(value) = HeaderValue::from_str(&original_port) {
        req.headers_mut().insert(REQUESTED_PORT_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&original_url) {
        req.headers_mut().insert(ORIGINAL_QUERY_HEADER, value);
    }
    set_target(req, new_uri);
}

/// Applications on other nodes that share a mesh network with the caller and
/// run a component named `hostname`.  Apps whose node has no known address
/// cannot be reached and are not candidates.
pub fn find_remote_apps<'a>(
    caller: &Application,
    snapshot: &'a Snapshot,
    hostname: &str,
) -> Vec<&'a Application> {
    snapshot
        .apps
        .iter()
        .filter(|app| {
            app.name != caller.name
                && app.node != caller.node
                && snapshot.node_addrs.contains_key(&app.node)
                && overlap(&caller.networks, &app.networks)
                && app.components.iter().any(|c| c.name == hostname)
        })
        .collect()
}

/// Liveness dial with a short deadline.
///
/// Only timeouts evict a candidate.  A refused or unreachable socket may
/// belong to an application that is still starting or listening on another
/// port, so it stays in the pool.
async fn probe(addr: &str) -> bool {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => !is_timeout(&e),
        Err(_) => false,
    }
}

fn is_timeout(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// Uniform random pick, reverting to the unprobed set when every candidate
/// failed its liveness dial: better to hand the caller a dead endpoint's
/// error than to drop the request.
fn choose<'a, T>(live: &'a [T], all: &'a [T]) -> Option<&'a T> {
    let pool = if live.is_empty() { all } else { live };
    pool.choose(&mut rand::thread_rng())
}

/// Host component of the request target, covering absolute-form URIs (plain
/// proxying), authority-form URIs (CONNECT), and origin-form requests that
/// only carry a `Host` header.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_owned());
    }
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.rsplit_once(':').map(|(host, _)| host).unwrap_or(h).to_owned())
}

fn requested_port<B>(req: &Request<B>) -> u16 {
    req.uri().port_u16().unwrap_or(80)
}

/// Swaps the host of the request target for `new_host`, preserving the port,
/// and realigns the `Host` header.  Touches only the authority component;
/// hostname look-alikes in the path or query are left alone.  On a malformed
/// result the request is left untouched.
fn rewrite_authority<B>(req: &mut Request<B>, new_host: &str) -> bool {
    let authority = match req.uri().port_u16() {
        Some(port) => format!("{}:{}", new_host, port),
        None => new_host.to_owned(),
    };
    let authority: Authority = match authority.parse() {
        Ok(authority) => authority,
        Err(e) => {
            warn!("Could not form new URL for proxied request: {}", e);
            return false;
        }
    };

    let mut parts = req.uri().clone().into_parts();
    parts.authority = Some(authority);
    match Uri::from_parts(parts) {
        Ok(uri) => {
            set_target(req, uri);
            true
        }
        Err(e) => {
            warn!("Could not form new URL for proxied request: {}", e);
            false
        }
    }
}

/// Points the request at `uri` and keeps the `Host` header in sync with the
/// new authority.
fn set_target<B>(req: &mut Request<B>, uri: Uri) {
    if let Some(authority) = uri.authority() {
        match HeaderValue::from_str(authority.as_str()) {
            Ok(host) => {
                req.headers_mut().insert(HOST, host);
            }
            Err(e) => warn!("Could not update Host header: {}", e),
        }
    }
    *req.uri_mut() = uri;
}
