//! HTTP front door.
//!
//! One listener on port 8888 serves both proxying modes: plain HTTP requests
//! are resolved, rewritten, and round-tripped through the upstream client;
//! CONNECT requests are resolved, dialed, answered with `200 OK`, and then
//! tunneled as opaque bytes in both directions.  HTTP/1.x only.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use hickory_resolver::TokioAsyncResolver;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::resolver;
use crate::topology::TopologyCache;

/// Client-facing proxy port.
pub const PROXY_PORT: u16 = 8888;

/// Deadline for the upstream dial of a CONNECT tunnel.
const TUNNEL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Response header naming the endpoint this proxy actually chose.
const CHOSEN_IP_HEADER: &str = "proxy-chosen-ip";

type Body = BoxBody<Bytes, hyper::Error>;

pub struct Proxy {
    cache: Arc<TopologyCache>,
    local_node: String,
    dns: TokioAsyncResolver,
    client: Client<HttpConnector, Incoming>,
}

impl Proxy {
    pub fn new(cache: Arc<TopologyCache>, local_node: String, dns: TokioAsyncResolver) -> Self {
        Self {
            cache,
            local_node,
            dns,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Accept loop.  Each connection is served by its own task; HTTP/2 is
    /// not offered on this listener.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", PROXY_PORT)).await?;
        info!("Proxy listening on port {}", PROXY_PORT);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { proxy.handle(req, remote_addr).await }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection from {} ended with error: {}", remote_addr, e);
                }
            });
        }
    }

    async fn handle(
        &self,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Body>, Infallible> {
        // One snapshot per request; a refresh mid-request is never observed.
        let snapshot = self.cache.read().await;
        resolver::resolve_request(&mut req, remote_addr, &snapshot, &self.local_node, &self.dns)
            .await;

        let response = if req.method() == Method::CONNECT {
            self.handle_tunnel(req).await
        } else {
            self.handle_http(req).await
        };
        Ok(response)
    }

    /// Plain HTTP: round-trip the (possibly rewritten) request upstream and
    /// relay status, headers, and body back to the caller.
    async fn handle_http(&self, req: Request<Incoming>) -> Response<Body> {
        info!("Using request URL: {}", req.uri());
        let chosen = req.uri().host().unwrap_or_default().to_owned();

        match self.client.request(req).await {
            Ok(response) => {
                let mut response = response.map(|body| body.boxed());
                add_chosen_ip(&mut response, &chosen);
                response
            }
            Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        }
    }

    /// CONNECT: dial the (possibly rewritten) authority, answer `200 OK`,
    /// then shuttle bytes until either side closes.
    async fn handle_tunnel(&self, req: Request<Incoming>) -> Response<Body> {
        if req.extensions().get::<OnUpgrade>().is_none() {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
        }

        let target = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let chosen = req.uri().host().unwrap_or_default().to_owned();

        let upstream = match timeout(TUNNEL_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
            Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    if let Err(e) = tunnel(upgraded, upstream).await {
                        debug!("Tunnel to {} closed with error: {}", target, e);
                    }
                }
                Err(e) => error!("Could not hijack client connection: {}", e),
            }
        });

        let mut response = Response::new(empty());
        add_chosen_ip(&mut response, &chosen);
        response
    }
}

/// Bidirectional byte copy.  Each direction shuts down its write side at
/// EOF; an error drops both streams and tears the tunnel down, which
/// unblocks the other direction.  No deadline applies to tunneled data.
async fn tunnel(upgraded: Upgraded, upstream: TcpStream) -> std::io::Result<()> {
    let (mut client_read, mut client_write) = tokio::io::split(TokioIo::new(upgraded));
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let client_to_upstream = async {
        let n = tokio::io::copy(&mut client_read, &mut upstream_write).await?;
        upstream_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };
    let upstream_to_client = async {
        let n = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        client_write.shutdown().await?;
        Ok::<u64, std::io::Error>(n)
    };

    let (sent, received) = tokio::try_join!(client_to_upstream, upstream_to_client)?;
    debug!("Tunnel closed, {} bytes sent, {} bytes received", sent, received);
    Ok(())
}

fn add_chosen_ip(response: &mut Response<Body>, host: &str) {
    match HeaderValue::from_str(host) {
        Ok(value) => {
            response.headers_mut().append(CHOSEN_IP_HEADER, value);
        }
        Err(e) => warn!("Could not add {} header: {}", CHOSEN_IP_HEADER, e),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(full(format!("{}\n", message)));
    *response.status_mut() = status;
    response
}

fn full(text: String) -> Body {
    Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed()
}

fn empty() -> Body {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_status_and_text() {
        let response = error_response(StatusCode::SERVICE_UNAVAILABLE, "dial tcp: refused");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn chosen_ip_header_set_from_host() {
        let mut response = Response::new(empty());
        add_chosen_ip(&mut response, "10.0.0.9");
        assert_eq!(response.headers()[CHOSEN_IP_HEADER], "10.0.0.9");
    }
}
