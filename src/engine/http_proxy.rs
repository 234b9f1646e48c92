//! HTTP proxy engine
//!
//! Learns each connection's destination from its first buffer. Plain
//! requests with an absolute URI are forwarded to the named server with
//! the request line rewritten to origin form. `CONNECT host:port`
//! requests are answered here and bridged into a [`TlsBridgeEngine`] when
//! HTTPS is enabled.

use super::{
    connect, connection_details, Accepted, BridgeTargets, ConnectionError, EngineCore,
    EngineError, FilterPair, ShutdownHandle, TlsBridgeEngine, TlsPair,
};
use crate::config::Config;
use crate::connection::EndPoint;
use crate::filter::{Filter, NullFilter, StripAbsoluteUriFilter};
use crate::pump::spawn_pair;
use crate::resolver::{self, ProxyRequest};
use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, info, warn};

/// Size of the first read, the only bytes the resolver ever sees
pub const FIRST_BUFFER_SIZE: usize = 4096;

/// Response to a CONNECT request
pub fn connect_response(destination: &EndPoint) -> String {
    format!(
        "HTTP/1.0 200 OK\r\nHost: {}\r\nProxy-agent: {}/{}\r\n\r\n",
        destination,
        crate::NAME,
        crate::VERSION
    )
}

pub struct HttpProxyEngine {
    core: EngineCore,
    context: Arc<ProxyContext>,
    bridge_engine: Option<TlsBridgeEngine>,
}

struct ProxyContext {
    /// Request chain wrapped in [`StripAbsoluteUriFilter`]
    filters: FilterPair,
    bridge: Option<Bridge>,
}

/// Where CONNECT requests are relayed to
struct Bridge {
    addr: SocketAddr,
    targets: BridgeTargets,
}

impl HttpProxyEngine {
    /// Bind the proxy listener, and with `tls` the bridge listener too
    pub async fn bind(
        config: &Config,
        filters: FilterPair,
        tls: Option<TlsPair>,
    ) -> Result<Self, EngineError> {
        let shutdown = ShutdownHandle::new();

        let core = EngineCore::bind(
            "HTTP proxy",
            &config.local_host,
            config.local_port,
            config.accept_timeout(),
            shutdown.clone(),
        )
        .await?;

        let bridge_engine = match tls {
            Some(tls) => Some(
                TlsBridgeEngine::bind(
                    config.local_tls_port,
                    filters.clone(),
                    tls,
                    BridgeTargets::new(),
                    shutdown,
                )
                .await?,
            ),
            None => None,
        };

        let bridge = bridge_engine.as_ref().map(|engine| {
            info!(
                "[CONNECT] HTTPS requests bridged through {}",
                engine.local_addr()
            );
            Bridge {
                addr: engine.local_addr(),
                targets: engine.targets().clone(),
            }
        });

        let strip: Arc<dyn Filter> = Arc::new(StripAbsoluteUriFilter::new(filters.request));

        Ok(Self {
            core,
            context: Arc::new(ProxyContext {
                filters: FilterPair::new(strip, filters.response),
                bridge,
            }),
            bridge_engine,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Address of the TLS bridge, if HTTPS is enabled
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge_engine.as_ref().map(TlsBridgeEngine::local_addr)
    }

    /// Stops this engine and its bridge
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.core.shutdown_handle()
    }

    pub async fn run(mut self) -> Result<(), EngineError> {
        let bridge_task = self.bridge_engine.take().map(|engine| tokio::spawn(engine.run()));
        let context = Arc::clone(&self.context);

        let result = self
            .core
            .serve(|accepted| {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let peer = accepted.peer;
                    if let Err(e) = proxy(&context, accepted).await {
                        warn!("[PROXY] Connection from {} abandoned: {}", peer, e);
                    }
                });
            })
            .await;

        // The bridge shares our shutdown signal
        self.core.shutdown_handle().stop();
        if let Some(task) = bridge_task {
            match task.await {
                Ok(Err(e)) => warn!("[CONNECT] TLS bridge ended with error: {}", e),
                Err(e) => warn!("[CONNECT] TLS bridge task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }

        if let Some(bridge) = &self.context.bridge {
            if !bridge.targets.is_empty() {
                debug!(
                    "[CONNECT] {} bridge slot(s) never claimed",
                    bridge.targets.len()
                );
            }
        }

        self.context.filters.stop();
        result
    }
}

async fn proxy(context: &ProxyContext, accepted: Accepted) -> Result<(), ConnectionError> {
    let Accepted {
        mut stream,
        peer,
        local,
    } = accepted;

    let mut first = BytesMut::with_capacity(FIRST_BUFFER_SIZE);
    stream.read_buf(&mut first).await?;
    let first = first.freeze();

    let request = match resolver::resolve(&first) {
        Ok(request) => request,
        Err(e) => {
            warn!(
                "[PROXY] {} from {}, message:\n{}",
                e,
                peer,
                String::from_utf8_lossy(&first)
            );
            return Err(e.into());
        }
    };

    match request {
        ProxyRequest::Http(destination) => {
            debug!("[PROXY] {} -> {}", peer, destination);
            forward_http(context, stream, local, destination, first).await
        }
        ProxyRequest::Connect(destination) => match &context.bridge {
            Some(bridge) => {
                info!("[CONNECT] {} -> {}", peer, destination);
                forward_connect(bridge, stream, local, destination, first).await
            }
            None => {
                warn!(
                    "[CONNECT] HTTPS proxying is not enabled, dropping request for {}",
                    destination
                );
                Err(ConnectionError::HttpsDisabled)
            }
        },
    }
}

async fn forward_http(
    context: &ProxyContext,
    client: TcpStream,
    local: EndPoint,
    destination: EndPoint,
    first: Bytes,
) -> Result<(), ConnectionError> {
    let server = connect(&destination).await?;
    let details = connection_details(local, destination, false)?;

    let pair = spawn_pair(
        client,
        server,
        Arc::clone(&context.filters.request),
        Arc::clone(&context.filters.response),
        details,
        Some(first),
    );
    pair.join().await;

    Ok(())
}

/// Answer a CONNECT and relay the raw bytes to the TLS bridge. The request
/// head is consumed here and never reaches the bridge.
async fn forward_connect(
    bridge: &Bridge,
    mut client: TcpStream,
    local: EndPoint,
    destination: EndPoint,
    first: Bytes,
) -> Result<(), ConnectionError> {
    read_connect_head(&mut client, first).await?;

    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let bridge_socket = socket.local_addr()?;

    // Registered before connecting so the bridge never accepts an
    // unknown peer
    bridge.targets.register(bridge_socket, destination.clone());

    let relay = match socket.connect(bridge.addr).await {
        Ok(relay) => relay,
        Err(e) => {
            bridge.targets.take(&bridge_socket);
            return Err(e.into());
        }
    };

    client
        .write_all(connect_response(&destination).as_bytes())
        .await?;
    client.flush().await?;

    let details = connection_details(local, EndPoint::from(bridge.addr), false)?;
    let null: Arc<dyn Filter> = Arc::new(NullFilter);

    let pair = spawn_pair(client, relay, Arc::clone(&null), null, details, None);
    let (request, response) = pair.join().await;

    debug!(
        "[CONNECT] Tunnel to {} closed - sent={} received={}",
        destination, request.bytes_written, response.bytes_written
    );

    Ok(())
}

/// Read until the blank line ending the CONNECT head, at most
/// [`FIRST_BUFFER_SIZE`] bytes in total
async fn read_connect_head(client: &mut TcpStream, first: Bytes) -> Result<(), ConnectionError> {
    let mut head = BytesMut::from(&first[..]);

    while !head_complete(&head) && head.len() < FIRST_BUFFER_SIZE {
        if client.read_buf(&mut head).await? == 0 {
            break;
        }
    }

    Ok(())
}

fn head_complete(buffer: &[u8]) -> bool {
    buffer.windows(4).any(|window| window == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_response() {
        let response = connect_response(&EndPoint::new("Example.org", 443));
        assert_eq!(
            response,
            format!(
                "HTTP/1.0 200 OK\r\nHost: example.org:443\r\nProxy-agent: {}/{}\r\n\r\n",
                crate::NAME,
                crate::VERSION
            )
        );
    }

    #[test]
    fn test_head_complete() {
        assert!(head_complete(b"CONNECT h:443 HTTP/1.1\r\nHost: h\r\n\r\n"));
        assert!(!head_complete(b"CONNECT h:443 HTTP/1.1\r\n"));
        assert!(!head_complete(b""));
    }
}
