//! TLS-terminating engine behind CONNECT requests
//!
//! The HTTP proxy engine answers a CONNECT itself and then relays the
//! client's raw bytes to this engine over a loopback connection. This
//! engine completes the TLS handshake with the client, opens its own TLS
//! connection to the real destination and runs the configured filters on
//! the plaintext in between.
//!
//! The destination travels separately, through [`BridgeTargets`]: the
//! proxy registers it under the local address of its loopback socket
//! before connecting, and this engine claims it by the peer address of
//! the connection it accepts.

use super::{
    connect_tls, connection_details, Accepted, ConnectionError, EngineCore, EngineError,
    FilterPair, ShutdownHandle, TlsPair,
};
use crate::connection::EndPoint;
use crate::pump::spawn_pair;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Address the bridge listens on and connects from
pub const BRIDGE_HOST: &str = "127.0.0.1";

/// Pending CONNECT destinations keyed by the bridging socket's local address.
/// Each slot is used once.
#[derive(Debug, Clone, Default)]
pub struct BridgeTargets {
    slots: Arc<Mutex<HashMap<SocketAddr, EndPoint>>>,
}

impl BridgeTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bridge_socket: SocketAddr, destination: EndPoint) {
        self.lock().insert(bridge_socket, destination);
    }

    /// Claim the destination registered for `bridge_socket`
    pub fn take(&self, bridge_socket: &SocketAddr) -> Option<EndPoint> {
        self.lock().remove(bridge_socket)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, EndPoint>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct TlsBridgeEngine {
    core: EngineCore,
    context: Arc<BridgeContext>,
}

struct BridgeContext {
    targets: BridgeTargets,
    filters: FilterPair,
    tls: TlsPair,
}

impl TlsBridgeEngine {
    /// Bind to loopback. `port` 0 picks an ephemeral port.
    pub async fn bind(
        port: u16,
        filters: FilterPair,
        tls: TlsPair,
        targets: BridgeTargets,
        shutdown: ShutdownHandle,
    ) -> Result<Self, EngineError> {
        let core = EngineCore::bind("TLS bridge", BRIDGE_HOST, port, None, shutdown).await?;

        Ok(Self {
            core,
            context: Arc::new(BridgeContext {
                targets,
                filters,
                tls,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    pub fn targets(&self) -> &BridgeTargets {
        &self.context.targets
    }

    /// Accept bridged connections until stopped. The filters are shared
    /// with the proxy engine, which is responsible for stopping them.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let context = Arc::clone(&self.context);

        self.core
            .serve(|accepted| {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let peer = accepted.peer;
                    if let Err(e) = bridge(&context, accepted).await {
                        warn!("[CONNECT] Bridged connection from {} abandoned: {}", peer, e);
                    }
                });
            })
            .await
    }
}

async fn bridge(context: &BridgeContext, accepted: Accepted) -> Result<(), ConnectionError> {
    let Accepted {
        stream,
        peer,
        local,
    } = accepted;

    let destination = context
        .targets
        .take(&peer)
        .ok_or(ConnectionError::UnknownBridgePeer(peer))?;

    let client = context.tls.acceptor.accept(stream).await?;
    let server = connect_tls(&context.tls.connector, &destination).await?;
    let details = connection_details(local, destination, true)?;

    debug!("[CONNECT] TLS established for {}", details);

    let pair = spawn_pair(
        client,
        server,
        Arc::clone(&context.filters.request),
        Arc::clone(&context.filters.response),
        details,
        None,
    );
    pair.join().await;

    Ok(())
}
