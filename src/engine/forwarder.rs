//! Port forwarding engine

use super::{
    connect, connect_tls, connection_details, Accepted, ConnectionError, EngineCore,
    EngineError, FilterPair, ShutdownHandle, TlsPair,
};
use crate::config::Config;
use crate::connection::EndPoint;
use crate::pump::spawn_pair;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forwards every accepted connection to one fixed remote endpoint.
///
/// With TLS configured both legs are encrypted: the proxy terminates the
/// client's TLS and opens its own TLS connection to the remote end, so the
/// filters see plaintext.
pub struct PortForwarderEngine {
    core: EngineCore,
    context: Arc<ForwarderContext>,
}

struct ForwarderContext {
    remote: EndPoint,
    filters: FilterPair,
    tls: Option<TlsPair>,
}

impl PortForwarderEngine {
    pub async fn bind(
        config: &Config,
        filters: FilterPair,
        tls: Option<TlsPair>,
    ) -> Result<Self, EngineError> {
        let core = EngineCore::bind(
            "port forwarder",
            &config.local_host,
            config.local_port,
            config.accept_timeout(),
            ShutdownHandle::new(),
        )
        .await?;

        Ok(Self {
            core,
            context: Arc::new(ForwarderContext {
                remote: EndPoint::new(&config.remote_host, config.remote_port),
                filters,
                tls,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.core.shutdown_handle()
    }

    pub async fn run(mut self) -> Result<(), EngineError> {
        let context = Arc::clone(&self.context);

        let result = self
            .core
            .serve(|accepted| {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let peer = accepted.peer;
                    if let Err(e) = forward(&context, accepted).await {
                        warn!("[ENGINE] Connection from {} abandoned: {}", peer, e);
                    }
                });
            })
            .await;

        self.context.filters.stop();
        result
    }
}

async fn forward(context: &ForwarderContext, accepted: Accepted) -> Result<(), ConnectionError> {
    let Accepted {
        stream: client,
        local,
        ..
    } = accepted;
    let remote = &context.remote;
    let filters = &context.filters;

    let pair = match &context.tls {
        None => {
            let server = connect(remote).await?;
            let details = connection_details(local, remote.clone(), false)?;
            spawn_pair(
                client,
                server,
                Arc::clone(&filters.request),
                Arc::clone(&filters.response),
                details,
                None,
            )
        }
        Some(tls) => {
            let server = connect_tls(&tls.connector, remote).await?;
            let client = tls.acceptor.accept(client).await?;
            let details = connection_details(local, remote.clone(), true)?;
            spawn_pair(
                client,
                server,
                Arc::clone(&filters.request),
                Arc::clone(&filters.response),
                details,
                None,
            )
        }
    };

    let (request, response) = pair.join().await;
    debug!(
        "[ENGINE] Forwarded connection to {} closed - sent={} received={}",
        remote, request.bytes_written, response.bytes_written
    );

    Ok(())
}
