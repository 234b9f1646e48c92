//! Listener, accept loop and shutdown shared by every engine

use super::EngineError;
use crate::connection::EndPoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Result of waiting for one connection
#[derive(Debug)]
pub enum AcceptOutcome {
    Connection(TcpStream, SocketAddr),

    /// No connection arrived within the accept timeout
    TimedOut,

    /// [`ShutdownHandle::stop`] was called
    Stopped,
}

/// Stops one or more engines.
///
/// Cloning gives another handle to the same signal. Stopping before the
/// engine has started running still stops it.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Stop accepting new connections. Connections already accepted run
    /// to completion.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    #[cfg(test)]
    pub(crate) fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection handed out by [`EngineCore::serve`]
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,

    /// Our end of the flow, see [`EngineCore::client_endpoint`]
    pub local: EndPoint,
}

/// Listening socket plus the accept loop primitives
pub struct EngineCore {
    name: &'static str,
    listener: TcpListener,
    local_addr: SocketAddr,
    local_host: String,
    accept_timeout: Option<Duration>,
    shutdown: ShutdownHandle,
    stopped: watch::Receiver<bool>,
}

impl EngineCore {
    pub async fn bind(
        name: &'static str,
        host: &str,
        port: u16,
        accept_timeout: Option<Duration>,
        shutdown: ShutdownHandle,
    ) -> Result<Self, EngineError> {
        let bind_addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| EngineError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| EngineError::Bind {
                addr: bind_addr,
                source,
            })?;

        debug!("[ENGINE] {} bound to {}", name, local_addr);

        let stopped = shutdown.subscribe();

        Ok(Self {
            name,
            listener,
            local_addr,
            local_host: host.to_string(),
            accept_timeout,
            shutdown,
            stopped,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Our end of a connection accepted from `peer`: the configured local
    /// host with the peer's port, so both descriptors of a flow can be
    /// told apart by port.
    pub fn client_endpoint(&self, peer: SocketAddr) -> EndPoint {
        EndPoint::new(&self.local_host, peer.port())
    }

    /// Wait for the next connection, the accept timeout or a stop request
    pub async fn accept(&mut self) -> Result<AcceptOutcome, EngineError> {
        if *self.stopped.borrow() {
            return Ok(AcceptOutcome::Stopped);
        }

        let accept_timeout = self.accept_timeout;
        let timeout = async move {
            match accept_timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = self.stopped.changed() => Ok(AcceptOutcome::Stopped),
            result = self.listener.accept() => result
                .map(|(stream, peer)| AcceptOutcome::Connection(stream, peer))
                .map_err(EngineError::Accept),
            _ = timeout => Ok(AcceptOutcome::TimedOut),
        }
    }

    /// Accept connections and hand each one to `on_connection` until the
    /// accept timeout expires or the engine is stopped.
    ///
    /// `on_connection` must not block; it is expected to spawn.
    pub async fn serve<H>(&mut self, mut on_connection: H) -> Result<(), EngineError>
    where
        H: FnMut(Accepted),
    {
        loop {
            match self.accept().await {
                Ok(AcceptOutcome::Connection(stream, peer)) => {
                    debug!("[ENGINE] {} accepted connection from {}", self.name, peer);
                    let local = self.client_endpoint(peer);
                    on_connection(Accepted {
                        stream,
                        peer,
                        local,
                    });
                }
                Ok(AcceptOutcome::TimedOut) => {
                    info!(
                        "[ENGINE] {} listener timed out waiting for connections, stopping",
                        self.name
                    );
                    return Ok(());
                }
                Ok(AcceptOutcome::Stopped) => {
                    info!("[ENGINE] {} stopped", self.name);
                    return Ok(());
                }
                Err(e) => {
                    error!("[ENGINE] {} failed to accept connection: {}", self.name, e);
                    return Err(e);
                }
            }
        }
    }
}
