//! Shared fixtures for the integration tests: loopback backends and an
//! engine launcher.

#![allow(dead_code)]

use capture_proxy::tls::{create_tls_acceptor, create_tls_connector};
use capture_proxy::{
    Config, Engine, EngineError, FilterRegistry, MemorySink, ShutdownHandle, TlsIdentity,
    Transcript,
};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

// ============================================================================
// Engine
// ============================================================================

/// Loopback configuration with ephemeral ports
pub fn config() -> Config {
    Config {
        local_host: "127.0.0.1".to_string(),
        local_port: 0,
        remote_host: "127.0.0.1".to_string(),
        local_tls_port: 0,
        ..Config::default()
    }
}

pub fn registry() -> (FilterRegistry, MemorySink) {
    let sink = MemorySink::new();
    (FilterRegistry::new(Transcript::new(sink.clone()), false), sink)
}

pub struct RunningEngine {
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
    pub task: JoinHandle<Result<(), EngineError>>,
}

impl RunningEngine {
    pub async fn stop(self) {
        self.shutdown.stop();
        self.task.await.unwrap().unwrap();
    }
}

pub async fn start(config: &Config, registry: &FilterRegistry) -> RunningEngine {
    let engine = Engine::bind(config, registry).await.unwrap();
    let addr = engine.local_addr();
    let shutdown = engine.shutdown_handle();
    let task = tokio::spawn(engine.run());

    RunningEngine {
        addr,
        shutdown,
        task,
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Echoes every connection back to itself
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    addr
}

/// Echo server behind TLS with a generated certificate
pub async fn tls_echo_server() -> SocketAddr {
    let identity = TlsIdentity::self_signed().unwrap();
    let acceptor = create_tls_acceptor(&identity).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    let (mut read, mut write) = tokio::io::split(tls);
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                    let _ = write.shutdown().await;
                }
            });
        }
    });

    addr
}

/// HTTP backend that reports each request head it receives and answers
/// with `response`
pub async fn recording_server(response: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let head = read_head(&mut stream).await;
                let _ = tx.send(head);
                let _ = stream.write_all(response).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, rx)
}

// ============================================================================
// Clients
// ============================================================================

/// Read up to and including the first blank line
pub async fn read_head<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }

    head
}

/// TLS client that trusts any server
pub fn tls_client() -> TlsConnector {
    create_tls_connector(None).unwrap()
}
