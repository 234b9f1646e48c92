//! Engine startup and shutdown

mod common;

use capture_proxy::{Config, ConfigError, Engine, EngineError};
use common::{config, echo_server, registry, start};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_accept_timeout_ends_run_and_releases_port() {
    let (registry, _) = registry();
    let config = Config {
        accept_timeout_secs: 1,
        ..config()
    };

    let engine = Engine::bind(&config, &registry).await.unwrap();
    let addr = engine.local_addr();

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .unwrap()
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "{:?}", elapsed);

    // Port is free again
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test]
async fn test_proxy_accept_timeout_also_stops_bridge() {
    let (registry, _) = registry();
    let config = Config {
        proxy: true,
        https: true,
        accept_timeout_secs: 1,
        ..config()
    };

    let engine = match Engine::bind(&config, &registry).await.unwrap() {
        Engine::HttpProxy(engine) => engine,
        Engine::PortForwarder(_) => panic!("expected an HTTP proxy engine"),
    };
    let bridge = engine.bridge_addr().unwrap();

    tokio::time::timeout(Duration::from_secs(5), engine.run())
        .await
        .unwrap()
        .unwrap();

    TcpListener::bind(bridge).await.unwrap();
}

#[tokio::test]
async fn test_stop_lets_open_connections_drain() {
    let backend = echo_server().await;
    let (registry, _) = registry();
    let config = Config {
        remote_port: backend.port(),
        ..config()
    };
    let engine = start(&config, &registry).await;

    let mut client = TcpStream::connect(engine.addr).await.unwrap();
    client.write_all(b"before").await.unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).await.unwrap();

    let addr = engine.addr;
    engine.stop().await;

    // Already accepted connection still works
    client.write_all(b"after!").await.unwrap();
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"after!");

    // New connections are refused
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let (registry, _) = registry();
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Config {
        local_port: taken.local_addr().unwrap().port(),
        ..config()
    };

    assert!(matches!(
        Engine::bind(&config, &registry).await,
        Err(EngineError::Bind { .. })
    ));
}

#[tokio::test]
async fn test_identity_without_https_is_a_config_error() {
    let (registry, _) = registry();
    let config = Config {
        certificate_path: Some("cert.pem".into()),
        private_key_path: Some("key.pem".into()),
        ..config()
    };

    assert!(matches!(
        Engine::bind(&config, &registry).await,
        Err(EngineError::Config(ConfigError::IdentityWithoutHttps))
    ));
}

#[tokio::test]
async fn test_missing_identity_files_are_a_config_error() {
    let (registry, _) = registry();
    let config = Config {
        https: true,
        certificate_path: Some("/nonexistent/cert.pem".into()),
        private_key_path: Some("/nonexistent/key.pem".into()),
        ..config()
    };

    assert!(matches!(
        Engine::bind(&config, &registry).await,
        Err(EngineError::Config(ConfigError::Tls(_)))
    ));
}
