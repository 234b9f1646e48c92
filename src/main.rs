use anyhow::Result;
use capture_proxy::{Config, Engine, EngineError, FilterRegistry, Transcript};
use std::env;
use tokio::signal;
use tracing::{error, info};

const USAGE: &str = "\
Usage: capture-proxy

Configured through the environment (or a .env file):

  CAPTURE_LOCAL_HOST           listen host                 (localhost)
  CAPTURE_LOCAL_PORT           listen port                 (8001)
  CAPTURE_REMOTE_HOST          forwarding destination host (localhost)
  CAPTURE_REMOTE_PORT          forwarding destination port (7001)
  CAPTURE_PROXY                act as an HTTP proxy        (false)
  CAPTURE_HTTPS                enable TLS interception     (false)
  CAPTURE_CERTIFICATE_PATH     PEM certificate chain, HTTPS only
  CAPTURE_PRIVATE_KEY_PATH     PEM private key, HTTPS only
  CAPTURE_LOCAL_TLS_PORT       port of the HTTPS bridge    (9001)
  CAPTURE_ACCEPT_TIMEOUT_SECS  stop after this many idle seconds, 0 = never (0)
  CAPTURE_COLOUR               colour the echo transcript  (false)
  CAPTURE_REQUEST_FILTERS      request filters, NONE | ECHO (ECHO)
  CAPTURE_RESPONSE_FILTERS     response filters, NONE | ECHO (ECHO)
  CAPTURE_LOG_JSON             log as JSON                 (false)
";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing. Logs go to stderr, the transcript to stdout.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if env::var("CAPTURE_LOG_JSON").is_ok_and(|v| v == "true") {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting {} {}", capture_proxy::NAME, capture_proxy::VERSION);

    let config = match Config::from_env().and_then(|c| c.validate().map(|_| c).map_err(Into::into)) {
        Ok(config) => config,
        Err(e) => usage_and_exit(&e),
    };

    let registry = FilterRegistry::new(Transcript::stdout(), config.use_colour);

    let engine = match Engine::bind(&config, &registry).await {
        Ok(engine) => engine,
        Err(EngineError::Config(e)) => usage_and_exit(&anyhow::Error::new(e)),
        Err(e) => return Err(e.into()),
    };

    let shutdown = engine.shutdown_handle();
    let mut run = tokio::spawn(engine.run());

    tokio::select! {
        result = &mut run => {
            return match result? {
                Ok(()) => {
                    info!("Engine finished");
                    Ok(())
                }
                Err(e) => {
                    error!("Engine failed: {}", e);
                    Err(e.into())
                }
            };
        }
        _ = shutdown_signal() => {
            info!("Shutting down, in-flight connections will drain");
            shutdown.stop();
        }
    }

    run.await??;
    Ok(())
}

fn usage_and_exit(e: &anyhow::Error) -> ! {
    eprintln!("Error: {:#}\n\n{}", e, USAGE);
    std::process::exit(1);
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    // Handle SIGINT (Ctrl+C)
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
