//! Stream pump
//!
//! Moves bytes in one direction of a proxied connection, handing every
//! buffer to a filter on the way. A connection has two pumps, one per
//! direction, each on its own task. End of stream in one direction is
//! passed on as a half-close; a failure in either direction closes both.

use crate::connection::ConnectionDetails;
use crate::filter::{Filter, FilterError};
use bytes::Bytes;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Read buffer size for a single pump
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
enum PumpError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Filter panicked: {0}")]
    FilterPanic(String),

    #[error("Other direction failed")]
    Aborted,
}

/// Byte counts of a finished pump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpSummary {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Failure signal shared by the two pumps of one connection
#[derive(Debug, Clone)]
struct PumpAbort {
    tx: Arc<watch::Sender<bool>>,
}

impl PumpAbort {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    fn fire(&self) {
        self.tx.send_replace(true);
    }

    async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            // The sender lives as long as `self`
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Copy `source` to `destination` through `filter` until EOF or error.
///
/// `initial` holds bytes already read from `source` (by the destination
/// resolver) and is filtered and forwarded before anything else. Errors
/// are logged, never returned. The filter always sees
/// `connection_closed` and the destination's write side is always shut
/// down, so the paired pump observes end of stream.
pub async fn pump<R, W>(
    source: R,
    destination: W,
    filter: Arc<dyn Filter>,
    details: ConnectionDetails,
    initial: Option<Bytes>,
) -> PumpSummary
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pump_linked(source, destination, filter, details, initial, None).await
}

async fn pump_linked<R, W>(
    mut source: R,
    mut destination: W,
    filter: Arc<dyn Filter>,
    details: ConnectionDetails,
    initial: Option<Bytes>,
    abort: Option<PumpAbort>,
) -> PumpSummary
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut summary = PumpSummary::default();

    let result = {
        let transfer = async {
            match guarded(|| filter.connection_opened(&details)) {
                Ok(()) => {
                    run(
                        &mut source,
                        &mut destination,
                        filter.as_ref(),
                        &details,
                        initial,
                        &mut summary,
                    )
                    .await
                }
                Err(e) => Err(e),
            }
        };

        match &abort {
            Some(abort) => tokio::select! {
                result = transfer => result,
                _ = abort.fired() => Err(PumpError::Aborted),
            },
            None => transfer.await,
        }
    };

    match result {
        Ok(()) => {}
        Err(PumpError::Aborted) => {
            debug!("[PUMP] {} closed after the other direction failed", details)
        }
        Err(e) => {
            warn!("[PUMP] {} ended with error: {}", details, e);
            if let Some(abort) = &abort {
                abort.fire();
            }
        }
    }

    if let Err(e) = guarded(|| filter.connection_closed(&details)) {
        warn!("[PUMP] {} filter failed on close: {}", details, e);
    }

    if let Err(e) = destination.shutdown().await {
        debug!("[PUMP] {} shutdown of destination failed: {}", details, e);
    }

    debug!(
        "[PUMP] {} finished - read={} written={}",
        details, summary.bytes_read, summary.bytes_written
    );

    summary
}

/// Run a filter callback, turning a panic into a pump error
fn guarded<T>(call: impl FnOnce() -> Result<T, FilterError>) -> Result<T, PumpError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => Ok(result?),
        Err(payload) => Err(PumpError::FilterPanic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run<R, W>(
    source: &mut R,
    destination: &mut W,
    filter: &dyn Filter,
    details: &ConnectionDetails,
    initial: Option<Bytes>,
    summary: &mut PumpSummary,
) -> Result<(), PumpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(initial) = initial.filter(|b| !b.is_empty()) {
        forward(destination, filter, details, &initial, summary).await?;
    }

    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];

    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }

        forward(destination, filter, details, &buffer[..n], summary).await?;
    }
}

async fn forward<W>(
    destination: &mut W,
    filter: &dyn Filter,
    details: &ConnectionDetails,
    bytes: &[u8],
    summary: &mut PumpSummary,
) -> Result<(), PumpError>
where
    W: AsyncWrite + Unpin,
{
    summary.bytes_read += bytes.len() as u64;

    let replacement = guarded(|| filter.handle(details, bytes))?;
    let outgoing = replacement.as_deref().unwrap_or(bytes);

    destination.write_all(outgoing).await?;
    destination.flush().await?;
    summary.bytes_written += outgoing.len() as u64;

    Ok(())
}

/// Join handles of the two pumps of one connection
pub struct PumpPair {
    pub request: JoinHandle<PumpSummary>,
    pub response: JoinHandle<PumpSummary>,
}

impl PumpPair {
    /// Wait for both directions to finish
    pub async fn join(self) -> (PumpSummary, PumpSummary) {
        let request = joined("request", self.request).await;
        let response = joined("response", self.response).await;
        (request, response)
    }
}

async fn joined(direction: &str, handle: JoinHandle<PumpSummary>) -> PumpSummary {
    match handle.await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("[PUMP] {} pump task failed: {}", direction, e);
            PumpSummary::default()
        }
    }
}

/// Start both pumps of a connection.
///
/// Client to server bytes go through `request_filter` with `details`;
/// server to client bytes go through `response_filter` with
/// `details.other_end()`. If either pump fails the other one stops too,
/// and both streams are closed.
pub fn spawn_pair<C, S>(
    client: C,
    server: S,
    request_filter: Arc<dyn Filter>,
    response_filter: Arc<dyn Filter>,
    details: ConnectionDetails,
    initial: Option<Bytes>,
) -> PumpPair
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let response_details = details.other_end();
    let abort = PumpAbort::new();

    let request = tokio::spawn(pump_linked(
        client_read,
        server_write,
        request_filter,
        details,
        initial,
        Some(abort.clone()),
    ));
    let response = tokio::spawn(pump_linked(
        server_read,
        client_write,
        response_filter,
        response_details,
        None,
        Some(abort),
    ));

    PumpPair { request, response }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EndPoint;
    use crate::filter::{EchoFilter, MemorySink, NullFilter, Transcript};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    fn details() -> ConnectionDetails {
        ConnectionDetails::new(EndPoint::new("client", 1000), EndPoint::new("server", 2000), false)
            .unwrap()
    }

    struct Shout;

    impl Filter for Shout {
        fn name(&self) -> &str {
            "Shout"
        }

        fn handle(
            &self,
            _details: &ConnectionDetails,
            buffer: &[u8],
        ) -> Result<Option<Vec<u8>>, FilterError> {
            Ok(Some(buffer.to_ascii_uppercase()))
        }
    }

    struct Explode;

    impl Filter for Explode {
        fn name(&self) -> &str {
            "Explode"
        }

        fn handle(
            &self,
            _details: &ConnectionDetails,
            _buffer: &[u8],
        ) -> Result<Option<Vec<u8>>, FilterError> {
            Err(FilterError::failed("boom"))
        }
    }

    /// Panics on every buffer and counts closes
    #[derive(Default)]
    struct Panicky {
        closed: AtomicUsize,
    }

    impl Filter for Panicky {
        fn name(&self) -> &str {
            "Panicky"
        }

        fn handle(
            &self,
            _details: &ConnectionDetails,
            _buffer: &[u8],
        ) -> Result<Option<Vec<u8>>, FilterError> {
            panic!("filter bug");
        }

        fn connection_closed(&self, _details: &ConnectionDetails) -> Result<(), FilterError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_null_filter_is_transparent() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();

        let (mut writer, source) = duplex(8192);
        let (destination, mut reader) = duplex(8192);

        let task = tokio::spawn(pump(source, destination, Arc::new(NullFilter), details(), None));

        let expected = payload.clone();
        let write = tokio::spawn(async move {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        write.await.unwrap();

        assert_eq!(received, expected);
        let summary = task.await.unwrap();
        assert_eq!(summary.bytes_read, 200_000);
        assert_eq!(summary.bytes_written, 200_000);
    }

    #[tokio::test]
    async fn test_initial_bytes_first() {
        let (mut writer, source) = duplex(1024);
        let (destination, mut reader) = duplex(1024);

        let task = tokio::spawn(pump(
            source,
            destination,
            Arc::new(NullFilter),
            details(),
            Some(Bytes::from_static(b"first ")),
        ));

        writer.write_all(b"second").await.unwrap();
        drop(writer);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"first second");
        assert_eq!(task.await.unwrap().bytes_read, 12);
    }

    #[tokio::test]
    async fn test_replacement_is_forwarded() {
        let (mut writer, source) = duplex(1024);
        let (destination, mut reader) = duplex(1024);

        let task = tokio::spawn(pump(source, destination, Arc::new(Shout), details(), None));

        writer.write_all(b"hello").await.unwrap();
        drop(writer);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"HELLO");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_error_ends_pump_and_closes() {
        let sink = MemorySink::new();
        let echo = EchoFilter::new(Transcript::new(sink.clone()));
        let mut chain = crate::filter::CompositeFilter::new();
        chain.add(Arc::new(echo));
        chain.add(Arc::new(Explode));

        let (mut writer, source) = duplex(1024);
        let (destination, mut reader) = duplex(1024);

        let task = tokio::spawn(pump(source, destination, Arc::new(chain), details(), None));

        writer.write_all(b"data").await.unwrap();

        // Destination sees EOF without the failed buffer
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());

        let summary = task.await.unwrap();
        assert_eq!(summary.bytes_written, 0);

        let transcript = sink.contents();
        assert!(transcript.starts_with("--- client:1000->server:2000 opened --"));
        assert!(transcript.ends_with("--- client:1000->server:2000 closed --\n"));
    }

    #[tokio::test]
    async fn test_spawn_pair_uses_other_end_for_responses() {
        let sink = MemorySink::new();
        let echo: Arc<dyn Filter> = Arc::new(EchoFilter::new(Transcript::new(sink.clone())));

        let (client, mut client_peer) = duplex(1024);
        let (server, mut server_peer) = duplex(1024);

        let pair = spawn_pair(client, server, Arc::clone(&echo), echo, details(), None);

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_peer.write_all(b"pong").await.unwrap();
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        drop(server_peer);
        let (request, response) = pair.join().await;
        assert_eq!(request.bytes_written, 4);
        assert_eq!(response.bytes_written, 4);

        let transcript = sink.contents();
        assert!(transcript.contains("------ client:1000->server:2000 ------\nping\n"));
        assert!(transcript.contains("------ server:2000->client:1000 ------\npong\n"));
    }

    #[tokio::test]
    async fn test_filter_error_closes_both_directions() {
        let (client, mut client_peer) = duplex(1024);
        let (server, mut server_peer) = duplex(1024);

        let pair = spawn_pair(
            client,
            server,
            Arc::new(Explode),
            Arc::new(NullFilter),
            details(),
            None,
        );

        client_peer.write_all(b"x").await.unwrap();

        // The server stays open and idle, the client is still closed
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client_peer.read(&mut buf))
            .await
            .expect("client side left open")
            .unwrap();
        assert_eq!(n, 0);

        let n = timeout(Duration::from_secs(2), server_peer.read(&mut buf))
            .await
            .expect("server side left open")
            .unwrap();
        assert_eq!(n, 0);

        let (request, response) = timeout(Duration::from_secs(2), pair.join())
            .await
            .unwrap();
        assert_eq!(request.bytes_written, 0);
        assert_eq!(response.bytes_read, 0);
    }

    #[tokio::test]
    async fn test_end_of_stream_is_a_half_close() {
        let (client, mut client_peer) = duplex(1024);
        let (server, mut server_peer) = duplex(1024);

        let pair = spawn_pair(
            client,
            server,
            Arc::new(NullFilter),
            Arc::new(NullFilter),
            details(),
            None,
        );

        client_peer.write_all(b"request").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        server_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");

        // The response direction still works after the request side ended
        server_peer.write_all(b"response").await.unwrap();
        drop(server_peer);

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response");

        let (request, response) = pair.join().await;
        assert_eq!(request.bytes_written, 7);
        assert_eq!(response.bytes_written, 8);
    }

    #[tokio::test]
    async fn test_filter_panic_closes_connection() {
        let filter = Arc::new(Panicky::default());

        let (client, mut client_peer) = duplex(1024);
        let (server, _server_peer) = duplex(1024);

        let pair = spawn_pair(
            client,
            server,
            Arc::clone(&filter) as Arc<dyn Filter>,
            Arc::new(NullFilter),
            details(),
            None,
        );

        client_peer.write_all(b"x").await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), client_peer.read(&mut buf))
            .await
            .expect("client side left open")
            .unwrap();
        assert_eq!(n, 0);

        let (request, _) = timeout(Duration::from_secs(2), pair.join())
            .await
            .unwrap();
        assert_eq!(request.bytes_read, 1);
        assert_eq!(request.bytes_written, 0);
        assert_eq!(filter.closed.load(Ordering::SeqCst), 1);
    }
}
