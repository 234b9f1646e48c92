//! Echo filter - human readable transcript of proxied traffic
//!
//! Output format:
//!
//! ```text
//! --- 127.0.0.1:50123->example.org:80 opened --
//! ------ 127.0.0.1:50123->example.org:80 ------
//! GET / HTTP/1.1
//! Host: example.org
//!
//! --- 127.0.0.1:50123->example.org:80 closed --
//! ```
//!
//! Printable ASCII, CR, LF and TAB are written as is; every run of other
//! bytes is written as upper-case hex inside brackets, e.g. `[01E7]`.

use super::{Filter, FilterError, TerminalColour};
use crate::connection::ConnectionDetails;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Shared destination for transcript output.
///
/// Each event is written and flushed under a single lock, so blocks from
/// concurrent streams never interleave.
#[derive(Clone)]
pub struct Transcript {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Transcript {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    /// Transcript written to standard output
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one complete block
    pub fn write_block(&self, block: &str) -> Result<(), FilterError> {
        let mut out = self.out.lock().map_err(|_| FilterError::OutputPoisoned)?;
        out.write_all(block.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript").finish_non_exhaustive()
    }
}

/// In-memory transcript sink, handy for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn clear(&self) {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Filter that echoes everything it sees to a [`Transcript`]
#[derive(Debug, Clone)]
pub struct EchoFilter {
    transcript: Transcript,
    colour: Option<TerminalColour>,
}

impl EchoFilter {
    pub fn new(transcript: Transcript) -> Self {
        Self {
            transcript,
            colour: None,
        }
    }

    /// Wrap every block in the given terminal colour
    pub fn with_colour(mut self, colour: TerminalColour) -> Self {
        self.colour = Some(colour);
        self
    }

    fn emit(&self, body: &str) -> Result<(), FilterError> {
        match self.colour {
            Some(colour) => self.transcript.write_block(&format!(
                "{}{}{}",
                colour.control_string(),
                body,
                TerminalColour::NONE
            )),
            None => self.transcript.write_block(body),
        }
    }
}

/// Render a buffer for the transcript
pub fn format_bytes(buffer: &[u8]) -> String {
    let mut output = String::with_capacity(buffer.len());
    let mut in_hex_run = false;

    for &byte in buffer {
        let printable = matches!(byte, 0x20..=0x7e | b'\r' | b'\n' | b'\t');

        if printable {
            if in_hex_run {
                output.push(']');
                in_hex_run = false;
            }
            output.push(byte as char);
        } else {
            if !in_hex_run {
                output.push('[');
                in_hex_run = true;
            }
            let _ = write!(output, "{:02X}", byte);
        }
    }

    if in_hex_run {
        output.push(']');
    }

    output
}

impl Filter for EchoFilter {
    fn name(&self) -> &str {
        "EchoFilter"
    }

    fn connection_opened(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        self.emit(&format!("--- {} opened --\n", details))
    }

    fn handle(
        &self,
        details: &ConnectionDetails,
        buffer: &[u8],
    ) -> Result<Option<Vec<u8>>, FilterError> {
        self.emit(&format!(
            "------ {} ------\n{}\n",
            details,
            format_bytes(buffer)
        ))?;

        Ok(None)
    }

    fn connection_closed(&self, details: &ConnectionDetails) -> Result<(), FilterError> {
        self.emit(&format!("--- {} closed --\n", details))
    }
}
