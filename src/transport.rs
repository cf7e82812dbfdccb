//! Transport layer.
//!
//! Abstracts the agent connection for testability:
//! - `Transport` trait: one request in, one response out
//! - `UnixTransport`: real Unix-socket connection for production
//! - `MockTransport`: scripted in-process agent for unit tests
//!
//! Discipline: a fresh connection per call, exactly one newline-terminated
//! JSON document written, exactly one read back. No pipelining, no reuse.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use qga_protocol::{QgaRequest, QgaResponse};

use crate::error::{QgaError, Result};

/// Socket read timeout. The exec poll budget is enforced above this
/// layer; this only guards against an agent that stops mid-response.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Socket write timeout. Writes are one line; if they stall, the
/// connection is broken.
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Transport seam between operations and the wire.
pub trait Transport: Send + Sync {
    /// Send one request and read one response.
    fn send(&self, request: &QgaRequest) -> Result<QgaResponse>;
}

/// Unix-socket transport to a live guest agent.
pub struct UnixTransport {
    socket_path: PathBuf,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl UnixTransport {
    /// Create a transport for the agent socket at `socket_path`.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }

    /// Override the per-call socket timeouts.
    pub fn with_timeouts(mut self, read: Duration, write: Duration) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Path of the agent socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Transport for UnixTransport {
    fn send(&self, request: &QgaRequest) -> Result<QgaResponse> {
        let mut stream =
            UnixStream::connect(&self.socket_path).map_err(|e| QgaError::Connection {
                endpoint: self.socket_path.clone(),
                source: e,
            })?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;

        let mut line = serde_json::to_vec(request)
            .map_err(|e| QgaError::Protocol(format!("failed to serialize request: {e}")))?;
        line.push(b'\n');

        tracing::debug!(command = request.execute.as_str(), "sending request");
        stream.write_all(&line)?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        let read = reader.read_line(&mut response_line)?;
        if read == 0 {
            return Err(QgaError::Protocol("no response from guest agent".into()));
        }

        serde_json::from_str(&response_line)
            .map_err(|e| QgaError::Protocol(format!("invalid response JSON: {e}")))
    }
}

/// Mock transport for tests: replays a scripted response queue and
/// records every request it sees.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<QgaResponse>>>,
    sent: Mutex<Vec<QgaRequest>>,
}

impl MockTransport {
    /// Create a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a success response wrapping the given `return` value.
    pub fn push_return(&self, value: serde_json::Value) {
        self.push_response(QgaResponse::with_return(value));
    }

    /// Queue a full response.
    pub fn push_response(&self, response: QgaResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a transport-level failure.
    pub fn push_error(&self, error: QgaError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Requests sent so far, in order.
    pub fn requests(&self) -> Vec<QgaRequest> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &QgaRequest) -> Result<QgaResponse> {
        self.sent.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(QgaError::Protocol("mock transport script exhausted".into())))
    }
}
