//! Exec and file-push operations on top of a [`Transport`].
//!
//! `exec` submits `guest-exec`, then drives a bounded poll loop against
//! `guest-exec-status`. `push` opens a remote handle, streams the local
//! file in fixed-size base64 chunks, and closes the handle on every exit
//! path. Both are strictly sequential: one request in flight, ordering
//! mandated by the agent (submit before polls, open before writes before
//! close).

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use qga_protocol::{Command, ExecReturn, ExecStatus, QgaRequest, QgaResponse, WriteReturn};
use serde::de::DeserializeOwned;

use crate::error::{QgaError, Result};
use crate::transport::Transport;

/// Delay between `guest-exec-status` polls.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bytes read from the local file per `guest-file-write`.
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Tunables for the two operations.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Fixed delay between status polls.
    pub poll_interval: Duration,
    /// Raw (pre-encoding) chunk size for pushes.
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Time source for the poll loop.
///
/// Injected so tests can drive the state machine without real
/// wall-clock waits.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
    /// Block for `duration`.
    fn sleep(&self, duration: Duration);
}

/// System clock: `Instant::now` and `thread::sleep`.
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Outcome of a completed exec.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code reported by the agent; 1 when the agent omitted it.
    pub exit_code: i32,
    /// Decoded captured stdout.
    pub stdout: Vec<u8>,
    /// Decoded captured stderr.
    pub stderr: Vec<u8>,
}

/// Poll loop state. `Exited` and `TimedOut` are terminal: once reached,
/// the pid is never polled again.
#[derive(Debug)]
pub enum PollState {
    /// Process still running, deadline not reached.
    Pending,
    /// Terminal success, carrying the last-polled status.
    Exited(ExecStatus),
    /// Terminal failure: deadline elapsed before exit.
    TimedOut,
}

/// Single transition of the poll state machine.
pub fn poll_transition(status: ExecStatus, elapsed: Duration, timeout: Duration) -> PollState {
    if status.exited {
        PollState::Exited(status)
    } else if elapsed > timeout {
        PollState::TimedOut
    } else {
        PollState::Pending
    }
}

/// Client for the two remote operations.
pub struct QgaClient {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl QgaClient {
    /// Create a client with default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    /// Create a client with custom configuration.
    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            clock: Arc::new(WallClock),
        }
    }

    /// Replace the time source. Tests use this to drive the poll loop
    /// deterministically.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run a shell command in the guest and wait for it to exit.
    ///
    /// Submits `guest-exec` of `/bin/sh -c <command>` with output
    /// capture, then polls `guest-exec-status` at a fixed interval until
    /// the process exits or `timeout` elapses. Transport errors abort
    /// without resubmitting — a resubmit would launch the command twice.
    /// On timeout the guest process keeps running; the protocol offers
    /// no cancel.
    pub fn exec(&self, command: &str, timeout: Duration) -> Result<ExecResult> {
        let submit = QgaRequest::guest_exec("/bin/sh", &["-c", command], true);
        let response = self.transport.send(&submit)?;
        let ExecReturn { pid } = decode_return(&response, Command::GuestExec)?;
        tracing::debug!(pid, command, "guest-exec submitted");

        let started = self.clock.now();
        loop {
            let response = self.transport.send(&QgaRequest::guest_exec_status(pid))?;
            let status: ExecStatus = decode_return(&response, Command::GuestExecStatus)?;
            let elapsed = self.clock.now().duration_since(started);

            match poll_transition(status, elapsed, timeout) {
                PollState::Exited(status) => return decode_exec_result(status),
                PollState::TimedOut => {
                    return Err(QgaError::Timeout {
                        command: command.to_string(),
                        elapsed,
                    })
                }
                PollState::Pending => self.clock.sleep(self.config.poll_interval),
            }
        }
    }

    /// Copy a local file into the guest at `remote`.
    ///
    /// The remote handle is closed exactly once on every exit path. A
    /// close failure never masks an earlier transfer failure.
    pub fn push(&self, local: &Path, remote: &str) -> Result<()> {
        if !local.is_file() {
            return Err(QgaError::NotFound(local.to_path_buf()));
        }

        let response = self
            .transport
            .send(&QgaRequest::guest_file_open(remote, "wb"))?;
        let handle = response
            .ret
            .as_ref()
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                QgaError::Protocol(format!(
                    "guest-file-open returned no handle for {remote}: {}",
                    response.summary()
                ))
            })?;

        let transfer = self.transfer(handle, local);
        let close = self.transport.send(&QgaRequest::guest_file_close(handle));

        match (transfer, close) {
            (Ok(total), Ok(_)) => {
                tracing::debug!(total, remote, "push complete");
                Ok(())
            }
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(transfer_err), Ok(_)) => Err(transfer_err),
            (Err(transfer_err), Err(close_err)) => {
                tracing::warn!(handle, error = %close_err, "guest-file-close failed after transfer error");
                Err(transfer_err)
            }
        }
    }

    /// Stream the file through the open handle. Aborts on the first
    /// chunk whose acknowledged count differs from its raw length; the
    /// protocol cannot resume mid-chunk.
    fn transfer(&self, handle: i64, local: &Path) -> Result<u64> {
        let mut file = File::open(local)?;
        let mut chunk = vec![0u8; self.config.chunk_size];
        let mut total: u64 = 0;

        loop {
            let len = read_chunk(&mut file, &mut chunk)?;
            if len == 0 {
                break;
            }

            let encoded = BASE64.encode(&chunk[..len]);
            let response = self
                .transport
                .send(&QgaRequest::guest_file_write(handle, &encoded))?;
            let count = match &response.ret {
                Some(value) => {
                    let ret: WriteReturn = serde_json::from_value(value.clone()).map_err(|e| {
                        QgaError::Protocol(format!("guest-file-write return malformed: {e}"))
                    })?;
                    ret.count
                }
                None => 0,
            };

            if count != len as u64 {
                return Err(QgaError::ShortWrite {
                    sent: len,
                    acknowledged: count,
                });
            }
            total += count;
            tracing::trace!(handle, chunk = len, total, "chunk acknowledged");
        }

        Ok(total)
    }
}

/// Fill `buf` from `file`, stopping early only at EOF. Keeps chunks at
/// full size so the write count per chunk is predictable.
fn read_chunk(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Extract and deserialize the `return` member, raising a protocol
/// error when it is absent or malformed.
fn decode_return<T: DeserializeOwned>(response: &QgaResponse, command: Command) -> Result<T> {
    let ret = response.ret.clone().ok_or_else(|| {
        QgaError::Protocol(format!(
            "{} response missing return: {}",
            command.as_str(),
            response.summary()
        ))
    })?;
    serde_json::from_value(ret).map_err(|e| {
        QgaError::Protocol(format!("{} return malformed: {e}", command.as_str()))
    })
}

/// Decode a terminal status into the caller-facing result. An absent
/// exit code reads as 1: an agent that exits without reporting a code is
/// not treated as success.
fn decode_exec_result(status: ExecStatus) -> Result<ExecResult> {
    Ok(ExecResult {
        exit_code: status.exitcode.unwrap_or(1),
        stdout: decode_output(status.out_data, "out-data")?,
        stderr: decode_output(status.err_data, "err-data")?,
    })
}

fn decode_output(data: Option<String>, field: &str) -> Result<Vec<u8>> {
    match data {
        Some(encoded) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| QgaError::Protocol(format!("undecodable {field}: {e}"))),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::io::Write as _;
    use std::sync::Mutex;

    /// Clock that only advances when the poll loop sleeps.
    struct ManualClock {
        now: Mutex<Instant>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                now: Mutex::new(Instant::now()),
            }
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            *self.now.lock().unwrap() += duration;
        }
    }

    fn client_with(transport: Arc<MockTransport>, config: ClientConfig) -> QgaClient {
        QgaClient::with_config(transport, config).with_clock(Arc::new(ManualClock::new()))
    }

    fn status_not_exited() -> serde_json::Value {
        json!({ "exited": false })
    }

    // === poll state machine ===

    #[test]
    fn test_transition_exited_wins_over_deadline() {
        let status: ExecStatus =
            serde_json::from_value(json!({ "exited": true, "exitcode": 3 })).unwrap();
        let state = poll_transition(status, Duration::from_secs(99), Duration::from_secs(1));
        match state {
            PollState::Exited(s) => assert_eq!(s.exitcode, Some(3)),
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[test]
    fn test_transition_pending_within_deadline() {
        let status: ExecStatus = serde_json::from_value(status_not_exited()).unwrap();
        let state = poll_transition(status, Duration::from_millis(999), Duration::from_secs(1));
        assert!(matches!(state, PollState::Pending));
    }

    #[test]
    fn test_transition_timed_out_past_deadline() {
        let status: ExecStatus = serde_json::from_value(status_not_exited()).unwrap();
        let state = poll_transition(status, Duration::from_millis(1001), Duration::from_secs(1));
        assert!(matches!(state, PollState::TimedOut));
    }

    // === exec ===

    #[test]
    fn test_exec_polls_until_exit() {
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!({ "pid": 4321 }));
        mock.push_return(status_not_exited());
        mock.push_return(status_not_exited());
        mock.push_return(json!({
            "exited": true,
            "exitcode": 0,
            "out-data": BASE64.encode("hi\n"),
        }));

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.exec("echo hi", Duration::from_secs(300)).unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hi\n");
        assert!(result.stderr.is_empty());

        // 1 submit + 2 "not yet" polls + 1 terminal poll
        let sent = mock.requests();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].execute, Command::GuestExec);
        assert_eq!(sent[0].arguments["path"], "/bin/sh");
        assert_eq!(sent[0].arguments["arg"][1], "echo hi");
        for poll in &sent[1..] {
            assert_eq!(poll.execute, Command::GuestExecStatus);
            assert_eq!(poll.arguments["pid"], 4321);
        }
    }

    #[test]
    fn test_exec_missing_pid_never_polls() {
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!({}));

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.exec("true", Duration::from_secs(1));

        assert!(matches!(result, Err(QgaError::Protocol(_))));
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_exec_timeout_stops_polling() {
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!({ "pid": 7 }));
        // Polls land at elapsed 0ms, 300ms, 600ms; the third exceeds the
        // 500ms deadline. Nothing further is scripted, so an extra poll
        // would surface as a Protocol error instead of Timeout.
        mock.push_return(status_not_exited());
        mock.push_return(status_not_exited());
        mock.push_return(status_not_exited());

        let config = ClientConfig {
            poll_interval: Duration::from_millis(300),
            ..ClientConfig::default()
        };
        let client = client_with(mock.clone(), config);
        let result = client.exec("sleep 60", Duration::from_millis(500));

        match result {
            Err(QgaError::Timeout { command, elapsed }) => {
                assert_eq!(command, "sleep 60");
                assert!(elapsed > Duration::from_millis(500));
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(mock.requests().len(), 4);
    }

    #[test]
    fn test_exec_absent_exitcode_reads_as_failure() {
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!({ "pid": 7 }));
        mock.push_return(json!({ "exited": true }));

        let client = client_with(mock, ClientConfig::default());
        let result = client.exec("true", Duration::from_secs(1)).unwrap();

        assert_eq!(result.exit_code, 1);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_exec_undecodable_output_is_protocol_error() {
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!({ "pid": 7 }));
        mock.push_return(json!({ "exited": true, "exitcode": 0, "out-data": "!!!" }));

        let client = client_with(mock, ClientConfig::default());
        let result = client.exec("true", Duration::from_secs(1));
        assert!(matches!(result, Err(QgaError::Protocol(_))));
    }

    // === push ===

    fn temp_file_with(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn decoded_chunk_len(request: &QgaRequest) -> usize {
        let encoded = request.arguments["buf-b64"].as_str().unwrap();
        BASE64.decode(encoded).unwrap().len()
    }

    #[test]
    fn test_push_chunks_and_closes() {
        let source = temp_file_with(150_000);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(11));
        mock.push_return(json!({ "count": 65536 }));
        mock.push_return(json!({ "count": 65536 }));
        mock.push_return(json!({ "count": 18928 }));
        mock.push_return(json!({}));

        let client = client_with(mock.clone(), ClientConfig::default());
        client.push(source.path(), "/tmp/dest").unwrap();

        let sent = mock.requests();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].execute, Command::GuestFileOpen);
        assert_eq!(sent[0].arguments["path"], "/tmp/dest");
        assert_eq!(sent[0].arguments["mode"], "wb");

        let chunk_lens: Vec<usize> = sent[1..4].iter().map(decoded_chunk_len).collect();
        assert_eq!(chunk_lens, vec![65536, 65536, 18928]);
        for write in &sent[1..4] {
            assert_eq!(write.execute, Command::GuestFileWrite);
            assert_eq!(write.arguments["handle"], 11);
        }

        assert_eq!(sent[4].execute, Command::GuestFileClose);
        assert_eq!(sent[4].arguments["handle"], 11);
    }

    #[test]
    fn test_push_empty_file_still_opens_and_closes() {
        let source = temp_file_with(0);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(3));
        mock.push_return(json!({}));

        let client = client_with(mock.clone(), ClientConfig::default());
        client.push(source.path(), "/tmp/empty").unwrap();

        let sent = mock.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].execute, Command::GuestFileOpen);
        assert_eq!(sent[1].execute, Command::GuestFileClose);
    }

    #[test]
    fn test_push_short_write_aborts_but_closes() {
        let source = temp_file_with(150_000);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(11));
        mock.push_return(json!({ "count": 65536 }));
        mock.push_return(json!({ "count": 1000 }));
        mock.push_return(json!({}));

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.push(source.path(), "/tmp/dest");

        match result {
            Err(QgaError::ShortWrite { sent, acknowledged }) => {
                assert_eq!(sent, 65536);
                assert_eq!(acknowledged, 1000);
            }
            other => panic!("expected ShortWrite, got {other:?}"),
        }

        let sent = mock.requests();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].execute, Command::GuestFileClose);
    }

    #[test]
    fn test_push_missing_count_reads_as_short_write() {
        let source = temp_file_with(100);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(11));
        mock.push_return(json!({}));
        mock.push_return(json!({}));

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.push(source.path(), "/tmp/dest");

        match result {
            Err(QgaError::ShortWrite { sent, acknowledged }) => {
                assert_eq!(sent, 100);
                assert_eq!(acknowledged, 0);
            }
            other => panic!("expected ShortWrite, got {other:?}"),
        }
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn test_push_missing_source_sends_nothing() {
        let mock = Arc::new(MockTransport::new());
        let client = client_with(mock.clone(), ClientConfig::default());

        let result = client.push(Path::new("/no/such/file"), "/tmp/dest");
        assert!(matches!(result, Err(QgaError::NotFound(_))));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_push_missing_handle_never_writes_or_closes() {
        let source = temp_file_with(100);
        let mock = Arc::new(MockTransport::new());
        mock.push_response(QgaResponse::default());

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.push(source.path(), "/tmp/dest");

        assert!(matches!(result, Err(QgaError::Protocol(_))));
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_push_close_failure_does_not_mask_transfer_error() {
        let source = temp_file_with(100);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(11));
        mock.push_return(json!({ "count": 5 }));
        mock.push_error(QgaError::Protocol("close refused".into()));

        let client = client_with(mock.clone(), ClientConfig::default());
        let result = client.push(source.path(), "/tmp/dest");

        assert!(matches!(result, Err(QgaError::ShortWrite { .. })));
        assert_eq!(mock.requests().len(), 3);
    }

    #[test]
    fn test_push_close_failure_after_clean_transfer_surfaces() {
        let source = temp_file_with(100);
        let mock = Arc::new(MockTransport::new());
        mock.push_return(json!(11));
        mock.push_return(json!({ "count": 100 }));
        mock.push_error(QgaError::Protocol("close refused".into()));

        let client = client_with(mock, ClientConfig::default());
        let result = client.push(source.path(), "/tmp/dest");
        assert!(matches!(result, Err(QgaError::Protocol(_))));
    }
}
