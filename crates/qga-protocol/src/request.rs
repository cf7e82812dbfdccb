//! Request envelope and the command set.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Commands understood by the guest agent.
///
/// The client speaks exactly this closed set; the agent supports more,
/// but none are needed for exec-and-wait or file push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    /// Launch a process in the guest, returns `{pid}`.
    GuestExec,
    /// Poll a launched process by pid, returns exit state and captured output.
    GuestExecStatus,
    /// Open a file in the guest, returns an integer handle.
    GuestFileOpen,
    /// Write a base64 chunk to an open handle, returns `{count}`.
    GuestFileWrite,
    /// Close an open handle.
    GuestFileClose,
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::GuestExec => "guest-exec",
            Command::GuestExecStatus => "guest-exec-status",
            Command::GuestFileOpen => "guest-file-open",
            Command::GuestFileWrite => "guest-file-write",
            Command::GuestFileClose => "guest-file-close",
        }
    }
}

/// Request envelope.
///
/// Serialized as a single newline-terminated JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QgaRequest {
    /// Command name.
    pub execute: Command,
    /// Command-specific arguments.
    pub arguments: serde_json::Value,
}

impl QgaRequest {
    /// Build a `guest-exec` request with output capture.
    pub fn guest_exec(path: &str, args: &[&str], capture_output: bool) -> Self {
        Self {
            execute: Command::GuestExec,
            arguments: json!({
                "path": path,
                "arg": args,
                "capture-output": capture_output,
            }),
        }
    }

    /// Build a `guest-exec-status` poll keyed by pid.
    pub fn guest_exec_status(pid: i64) -> Self {
        Self {
            execute: Command::GuestExecStatus,
            arguments: json!({ "pid": pid }),
        }
    }

    /// Build a `guest-file-open` request.
    pub fn guest_file_open(path: &str, mode: &str) -> Self {
        Self {
            execute: Command::GuestFileOpen,
            arguments: json!({ "path": path, "mode": mode }),
        }
    }

    /// Build a `guest-file-write` request carrying one encoded chunk.
    pub fn guest_file_write(handle: i64, buf_b64: &str) -> Self {
        Self {
            execute: Command::GuestFileWrite,
            arguments: json!({ "handle": handle, "buf-b64": buf_b64 }),
        }
    }

    /// Build a `guest-file-close` request.
    pub fn guest_file_close(handle: i64) -> Self {
        Self {
            execute: Command::GuestFileClose,
            arguments: json!({ "handle": handle }),
        }
    }
}
