//! Response envelope and typed return payloads.

use serde::{Deserialize, Serialize};

/// Response envelope.
///
/// A success carries the command-specific result under `return`. Real
/// agents report failures under `error`; that member is kept opaque here
/// so callers can fold it into diagnostics — the transport layer itself
/// never branches on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QgaResponse {
    /// Command-specific result. Absence of an expected field inside it
    /// is the caller's protocol error to raise.
    #[serde(rename = "return", skip_serializing_if = "Option::is_none")]
    pub ret: Option<serde_json::Value>,
    /// Agent-reported error, passed through verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl QgaResponse {
    /// Wrap a `return` value.
    pub fn with_return(value: serde_json::Value) -> Self {
        Self {
            ret: Some(value),
            error: None,
        }
    }

    /// One-line rendering for error messages.
    pub fn summary(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "<unprintable response>".into())
    }
}

/// `guest-exec` return payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecReturn {
    /// Correlation token for subsequent `guest-exec-status` polls.
    pub pid: i64,
}

/// `guest-exec-status` return payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecStatus {
    /// True once the process has exited; only then are the other
    /// members meaningful.
    pub exited: bool,
    /// Numeric exit code. Agents have been observed to omit it.
    pub exitcode: Option<i32>,
    /// Captured stdout, base64. Absent means empty.
    #[serde(rename = "out-data")]
    pub out_data: Option<String>,
    /// Captured stderr, base64. Absent means empty.
    #[serde(rename = "err-data")]
    pub err_data: Option<String>,
}

/// `guest-file-write` return payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WriteReturn {
    /// Bytes the agent accepted. A missing count reads as 0, which the
    /// client treats as a short write.
    #[serde(default)]
    pub count: u64,
}
