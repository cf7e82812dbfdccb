//! QGA Protocol Types
//!
//! Defines the JSON envelope for the QEMU guest agent dialect: one JSON
//! object per line in each direction, a request carrying `execute` and
//! `arguments`, a response carrying `return`.

pub mod request;
pub mod response;

pub use request::{Command, QgaRequest};
pub use response::{ExecReturn, ExecStatus, QgaResponse, WriteReturn};
