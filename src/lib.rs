//! QGA Client - exec and file push against a QEMU guest agent
//!
//! This crate implements a client for the guest agent's line-delimited
//! JSON protocol over a Unix socket: run a shell command in the guest and
//! wait for its exit, or push a local file into the guest.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ClientConfig, Clock, ExecResult, PollState, QgaClient, WallClock};
pub use error::QgaError;
pub use qga_protocol::{Command, QgaRequest, QgaResponse};
pub use transport::{MockTransport, Transport, UnixTransport};
