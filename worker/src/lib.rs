//! Worker runtime
//!
//! The process side of the gateway's worker protocol:
//! - read `start` from stdin, emit `ready` (or `error`) on stdout
//! - serve `POST /executeCommand` and `GET /ready` on a loopback port
//! - report progress and results for deferred calls to the gateway's internal webhook
//!
//! Stdout belongs to the protocol; log to stderr.

pub mod plugin;
pub mod reporter;
pub mod runtime;

pub use plugin::{CallContext, Outcome, Plugin};
pub use reporter::LedgerReporter;
pub use runtime::{serve, serve_with_io, WorkerRuntimeError};
