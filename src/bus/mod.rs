//! Event bus adapter.
//!
//! The bus transport contract is methods plus event signals with a
//! bus-supplied peer identity. This adapter renders methods as
//! `POST /bus/<MethodName>` with a JSON body and the peer id in the
//! `x-bus-peer` header, and delivers signals over a per-peer SSE stream
//! (`GET /bus/signals`), filtered to the handles that peer owns. Dropping
//! the signal stream counts as a peer disconnect and sweeps the peer's
//! registrations.

pub mod handlers;
pub mod router;
pub mod signals;

pub use signals::{Signal, SignalBus};

/// Header carrying the transport's opaque peer identity.
pub const PEER_HEADER: &str = "x-bus-peer";
