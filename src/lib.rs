//! Mamont ARPC - an asynchronous ONC RPC runtime in Rust
//!
//! This library lets peers exchange typed requests and replies over
//! unreliable datagrams or reliable byte streams, with retransmission and
//! at-most-once execution.
//!
//! ## Main Components
//!
//! - `transport`: datagram, framed stream and unix-domain transports with a
//!   single receive handler, EOF reporting and byte accounting. Unix
//!   transports also pass open file descriptors.
//!
//! - `protocol::xdr`: the XDR codec, RPC envelopes and call/reply helpers.
//!
//! - `protocol::rpc`: per-transport sessions, the client engine (XIDs,
//!   timeouts, datagram retransmission, resumable clients) and the server
//!   engine (dispatch, protocol error replies, replay caches).
//!
//! - `tcp`: listeners and connectors that produce transports.
//!
//! ## Standards Compliance
//!
//! This implementation follows these RFCs:
//! - RFC 5531: RPC: Remote Procedure Call Protocol Specification Version 2
//! - RFC 4506: XDR: External Data Representation Standard
//! - RFC 1833: Binding Protocols for ONC RPC Version 2 (portmap lookups)
//!
//! ## Usage
//!
//! Wrap a socket in a [`transport::Transport`], describe the program with
//! [`protocol::rpc::Program`], then attach a [`protocol::rpc::Client`] to
//! call it or a [`protocol::rpc::Server`] to serve it.

pub mod protocol;
pub mod tcp;
pub mod transport;

pub use protocol::rpc;
pub use protocol::xdr;
