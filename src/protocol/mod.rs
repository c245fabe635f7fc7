//! Protocol module implements ONC RPC on top of the transports.
//!
//! - `xdr`: External Data Representation (RFC 4506) for the RPC envelopes and
//!   for application argument and result types.
//!
//! - `rpc`: sessions, clients, servers and the replay cache (RFC 5531).

pub mod rpc;
pub mod xdr;
