//! ONC RPC version 2 (RFC 5531) call dispatch.
//!
//! Everything here sits on top of a [`Transport`](crate::transport::Transport):
//!
//! 1. a [`Session`] per transport routes inbound messages by direction and XID
//!    and owns XID allocation;
//! 2. [`Client`] issues calls and completes each one exactly once, resending
//!    on datagram transports and surviving reconnection when resumable;
//! 3. [`Server`] dispatches calls to the application, answers protocol errors
//!    itself and keeps a [`ReplayCache`] for at-most-once execution;
//! 4. [`Program`] describes a program version's procedures for both sides.

mod client;
pub mod portmap;
mod program;
mod replay;
mod retry;
mod server;
mod session;

pub use client::{CallHandle, CallOptions, Client, ClientConfig};
pub use program::{Procedure, Program};
pub use replay::{Lookup, ReplayCache, ReplayKey, ReplayPolicy, DEFAULT_REPLAY_CAPACITY};
pub use retry::{Reconnect, ReconnectPolicy, RetryPolicy};
pub use server::{Server, ServerConfig, ServerEvent, ServiceCall, ServiceHandler};
pub use session::{RandomXids, Session, SessionConfig, XidSource};
