//! Retransmission and reconnection policies.

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::client::ClientShared;
use super::session::CallId;
use crate::transport::Transport;
use crate::xdr::rpc::clnt_stat;

/// Exponential backoff for calls over datagram transports.
///
/// The first send waits `initial_timeout` for a reply, each retransmission
/// waits twice as long as the previous one, and once `max_sends` sends went
/// unanswered the call times out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_timeout: Duration,
    pub max_sends: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { initial_timeout: Duration::from_secs(2), max_sends: 5 }
    }
}

impl RetryPolicy {
    pub fn with_initial_timeout(mut self, timeout: Duration) -> Self {
        self.initial_timeout = timeout;
        self
    }

    pub fn with_max_sends(mut self, max_sends: u32) -> Self {
        self.max_sends = max_sends;
        self
    }

    /// How long to wait after each send.
    pub fn waits(&self) -> impl Iterator<Item = Duration> {
        let initial = self.initial_timeout;
        (0..self.max_sends.max(1)).map(move |n| initial.saturating_mul(1 << n.min(16)))
    }
}

/// Resends an already transmitted call until it completes or the policy
/// gives up. Holds only a weak reference, so a dropped client stops it.
pub(crate) async fn retransmit(client: Weak<ClientShared>, call: CallId, policy: RetryPolicy) {
    let mut waits = policy.waits().peekable();
    while let Some(wait) = waits.next() {
        tokio::time::sleep(wait).await;
        let Some(client) = client.upgrade() else {
            return;
        };
        if waits.peek().is_none() {
            debug!("call {} unanswered after {} sends", call, policy.max_sends);
            client.finish(call, clnt_stat::RPC_TIMEDOUT);
            return;
        }
        if !client.resend(call) {
            return;
        }
        trace!("retransmitted call {} after {:?}", call, wait);
    }
}

/// Establishes replacement transports for a resumable client.
#[async_trait]
pub trait Reconnect: Send + Sync {
    async fn connect(&self) -> io::Result<Arc<Transport>>;
}

/// Backoff between reconnection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` keeps trying forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { initial_delay: Duration::from_secs(1), max_delay: Duration::from_secs(64), max_attempts: None }
    }
}

impl ReconnectPolicy {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// The delay after `delay`, doubled and capped.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_delay)
    }
}

