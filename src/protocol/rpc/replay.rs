//! Replay cache for at-most-once execution.
//!
//! A retransmitted request must not run its procedure a second time. The
//! server therefore remembers every call it is serving and, once replied,
//! the reply itself, keyed by XID, source address, program, version and
//! procedure. A duplicate of a call still being served is dropped; a
//! duplicate of a replied call gets the cached reply again.
//!
//! How long replies are kept depends on the transport:
//!
//! - unreliable (datagram): the newest `capacity` replies, oldest evicted
//!   first;
//! - resumable (stream that may be re-established): each reply remembers the
//!   transport byte offset it was sent at, and is evicted once the peer is
//!   known to have received the stream past that offset. Offsets are reset
//!   to 0 on resumption, since they refer to a dead connection; such entries
//!   are only dropped when a new request arrives.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

/// Default number of replies a datagram server keeps.
pub const DEFAULT_REPLAY_CAPACITY: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplayPolicy {
    Unreliable { capacity: usize },
    Resumable,
}

/// Identity of a request for duplicate detection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReplayKey {
    pub xid: u32,
    pub source: Option<SocketAddr>,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
}

/// Result of checking an arriving request against the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Not seen before; now recorded as in progress.
    New,
    /// A duplicate of a call that has not been replied to yet.
    InProgress,
    /// A duplicate of a replied call; this is the reply to send again.
    Replied(Arc<[u8]>),
}

struct Entry {
    reply: Option<Arc<[u8]>>,
    offset: u64,
}

pub struct ReplayCache {
    policy: ReplayPolicy,
    entries: HashMap<ReplayKey, Entry>,
    /// Replied keys, oldest first.
    order: VecDeque<ReplayKey>,
}

impl ReplayCache {
    pub fn new(policy: ReplayPolicy) -> Self {
        Self { policy, entries: HashMap::new(), order: VecDeque::new() }
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Checks an arriving request, recording it as in progress if it is new.
    pub fn begin(&mut self, key: &ReplayKey) -> Lookup {
        if let Some(entry) = self.entries.get(key) {
            return match &entry.reply {
                Some(reply) => Lookup::Replied(Arc::clone(reply)),
                None => Lookup::InProgress,
            };
        }
        if self.policy == ReplayPolicy::Resumable {
            self.evict_stale();
        }
        self.entries.insert(key.clone(), Entry { reply: None, offset: 0 });
        Lookup::New
    }

    /// Stores the reply of a finished call.
    ///
    /// `offset` is the transport offset just past the reply and
    /// `known_received` the offset the peer has certainly read up to; both
    /// only matter to resumable caches.
    pub fn complete(&mut self, key: &ReplayKey, reply: Arc<[u8]>, offset: u64, known_received: u64) {
        self.entries.insert(key.clone(), Entry { reply: Some(reply), offset });
        self.order.retain(|k| k != key);
        self.order.push_back(key.clone());
        match self.policy {
            ReplayPolicy::Unreliable { capacity } => {
                while self.order.len() > capacity {
                    self.evict_front();
                }
            }
            ReplayPolicy::Resumable => self.evict_received(known_received),
        }
    }

    /// Notes that a cached reply was sent again at `offset`.
    pub fn resent(&mut self, key: &ReplayKey, offset: u64) {
        if self.policy != ReplayPolicy::Resumable {
            return;
        }
        if let Some(entry) = self.entries.get_mut(key) {
            entry.offset = offset;
            self.order.retain(|k| k != key);
            self.order.push_back(key.clone());
        }
    }

    /// Forgets a call, replied or not.
    pub fn remove(&mut self, key: &ReplayKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }

    /// Marks every cached reply as belonging to a previous connection.
    pub fn reset_offsets(&mut self) {
        for entry in self.entries.values_mut() {
            entry.offset = 0;
        }
    }

    pub fn contains(&self, key: &ReplayKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Transport offset recorded for a cached reply.
    pub fn offset(&self, key: &ReplayKey) -> Option<u64> {
        self.entries.get(key).filter(|e| e.reply.is_some()).map(|e| e.offset)
    }

    /// Calls tracked, in progress or replied.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached replies.
    pub fn replied(&self) -> usize {
        self.order.len()
    }

    fn evict_front(&mut self) {
        if let Some(key) = self.order.pop_front() {
            self.entries.remove(&key);
        }
    }

    fn front_offset(&self) -> Option<u64> {
        let key = self.order.front()?;
        self.entries.get(key).map(|e| e.offset)
    }

    fn evict_stale(&mut self) {
        while self.front_offset() == Some(0) {
            self.evict_front();
        }
    }

    fn evict_received(&mut self, known_received: u64) {
        while let Some(offset) = self.front_offset() {
            if offset == 0 || offset >= known_received {
                break;
            }
            self.evict_front();
        }
    }
}
