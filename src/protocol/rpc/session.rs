//! Per-transport registry of clients and servers.
//!
//! A [`Session`] owns a transport's receive handler and routes every inbound
//! message: replies go to the client that holds the matching XID, calls go
//! to the server registered for the (program, version) pair, anything else
//! is treated as a protocol violation. There is at most one session per
//! transport; it lives as long as a client or server holds it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::client::{self, ClientShared};
use super::server::{self, ServerShared};
use crate::transport::{Packet, ReceiveHandler, Transport};
use crate::xdr::rpc::{peek_header, CALL, REPLY};

pub(crate) type ClientId = u64;
pub(crate) type CallId = u64;

/// Unusable ids tolerated from an [`XidSource`] before it is replaced.
const MAX_XID_ATTEMPTS: usize = 64;

/// Produces transaction ids for outgoing calls.
///
/// The session skips 0 and ids that are still outstanding, so a source only
/// has to be unpredictable enough for the peer's replay cache. A source that
/// keeps producing unusable ids is replaced by [`RandomXids`].
pub trait XidSource: Send {
    fn next_xid(&mut self) -> u32;
}

/// Random ids from an entropy-seeded generator; the default.
pub struct RandomXids(StdRng);

impl Default for RandomXids {
    fn default() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl XidSource for RandomXids {
    fn next_xid(&mut self) -> u32 {
        self.0.gen()
    }
}

impl<F> XidSource for F
where
    F: FnMut() -> u32 + Send,
{
    fn next_xid(&mut self) -> u32 {
        self()
    }
}

/// How a session is attached to its transport.
pub struct SessionConfig {
    /// Start a task that keeps receiving. Without one, replies only arrive
    /// while somebody calls [`Transport::poll`].
    pub pump: bool,
    pub xid_source: Box<dyn XidSource>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { pump: true, xid_source: Box::<RandomXids>::default() }
    }
}

impl SessionConfig {
    pub fn without_pump(mut self) -> Self {
        self.pump = false;
        self
    }

    pub fn with_xid_source(mut self, source: impl XidSource + 'static) -> Self {
        self.xid_source = Box::new(source);
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig").field("pump", &self.pump).finish_non_exhaustive()
    }
}

struct SessionState {
    xid_source: Box<dyn XidSource>,
    xids: HashMap<u32, (ClientId, CallId)>,
    clients: HashMap<ClientId, Weak<ClientShared>>,
    next_client: ClientId,
    servers: BTreeMap<(u32, u32), Weak<ServerShared>>,
    serving: usize,
    max_acked_offset: u64,
}

pub struct Session {
    transport: Arc<Transport>,
    state: Mutex<SessionState>,
    eof: AtomicBool,
}

struct SessionDispatch(Weak<Session>);

impl ReceiveHandler for SessionDispatch {
    fn receive(&self, packet: Option<Packet>) {
        if let Some(session) = self.0.upgrade() {
            session.dispatch(packet);
        }
    }
}

impl Session {
    /// The session of `xprt`, attaching a new one if there is none.
    pub fn lookup(xprt: &Arc<Transport>) -> io::Result<Arc<Session>> {
        Self::lookup_with(xprt, SessionConfig::default())
    }

    /// Like [`Session::lookup`]; `config` only applies when a new session
    /// is attached.
    pub fn lookup_with(xprt: &Arc<Transport>, config: SessionConfig) -> io::Result<Arc<Session>> {
        if xprt.at_eof() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is at EOF"));
        }
        let session = {
            let mut slot = xprt.session_slot().lock().expect("unable to unlock session slot mutex");
            if let Some(session) = slot.upgrade() {
                return Ok(session);
            }
            let session = Arc::new(Session {
                transport: Arc::clone(xprt),
                state: Mutex::new(SessionState {
                    xid_source: config.xid_source,
                    xids: HashMap::new(),
                    clients: HashMap::new(),
                    next_client: 1,
                    servers: BTreeMap::new(),
                    serving: 0,
                    max_acked_offset: 0,
                }),
                eof: AtomicBool::new(false),
            });
            *slot = Arc::downgrade(&session);
            session
        };
        debug!("attached session to {:?}", xprt);
        xprt.set_receive_handler(Some(Arc::new(SessionDispatch(Arc::downgrade(&session)))));
        if config.pump {
            xprt.spawn_pump();
        }
        Ok(session)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("unable to unlock session mutex")
    }

    /// Calls currently being served on this transport, across all servers.
    pub fn serving(&self) -> usize {
        self.state().serving
    }

    /// Outstanding client calls on this transport.
    pub fn outstanding(&self) -> usize {
        self.state().xids.len()
    }

    /// Highest stream offset of a request the peer is known to have
    /// received, learned from its replies.
    pub fn max_acked_offset(&self) -> u64 {
        self.state().max_acked_offset
    }

    pub(crate) fn note_acked(&self, offset: u64) {
        let mut state = self.state();
        state.max_acked_offset = state.max_acked_offset.max(offset);
    }

    pub(crate) fn serving_started(&self) {
        self.state().serving += 1;
    }

    pub(crate) fn serving_finished(&self) {
        let mut state = self.state();
        state.serving = state.serving.saturating_sub(1);
    }

    pub(crate) fn register_client(&self, client: Weak<ClientShared>) -> ClientId {
        let mut state = self.state();
        let id = state.next_client;
        state.next_client += 1;
        state.clients.insert(id, client);
        id
    }

    pub(crate) fn unregister_client(&self, id: ClientId) {
        let mut state = self.state();
        state.clients.remove(&id);
        state.xids.retain(|_, (client, _)| *client != id);
    }

    /// Picks a fresh XID for a call and records who owns it.
    pub(crate) fn alloc_xid(&self, client: ClientId, call: CallId) -> u32 {
        let mut state = self.state();
        let mut attempts = 0;
        let xid = loop {
            let xid = state.xid_source.next_xid();
            if xid != 0 && !state.xids.contains_key(&xid) {
                break xid;
            }
            attempts += 1;
            if attempts == MAX_XID_ATTEMPTS {
                warn!("xid source gave {} unusable ids in a row, switching to random ids", attempts);
                state.xid_source = Box::<RandomXids>::default();
            }
        };
        state.xids.insert(xid, (client, call));
        xid
    }

    /// Records ownership of a caller-chosen XID; false if it is taken.
    pub(crate) fn claim_xid(&self, xid: u32, client: ClientId, call: CallId) -> bool {
        if xid == 0 {
            return false;
        }
        let mut state = self.state();
        if state.xids.contains_key(&xid) {
            return false;
        }
        state.xids.insert(xid, (client, call));
        true
    }

    pub(crate) fn release_xid(&self, xid: u32, client: ClientId, call: CallId) {
        let mut state = self.state();
        if state.xids.get(&xid) == Some(&(client, call)) {
            state.xids.remove(&xid);
        }
    }

    fn route_xid(&self, xid: u32) -> Option<(Arc<ClientShared>, CallId)> {
        let state = self.state();
        let (client, call) = *state.xids.get(&xid)?;
        let client = state.clients.get(&client)?.upgrade();
        // never release the last reference while the session is locked
        drop(state);
        Some((client?, call))
    }

    /// Registers a server for (`prog`, `vers`).
    ///
    /// # Panics
    ///
    /// Panics if a live server is already registered for the pair.
    pub(crate) fn register_server(&self, prog: u32, vers: u32, server: Weak<ServerShared>) {
        let mut state = self.state();
        if let Some(existing) = state.servers.get(&(prog, vers)) {
            if existing.strong_count() > 0 {
                drop(state);
                panic!("program {prog} version {vers} is already served on this transport");
            }
        }
        state.servers.insert((prog, vers), server);
    }

    pub(crate) fn unregister_server(&self, prog: u32, vers: u32, server: *const ServerShared) {
        let mut state = self.state();
        if let Some(existing) = state.servers.get(&(prog, vers)) {
            if std::ptr::eq(existing.as_ptr(), server) {
                state.servers.remove(&(prog, vers));
            }
        }
    }

    pub(crate) fn server_for(&self, prog: u32, vers: u32) -> Option<Arc<ServerShared>> {
        let server = self.state().servers.get(&(prog, vers)).cloned();
        server?.upgrade()
    }

    /// Lowest and highest registered version of `prog`.
    pub(crate) fn version_range(&self, prog: u32) -> Option<(u32, u32)> {
        let state = self.state();
        let mut versions = state
            .servers
            .range((prog, 0)..=(prog, u32::MAX))
            .filter(|(_, server)| server.strong_count() > 0)
            .map(|((_, vers), _)| *vers);
        let low = versions.next()?;
        let high = versions.last().unwrap_or(low);
        Some((low, high))
    }

    fn has_servers(&self) -> bool {
        !self.state().servers.is_empty()
    }

    fn has_clients(&self) -> bool {
        !self.state().clients.is_empty()
    }

    fn dispatch(self: &Arc<Self>, packet: Option<Packet>) {
        let Some(packet) = packet else {
            debug!("EOF on {:?}", self.transport);
            self.broadcast_eof(true);
            return;
        };
        let header = if packet.data.len() % 4 == 0 { peek_header(&packet.data) } else { None };
        match header {
            Some((xid, REPLY)) if self.has_clients() => {
                let Some((client, call)) = self.route_xid(xid) else {
                    trace!("no call for reply xid {:#x}, dropped", xid);
                    return;
                };
                client::dispatch_reply(&client, self, call, packet);
            }
            Some((_, CALL)) if self.has_servers() => server::dispatch_call(self, packet),
            _ => self.unexpected(&packet),
        }
    }

    /// A message that fits neither direction, or a call nobody serves.
    pub(crate) fn unexpected(&self, packet: &Packet) {
        if !self.transport.is_connected() {
            warn!("unexpected {} byte message from {:?}, dropped", packet.data.len(), packet.source);
            return;
        }
        warn!("unexpected {} byte message, treating as EOF", packet.data.len());
        if self.transport.is_reliable() {
            // the pump reports the EOF once the failure is noticed
            self.transport.fail();
        } else {
            self.broadcast_eof(false);
        }
    }

    fn broadcast_eof(&self, once: bool) {
        if once && self.eof.swap(true, Ordering::SeqCst) {
            return;
        }
        let (clients, servers) = {
            let state = self.state();
            let clients: SmallVec<[Weak<ClientShared>; 4]> = state.clients.values().cloned().collect();
            let servers: SmallVec<[Weak<ServerShared>; 4]> = state.servers.values().cloned().collect();
            (clients, servers)
        };
        for client in clients.iter().filter_map(Weak::upgrade) {
            client.on_eof();
        }
        for server in servers.iter().filter_map(Weak::upgrade) {
            server.on_eof();
        }
    }

    /// Whether end of file has been delivered to this session.
    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst) || self.transport.at_eof()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let slot = self.transport.session_slot().lock().expect("unable to unlock session slot mutex");
        if slot.strong_count() == 0 {
            trace!("detaching session from {:?}", self.transport);
            self.transport.set_receive_handler(None);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("transport", &self.transport).finish_non_exhaustive()
    }
}
