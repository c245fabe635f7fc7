//! Server side of the call-dispatch engine.
//!
//! A [`Server`] serves one program version on one transport. Each accepted
//! call reaches the application as a [`ServiceCall`] through its
//! [`ServiceHandler`]; the application answers it exactly once with
//! [`ServiceCall::reply`], [`ServiceCall::reject`] or [`ServiceCall::ignore`],
//! from any task and at any later time. Everything the application never
//! sees (wrong RPC version, unknown program or procedure, undecodable
//! arguments, duplicates) is answered here.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use super::program::Program;
use super::replay::{Lookup, ReplayCache, ReplayKey, ReplayPolicy, DEFAULT_REPLAY_CAPACITY};
use super::session::Session;
use crate::transport::{Packet, Transport};
use crate::xdr::rpc::{
    accept_body, auth_stat, auth_unix, call_body, encode_accept_error, encode_reject, encode_reply,
    garbage_args_reply_message, opaque_auth, proc_unavail_reply_message, prog_mismatch_reply_message,
    prog_unavail_reply_message, rejected_reply, rpc_body, rpc_msg, rpc_vers_mismatch, RPC_VERSION,
};
use crate::xdr::{deserialize, to_bytes, Serialize};

type MessageHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// What a server hands to its application.
#[derive(Debug)]
pub enum ServerEvent {
    Call(ServiceCall),
    /// The transport is gone. No calls follow.
    Eof,
}

/// Receives a server's calls.
///
/// `handle` runs on the transport's receive path and should not block; a
/// call can be answered later from anywhere.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, event: ServerEvent);
}

impl ServiceHandler for mpsc::UnboundedSender<ServerEvent> {
    fn handle(&self, event: ServerEvent) {
        if self.send(event).is_err() {
            trace!("service handler channel closed");
        }
    }
}

/// Settings for [`Server::with_config`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Replies a datagram server keeps for duplicate requests.
    pub replay_capacity: usize,
    /// Replay policy; `None` picks one from the transport.
    pub replay: Option<ReplayPolicy>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { replay_capacity: DEFAULT_REPLAY_CAPACITY, replay: None }
    }
}

impl ServerConfig {
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    pub fn with_replay(mut self, policy: ReplayPolicy) -> Self {
        self.replay = Some(policy);
        self
    }
}

struct ServerState {
    replay: Option<ReplayCache>,
    in_flight: usize,
    eof: bool,
    /// Present on delayed-EOF servers; holds the early EOF hook until used.
    delayed_eof: Option<Option<Box<dyn FnOnce() + Send>>>,
}

pub(crate) struct ServerShared {
    program: Arc<Program>,
    binding: Mutex<Arc<Session>>,
    handler: Mutex<Option<Arc<dyn ServiceHandler>>>,
    recv_hook: Mutex<Option<MessageHook>>,
    state: Mutex<ServerState>,
}

/// Serves one program version on one transport.
///
/// Dropping the last `Server` unregisters it once every outstanding
/// [`ServiceCall`] has been answered.
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// A server with the replay behavior its transport calls for: datagram
    /// transports get a replay cache, streams need none.
    pub fn new<H: ServiceHandler + 'static>(xprt: &Arc<Transport>, program: Program, handler: H) -> io::Result<Self> {
        Self::with_config(xprt, program, handler, ServerConfig::default())
    }

    pub fn with_config<H: ServiceHandler + 'static>(
        xprt: &Arc<Transport>,
        program: Program,
        handler: H,
        config: ServerConfig,
    ) -> io::Result<Self> {
        let replay = match config.replay {
            None if xprt.is_reliable() => None,
            None => Some(ReplayPolicy::Unreliable { capacity: config.replay_capacity }),
            Some(ReplayPolicy::Resumable) if !xprt.is_reliable() => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "resumable servers need a reliable transport",
                ));
            }
            Some(policy) => Some(policy),
        };
        Self::build(xprt, program, Arc::new(handler), replay, None)
    }

    /// A server whose replay cache survives reconnection, see
    /// [`Server::resume`].
    pub fn resumable<H: ServiceHandler + 'static>(
        xprt: &Arc<Transport>,
        program: Program,
        handler: H,
    ) -> io::Result<Self> {
        Self::with_config(xprt, program, handler, ServerConfig::default().with_replay(ReplayPolicy::Resumable))
    }

    /// A server that holds back [`ServerEvent::Eof`] until every call in
    /// flight has been answered. `early_eof` runs when the transport fails
    /// while calls are still outstanding; replies to them are dropped.
    pub fn with_delayed_eof<H, F>(xprt: &Arc<Transport>, program: Program, handler: H, early_eof: F) -> io::Result<Self>
    where
        H: ServiceHandler + 'static,
        F: FnOnce() + Send + 'static,
    {
        if !xprt.is_reliable() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "delayed EOF needs a reliable transport",
            ));
        }
        Self::build(xprt, program, Arc::new(handler), None, Some(Some(Box::new(early_eof))))
    }

    fn build(
        xprt: &Arc<Transport>,
        program: Program,
        handler: Arc<dyn ServiceHandler>,
        replay: Option<ReplayPolicy>,
        delayed_eof: Option<Option<Box<dyn FnOnce() + Send>>>,
    ) -> io::Result<Self> {
        let session = Session::lookup(xprt)?;
        let (prog, vers) = (program.number(), program.version());
        let shared = Arc::new(ServerShared {
            program: Arc::new(program),
            binding: Mutex::new(Arc::clone(&session)),
            handler: Mutex::new(Some(handler)),
            recv_hook: Mutex::new(None),
            state: Mutex::new(ServerState {
                replay: replay.map(ReplayCache::new),
                in_flight: 0,
                eof: false,
                delayed_eof,
            }),
        });
        session.register_server(prog, vers, Arc::downgrade(&shared));
        debug!("serving {} program {} version {} on {:?}", shared.program.name(), prog, vers, xprt);
        Ok(Self { shared })
    }

    pub fn program(&self) -> &Program {
        &self.shared.program
    }

    pub fn session(&self) -> Arc<Session> {
        self.shared.session()
    }

    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(self.shared.session().transport())
    }

    /// Calls received and not answered yet.
    pub fn in_flight(&self) -> usize {
        self.shared.state().in_flight
    }

    /// Replies held for duplicate requests, if this server keeps any.
    pub fn cached_replies(&self) -> Option<usize> {
        self.shared.state().replay.as_ref().map(ReplayCache::replied)
    }

    /// Replaces the handler. Without one, calls are refused with
    /// `PROG_UNAVAIL`. A new handler on a server that already saw EOF gets
    /// [`ServerEvent::Eof`] right away.
    pub fn set_handler(&self, handler: Option<Arc<dyn ServiceHandler>>) {
        let installed = handler.is_some();
        *self.shared.handler.lock().expect("unable to unlock handler mutex") = handler;
        if installed {
            let eof = {
                let state = self.shared.state();
                state.eof && (state.delayed_eof.is_none() || state.in_flight == 0)
            };
            if eof {
                self.shared.deliver(ServerEvent::Eof);
            }
        }
    }

    /// Sees the raw message of every call for this program before dispatch.
    pub fn set_recv_hook(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        *self.shared.recv_hook.lock().expect("unable to unlock hook mutex") = Some(Arc::new(hook));
    }

    /// Moves a resumable server to a re-established transport. Cached
    /// replies are kept, but their offsets refer to the old connection and
    /// are reset.
    pub fn resume(&self, xprt: &Arc<Transport>) -> io::Result<()> {
        let resumable = self
            .shared
            .state()
            .replay
            .as_ref()
            .is_some_and(|cache| cache.policy() == ReplayPolicy::Resumable);
        if !resumable {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "server is not resumable"));
        }
        let session = Session::lookup(xprt)?;
        let (prog, vers) = (self.shared.program.number(), self.shared.program.version());
        session.register_server(prog, vers, Arc::downgrade(&self.shared));
        let old = std::mem::replace(&mut *self.shared.binding.lock().expect("unable to unlock binding mutex"), session);
        old.unregister_server(prog, vers, Arc::as_ptr(&self.shared));
        {
            let mut state = self.shared.state();
            state.eof = false;
            if let Some(cache) = state.replay.as_mut() {
                cache.reset_offsets();
            }
        }
        debug!("{} server resumed on {:?}", self.shared.program.name(), xprt);
        drop(old);
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server").field("program", &self.shared.program.name()).finish_non_exhaustive()
    }
}

impl ServerShared {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().expect("unable to unlock server state mutex")
    }

    fn session(&self) -> Arc<Session> {
        Arc::clone(&self.binding.lock().expect("unable to unlock binding mutex"))
    }

    fn handler(&self) -> Option<Arc<dyn ServiceHandler>> {
        self.handler.lock().expect("unable to unlock handler mutex").clone()
    }

    fn has_handler(&self) -> bool {
        self.handler.lock().expect("unable to unlock handler mutex").is_some()
    }

    fn deliver(&self, event: ServerEvent) {
        match self.handler() {
            Some(handler) => handler.handle(event),
            None => trace!("{} server has no handler, event dropped", self.program.name()),
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        session: &Arc<Session>,
        xid: u32,
        call: call_body,
        raw: &[u8],
        mut args: &[u8],
        source: Option<SocketAddr>,
    ) {
        let hook = self.recv_hook.lock().expect("unable to unlock hook mutex").clone();
        if let Some(hook) = hook {
            hook(raw);
        }
        let xprt = session.transport();
        let key = ReplayKey { xid, source, prog: call.prog, vers: call.vers, proc: call.proc };
        self.begin_call(session);

        let Some(procedure) = self.program.get(call.proc) else {
            debug!("{} xid {:#x}: no procedure {}", self.program.name(), xid, call.proc);
            send_message(xprt, &proc_unavail_reply_message(xid), source);
            self.end_call(session);
            return;
        };
        if self.check_replay(&key, xprt) {
            self.end_call(session);
            return;
        }
        let arg = match procedure.decode_args(&mut args) {
            Ok(arg) => arg,
            Err(e) => {
                warn!("{} xid {:#x}: cannot decode arguments: {e}", self.program.label(call.proc), xid);
                send_message(xprt, &garbage_args_reply_message(xid), source);
                if let Some(cache) = self.state().replay.as_mut() {
                    cache.remove(&key);
                }
                self.end_call(session);
                return;
            }
        };
        trace!(
            "{} xid {:#x} from {:?}: {}",
            self.program.label(call.proc),
            xid,
            source,
            procedure.describe(arg.as_ref())
        );
        let call = ServiceCall {
            server: Some(Arc::clone(self)),
            session: Arc::clone(session),
            key,
            call,
            arg: Some(arg),
            received_at: Instant::now(),
        };
        self.deliver(ServerEvent::Call(call));
    }

    fn begin_call(&self, session: &Session) {
        self.state().in_flight += 1;
        session.serving_started();
    }

    fn end_call(&self, session: &Session) {
        session.serving_finished();
        let eof = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.delayed_eof.is_some() && state.eof && state.in_flight == 0
        };
        if eof {
            debug!("last {} call after EOF answered", self.program.name());
            self.deliver(ServerEvent::Eof);
        }
    }

    /// Answers duplicates from the replay cache; true if `key` was one.
    fn check_replay(&self, key: &ReplayKey, xprt: &Transport) -> bool {
        let mut state = self.state();
        let Some(cache) = state.replay.as_mut() else {
            return false;
        };
        match cache.begin(key) {
            Lookup::New => false,
            Lookup::InProgress => {
                debug!("xid {:#x}: duplicate of a call in progress, dropped", key.xid);
                true
            }
            Lookup::Replied(reply) => {
                debug!("xid {:#x}: duplicate request, resending cached reply", key.xid);
                if !xprt.at_eof() {
                    match xprt.send(&[&reply[..]], key.source) {
                        Ok(()) => cache.resent(key, xprt.raw_bytes_sent()),
                        Err(e) => debug!("xid {:#x}: cannot resend reply: {e}", key.xid),
                    }
                }
                true
            }
        }
    }

    /// Finishes a call: sends `reply` if there is one, updates the replay
    /// cache and releases the in-flight slot on `origin`, the session the
    /// call arrived on. Replies go out on the current session, which differs
    /// from `origin` once the server has resumed.
    fn send_reply(&self, origin: &Session, key: &ReplayKey, reply: Option<Vec<u8>>, nocache: bool) {
        let session = self.session();
        let xprt = session.transport();
        {
            let mut state = self.state();
            if state.delayed_eof.is_some() && state.eof {
                if reply.is_some() {
                    warn!("{} xid {:#x}: reply after EOF dropped", self.program.name(), key.xid);
                }
            } else {
                if let Some(msg) = &reply {
                    transmit(xprt, msg, key.source);
                }
                if let Some(cache) = state.replay.as_mut() {
                    match reply {
                        Some(msg) if !nocache => {
                            let known = known_received(xprt, session.max_acked_offset());
                            cache.complete(key, msg.into(), xprt.raw_bytes_sent(), known);
                        }
                        _ => cache.remove(key),
                    }
                }
            }
        }
        self.end_call(origin);
    }

    pub(crate) fn on_eof(&self) {
        let (deliver, early) = {
            let mut state = self.state();
            if state.eof {
                return;
            }
            state.eof = true;
            let in_flight = state.in_flight;
            match state.delayed_eof.as_mut() {
                Some(early) if in_flight > 0 => (false, early.take()),
                _ => (true, None),
            }
        };
        if let Some(early) = early {
            debug!("{} server at EOF with calls in flight", self.program.name());
            early();
        }
        if deliver {
            self.deliver(ServerEvent::Eof);
        }
    }
}

impl Drop for ServerShared {
    fn drop(&mut self) {
        let me = self as *const Self;
        let (prog, vers) = (self.program.number(), self.program.version());
        let session = self.binding.get_mut().unwrap_or_else(PoisonError::into_inner);
        session.unregister_server(prog, vers, me);
    }
}

/// Offset up to which the peer has certainly read our stream: whatever no
/// longer fits in the kernel send buffer, or what its replies acknowledged.
fn known_received(xprt: &Transport, max_acked: u64) -> u64 {
    let sent = xprt.raw_bytes_sent();
    let flushed = match u64::try_from(xprt.send_buffer_size()) {
        Ok(sndbuf) if sndbuf > 0 && sent > sndbuf => sent - sndbuf,
        _ => 0,
    };
    flushed.max(max_acked)
}

fn transmit(xprt: &Transport, msg: &[u8], dest: Option<SocketAddr>) {
    if xprt.at_eof() {
        return;
    }
    if let Err(e) = xprt.send(&[msg], dest) {
        debug!("cannot send reply: {e}");
    }
}

fn send_message(xprt: &Transport, msg: &rpc_msg, dest: Option<SocketAddr>) {
    match to_bytes(msg) {
        Ok(bytes) => transmit(xprt, &bytes, dest),
        Err(e) => error!("cannot encode reply: {e}"),
    }
}

/// Routes an inbound call to the server for its program and version.
pub(crate) fn dispatch_call(session: &Arc<Session>, packet: Packet) {
    let xprt = session.transport();
    let source = if xprt.is_connected() { None } else { packet.source };
    let mut src = packet.data.as_slice();
    let msg = match deserialize::<rpc_msg>(&mut src) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("undecodable call from {:?}: {e}", source);
            session.unexpected(&packet);
            return;
        }
    };
    let rpc_body::CALL(call) = msg.body else {
        session.unexpected(&packet);
        return;
    };
    let xid = msg.xid;
    if call.rpcvers != RPC_VERSION {
        warn!("xid {:#x}: unsupported RPC version {}", xid, call.rpcvers);
        send_message(xprt, &rpc_vers_mismatch(xid), source);
        return;
    }
    match session.server_for(call.prog, call.vers) {
        Some(server) if server.has_handler() => {
            server.dispatch(session, xid, call, &packet.data, src, source);
        }
        Some(_) => {
            debug!("xid {:#x}: program {} has no handler", xid, call.prog);
            send_message(xprt, &prog_unavail_reply_message(xid), source);
        }
        None => {
            let reply = match session.version_range(call.prog) {
                Some((low, high)) => {
                    debug!("xid {:#x}: program {} version {} not in {}..={}", xid, call.prog, call.vers, low, high);
                    prog_mismatch_reply_message(xid, low, high)
                }
                None => {
                    debug!("xid {:#x}: program {} unavailable", xid, call.prog);
                    prog_unavail_reply_message(xid)
                }
            };
            send_message(xprt, &reply, source);
        }
    }
}

/// One call being served.
///
/// Consumed by whichever of [`reply`](Self::reply), [`reject`](Self::reject)
/// or [`ignore`](Self::ignore) answers it, so a call cannot be answered
/// twice. Dropping an unanswered call is an `ignore`, logged as a warning.
pub struct ServiceCall {
    server: Option<Arc<ServerShared>>,
    session: Arc<Session>,
    key: ReplayKey,
    call: call_body,
    arg: Option<Box<dyn Any + Send>>,
    received_at: Instant,
}

impl ServiceCall {
    pub fn xid(&self) -> u32 {
        self.key.xid
    }

    pub fn prog(&self) -> u32 {
        self.call.prog
    }

    pub fn vers(&self) -> u32 {
        self.call.vers
    }

    pub fn proc(&self) -> u32 {
        self.call.proc
    }

    /// Sender address on unconnected datagram transports.
    pub fn source(&self) -> Option<SocketAddr> {
        self.key.source
    }

    pub fn cred(&self) -> &opaque_auth {
        &self.call.cred
    }

    /// The caller's credential, if it is a well-formed `AUTH_UNIX` one.
    pub fn auth_unix(&self) -> Option<auth_unix> {
        self.call.cred.as_unix()
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    /// The decoded argument, if it is a `T`.
    pub fn args<T: 'static>(&self) -> Option<&T> {
        self.arg.as_ref()?.downcast_ref::<T>()
    }

    /// Takes the decoded argument out of the call.
    pub fn take_args<T: 'static>(&mut self) -> Option<T> {
        let arg = self.arg.take()?;
        match arg.downcast::<T>() {
            Ok(arg) => Some(*arg),
            Err(arg) => {
                self.arg = Some(arg);
                None
            }
        }
    }

    /// Sends a successful reply carrying `res`; it is cached for duplicates
    /// where the server keeps a replay cache.
    pub fn reply<T: Serialize + ?Sized>(mut self, res: &T) {
        self.reply_inner(res, false);
    }

    /// Like [`reply`](Self::reply) but never cached, for replies too large
    /// to keep or cheap to recompute.
    pub fn reply_nocache<T: Serialize + ?Sized>(mut self, res: &T) {
        self.reply_inner(res, true);
    }

    /// Denies the call for an authentication reason.
    pub fn reject(mut self, stat: auth_stat) {
        let msg = encode_reject(self.key.xid, rejected_reply::AUTH_ERROR(stat));
        self.finish_with(msg);
    }

    /// Accepts the call but reports an error status such as `SYSTEM_ERR`.
    pub fn reject_accept(mut self, stat: accept_body) {
        let msg = encode_accept_error(self.key.xid, stat);
        self.finish_with(msg);
    }

    /// Drops the call without any reply.
    pub fn ignore(mut self) {
        if let Some(server) = self.server.take() {
            trace!("xid {:#x}: ignored", self.key.xid);
            server.send_reply(&self.session, &self.key, None, true);
        }
    }

    fn reply_inner<T: Serialize + ?Sized>(&mut self, res: &T, nocache: bool) {
        let Some(server) = self.server.take() else {
            return;
        };
        self.arg = None;
        match encode_reply(self.key.xid, res) {
            Ok(msg) => server.send_reply(&self.session, &self.key, Some(msg), nocache),
            Err(e) => {
                error!("{} xid {:#x}: cannot encode reply: {e}", server.program.label(self.key.proc), self.key.xid);
                server.send_reply(&self.session, &self.key, None, true);
            }
        }
    }

    fn finish_with(&mut self, msg: io::Result<Vec<u8>>) {
        let Some(server) = self.server.take() else {
            return;
        };
        self.arg = None;
        match msg {
            Ok(msg) => server.send_reply(&self.session, &self.key, Some(msg), true),
            Err(e) => {
                error!("xid {:#x}: cannot encode error reply: {e}", self.key.xid);
                server.send_reply(&self.session, &self.key, None, true);
            }
        }
    }
}

impl Drop for ServiceCall {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            warn!("{} xid {:#x}: dropped without an answer", server.program.label(self.key.proc), self.key.xid);
            server.send_reply(&self.session, &self.key, None, true);
        }
    }
}

impl fmt::Debug for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCall")
            .field("xid", &format_args!("{:#x}", self.key.xid))
            .field("prog", &self.call.prog)
            .field("vers", &self.call.vers)
            .field("proc", &self.call.proc)
            .field("source", &self.key.source)
            .finish_non_exhaustive()
    }
}
