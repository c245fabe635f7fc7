//! Client side of the call-dispatch engine.
//!
//! A [`Client`] issues calls for one program over one transport. Every call
//! gets a session-unique XID and a [`CallHandle`] that resolves exactly once:
//! with the decoded result, or with the [`clnt_stat`] that ended it (timeout,
//! EOF, a rejection from the server, ...). How calls are kept alive depends on
//! the transport:
//!
//! - reliable: one send, the call waits until a reply, a timeout or EOF;
//! - datagram: the identical bytes are resent with exponential backoff, see
//!   [`RetryPolicy`];
//! - resumable: calls survive a lost connection and are retransmitted once
//!   the client is [resumed](Client::resume) on a new transport.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::program::Program;
use super::retry::{self, Reconnect, ReconnectPolicy, RetryPolicy};
use super::session::{CallId, ClientId, Session};
use crate::transport::{Packet, Transport};
use crate::xdr::rpc::{
    clnt_stat, decode_reply_header, encode_call, opaque_auth, peek_header, set_xid, MIN_MESSAGE_LEN,
};
use crate::xdr::{deserialize, Deserialize, Serialize};

type Hook = Arc<dyn Fn() + Send + Sync>;
type FailHook = Arc<dyn Fn() -> bool + Send + Sync>;
type MessageHook = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Settings for a new [`Client`].
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Where calls go on an unconnected datagram transport.
    pub dest: Option<SocketAddr>,
    /// Retransmission for datagram transports.
    pub retry: RetryPolicy,
    /// Keep calls across transport failures; reliable transports only.
    pub resumable: bool,
}

impl ClientConfig {
    pub fn with_dest(mut self, dest: SocketAddr) -> Self {
        self.dest = Some(dest);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }
}

/// Per-call overrides.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Credential for this call instead of the client's.
    pub cred: Option<opaque_auth>,
    /// Give up with `RPC_TIMEDOUT` after this long. Nothing is resent
    /// because of it.
    pub timeout: Option<Duration>,
    /// Destination instead of the client's, for unconnected datagram
    /// transports.
    pub dest: Option<SocketAddr>,
}

impl CallOptions {
    pub fn with_cred(mut self, cred: opaque_auth) -> Self {
        self.cred = Some(cred);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dest(mut self, dest: SocketAddr) -> Self {
        self.dest = Some(dest);
        self
    }
}

#[derive(Clone, Debug)]
enum Flavor {
    Reliable,
    Unreliable(RetryPolicy),
    Resumable,
}

/// What to do with the reply of one call.
pub(crate) trait PendingReply: Send {
    /// Parses a reply; anything but `RPC_SUCCESS` is the call's failure.
    fn decode(&mut self, msg: &[u8]) -> clnt_stat;

    fn finish(self: Box<Self>, stat: clnt_stat);
}

struct TypedReply<R> {
    result: Option<R>,
    tx: oneshot::Sender<Result<R, clnt_stat>>,
}

impl<R: Deserialize + Default + Send> PendingReply for TypedReply<R> {
    fn decode(&mut self, msg: &[u8]) -> clnt_stat {
        let mut src = msg;
        let stat = decode_reply_header(&mut src);
        if stat != clnt_stat::RPC_SUCCESS {
            return stat;
        }
        match deserialize::<R>(&mut src) {
            Ok(result) => {
                self.result = Some(result);
                clnt_stat::RPC_SUCCESS
            }
            Err(e) => {
                debug!("cannot decode result: {e}");
                clnt_stat::RPC_CANTDECODERES
            }
        }
    }

    fn finish(self: Box<Self>, stat: clnt_stat) {
        let TypedReply { result, tx } = *self;
        let outcome = match (stat, result) {
            (clnt_stat::RPC_SUCCESS, Some(result)) => Ok(result),
            (clnt_stat::RPC_SUCCESS, None) => Err(clnt_stat::RPC_CANTDECODERES),
            (stat, _) => Err(stat),
        };
        let _ = tx.send(outcome);
    }
}

/// Hands the reply back undecoded, under the caller's own XID.
struct RawReply {
    original_xid: u32,
    reply: Option<Vec<u8>>,
    tx: oneshot::Sender<Result<Vec<u8>, clnt_stat>>,
}

impl PendingReply for RawReply {
    fn decode(&mut self, msg: &[u8]) -> clnt_stat {
        let mut reply = msg.to_vec();
        set_xid(&mut reply, self.original_xid);
        self.reply = Some(reply);
        clnt_stat::RPC_SUCCESS
    }

    fn finish(self: Box<Self>, stat: clnt_stat) {
        let outcome = match (stat, self.reply) {
            (clnt_stat::RPC_SUCCESS, Some(reply)) => Ok(reply),
            (clnt_stat::RPC_SUCCESS, None) => Err(clnt_stat::RPC_CANTRECV),
            (stat, _) => Err(stat),
        };
        let _ = self.tx.send(outcome);
    }
}

/// Forgotten calls on transports that still need a record.
struct Discard;

impl PendingReply for Discard {
    fn decode(&mut self, msg: &[u8]) -> clnt_stat {
        let mut src = msg;
        decode_reply_header(&mut src)
    }

    fn finish(self: Box<Self>, stat: clnt_stat) {
        trace!("forgotten call finished: {stat}");
    }
}

struct CallRecord {
    xid: u32,
    dest: Option<SocketAddr>,
    /// Transport byte offset just past this call's last send.
    offset: u64,
    msg: Arc<[u8]>,
    reply: Option<Box<dyn PendingReply>>,
    deadline: Option<AbortHandle>,
    retransmit: Option<AbortHandle>,
}

impl CallRecord {
    fn complete(mut self, stat: clnt_stat) {
        if let Some(reply) = self.reply.take() {
            reply.finish(stat);
        }
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        for task in [self.deadline.take(), self.retransmit.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct CallTable {
    next: CallId,
    records: BTreeMap<CallId, CallRecord>,
}

#[derive(Default)]
struct Hooks {
    eof: Option<Hook>,
    fail: Option<FailHook>,
    send: Option<MessageHook>,
    recv: Option<MessageHook>,
}

struct Binding {
    session: Arc<Session>,
    id: ClientId,
}

enum Timer {
    Deadline,
    Retransmit,
}

pub(crate) struct ClientShared {
    program: Arc<Program>,
    dest: Option<SocketAddr>,
    flavor: Flavor,
    cred: Mutex<opaque_auth>,
    binding: Mutex<Binding>,
    calls: Mutex<CallTable>,
    hooks: Mutex<Hooks>,
}

/// A client for one program on one transport. Clones share all state.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    pub fn new(xprt: &Arc<Transport>, program: Program) -> io::Result<Self> {
        Self::with_config(xprt, program, ClientConfig::default())
    }

    /// A client whose calls survive transport failures, see [`Client::resume`].
    pub fn resumable(xprt: &Arc<Transport>, program: Program) -> io::Result<Self> {
        Self::with_config(xprt, program, ClientConfig::default().resumable())
    }

    pub fn with_config(xprt: &Arc<Transport>, program: Program, config: ClientConfig) -> io::Result<Self> {
        let flavor = if config.resumable {
            if !xprt.is_reliable() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "resumable clients need a reliable transport",
                ));
            }
            Flavor::Resumable
        } else if xprt.is_reliable() {
            Flavor::Reliable
        } else {
            Flavor::Unreliable(config.retry)
        };
        let session = Session::lookup(xprt)?;
        let shared = Arc::new_cyclic(|weak| {
            let id = session.register_client(weak.clone());
            ClientShared {
                program: Arc::new(program),
                dest: config.dest,
                flavor,
                cred: Mutex::new(opaque_auth::null()),
                binding: Mutex::new(Binding { session, id }),
                calls: Mutex::new(CallTable::default()),
                hooks: Mutex::new(Hooks::default()),
            }
        });
        debug!("{} client on {:?}", shared.program.name(), xprt);
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

    /// Calls issued and not yet completed.
    pub fn outstanding(&self) -> usize {
        self.shared.calls().records.len()
    }

    /// Credential sent with every call that does not override it.
    pub fn set_cred(&self, cred: opaque_auth) {
        *self.shared.cred.lock().expect("unable to unlock credential mutex") = cred;
    }

    /// Issues a call to `proc`.
    ///
    /// Failures that happen before anything is sent (arguments that do not
    /// encode, a transport already at EOF) come back through the handle.
    pub fn call<A, R>(&self, proc: u32, args: &A) -> CallHandle<R>
    where
        A: Serialize + ?Sized,
        R: Deserialize + Default + Send + 'static,
    {
        self.call_with(proc, args, CallOptions::default())
    }

    pub fn timedcall<A, R>(&self, timeout: Duration, proc: u32, args: &A) -> CallHandle<R>
    where
        A: Serialize + ?Sized,
        R: Deserialize + Default + Send + 'static,
    {
        self.call_with(proc, args, CallOptions::default().with_timeout(timeout))
    }

    pub fn call_with<A, R>(&self, proc: u32, args: &A, opts: CallOptions) -> CallHandle<R>
    where
        A: Serialize + ?Sized,
        R: Deserialize + Default + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reply = Box::new(TypedReply { result: None, tx });
        match self.shared.encode(proc, args, &opts) {
            Ok(msg) => {
                let started = self.shared.start(msg, reply, false, &opts);
                self.handle(started, rx)
            }
            Err(stat) => {
                reply.finish(stat);
                CallHandle::detached(rx)
            }
        }
    }

    /// Sends a call that is already encoded. A non-zero XID in the message
    /// is kept unless it is outstanding already.
    pub fn call_marshaled<R>(&self, msg: Vec<u8>, opts: CallOptions) -> CallHandle<R>
    where
        R: Deserialize + Default + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reply = Box::new(TypedReply { result: None, tx });
        if msg.len() < MIN_MESSAGE_LEN {
            reply.finish(clnt_stat::RPC_CANTENCODEARGS);
            return CallHandle::detached(rx);
        }
        let started = self.shared.start(msg, reply, true, &opts);
        self.handle(started, rx)
    }

    /// Forwards somebody else's encoded call under a fresh XID. The reply
    /// comes back verbatim, with the XID of `msg` put back.
    pub fn rawcall(&self, msg: &[u8], opts: CallOptions) -> CallHandle<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let Some((original_xid, _)) = peek_header(msg) else {
            let _ = tx.send(Err(clnt_stat::RPC_CANTENCODEARGS));
            return CallHandle::detached(rx);
        };
        let reply = Box::new(RawReply { original_xid, reply: None, tx });
        let started = self.shared.start(msg.to_vec(), reply, false, &opts);
        self.handle(started, rx)
    }

    /// Calls and waits, polling the transport itself when no receive pump
    /// is running.
    pub async fn scall<A, R>(&self, proc: u32, args: &A, timeout: Option<Duration>) -> Result<R, clnt_stat>
    where
        A: Serialize + ?Sized,
        R: Deserialize + Default + Send + 'static,
    {
        let opts = CallOptions { timeout, ..CallOptions::default() };
        let mut handle = self.call_with(proc, args, opts);
        let xprt = self.transport();
        if xprt.is_pumping() {
            return handle.await;
        }
        loop {
            tokio::select! {
                result = &mut handle => return result,
                polled = xprt.poll() => {
                    if let Err(e) = polled {
                        debug!("scall stopped polling: {e}");
                        return handle.await;
                    }
                }
            }
        }
    }

    /// Sends a call whose reply nobody wants.
    ///
    /// On a reliable transport the call goes out with XID 0 and leaves no
    /// state behind. Elsewhere it is an ordinary call whose completion is
    /// dropped, so datagram retransmission still applies.
    pub fn forget<A: Serialize + ?Sized>(&self, proc: u32, args: &A) -> Result<(), clnt_stat> {
        let opts = CallOptions::default();
        let msg = self.shared.encode(proc, args, &opts)?;
        match self.shared.flavor {
            Flavor::Reliable => {
                let session = self.shared.session();
                self.shared.run_send_hook(&msg);
                session.transport().send(&[&msg], self.shared.dest).map_err(|e| {
                    debug!("forget: {e}");
                    clnt_stat::RPC_CANTSEND
                })
            }
            Flavor::Unreliable(_) | Flavor::Resumable => {
                self.shared.start(msg, Box::new(Discard), false, &opts);
                Ok(())
            }
        }
    }

    /// Runs `hook` after outstanding calls were failed by EOF; at once if
    /// the transport is at EOF already.
    pub fn set_eof_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let hook: Hook = Arc::new(hook);
        self.shared.hooks().eof = Some(Arc::clone(&hook));
        if self.shared.session().at_eof() {
            hook();
        }
    }

    /// Consulted by a resumable client when its transport fails. Returning
    /// true keeps the outstanding calls for [`Client::resume`].
    pub fn set_fail_hook(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        self.shared.hooks().fail = Some(Arc::new(hook));
    }

    /// Sees every call message just before it is sent.
    pub fn set_send_hook(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.hooks().send = Some(Arc::new(hook));
    }

    /// Sees every successful reply matched to one of this client's calls.
    pub fn set_recv_hook(&self, hook: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.hooks().recv = Some(Arc::new(hook));
    }

    /// Moves a resumable client to `xprt` and retransmits every outstanding
    /// call there. XIDs already in use on the new transport are replaced.
    pub fn resume(&self, xprt: &Arc<Transport>) -> io::Result<()> {
        if !matches!(self.shared.flavor, Flavor::Resumable) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "client is not resumable"));
        }
        if !xprt.is_reliable() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resumable clients need a reliable transport",
            ));
        }
        let session = Session::lookup(xprt)?;
        self.shared.rebind(session);
        let resent = self.shared.retransmit_all();
        info!("{} client resumed on {:?}, {} calls retransmitted", self.shared.program.name(), xprt, resent);
        Ok(())
    }

    /// Establishes a new transport through `connector` and resumes on it,
    /// backing off between attempts.
    pub async fn reconnect(&self, connector: &dyn Reconnect, policy: &ReconnectPolicy) -> io::Result<()> {
        if !matches!(self.shared.flavor, Flavor::Resumable) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "client is not resumable"));
        }
        let mut delay = policy.initial_delay;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match connector.connect().await {
                Ok(xprt) => match self.resume(&xprt) {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("cannot resume on new transport: {e}"),
                },
                Err(e) => warn!("reconnect attempt {attempts} failed: {e}"),
            }
            if policy.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("giving up after {attempts} reconnect attempts"),
                ));
            }
            tokio::time::sleep(delay).await;
            delay = policy.next_delay(delay);
        }
    }

    fn handle<R>(&self, started: Option<(CallId, u32)>, rx: oneshot::Receiver<Result<R, clnt_stat>>) -> CallHandle<R> {
        match started {
            Some((call, xid)) => CallHandle { rx, call: Some((Arc::clone(&self.shared), call)), xid },
            None => CallHandle::detached(rx),
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("program", &self.shared.program.name())
            .field("flavor", &self.shared.flavor)
            .finish_non_exhaustive()
    }
}

impl ClientShared {
    fn calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().expect("unable to unlock call table mutex")
    }

    fn hooks(&self) -> MutexGuard<'_, Hooks> {
        self.hooks.lock().expect("unable to unlock hooks mutex")
    }

    fn binding(&self) -> (Arc<Session>, ClientId) {
        let binding = self.binding.lock().expect("unable to unlock binding mutex");
        (Arc::clone(&binding.session), binding.id)
    }

    fn session(&self) -> Arc<Session> {
        self.binding().0
    }

    fn run_send_hook(&self, msg: &[u8]) {
        let hook = self.hooks().send.clone();
        if let Some(hook) = hook {
            hook(msg);
        }
    }

    fn encode<A: Serialize + ?Sized>(&self, proc: u32, args: &A, opts: &CallOptions) -> Result<Vec<u8>, clnt_stat> {
        if self.program.get(proc).is_none() {
            warn!("{} has no procedure {}", self.program.name(), proc);
            return Err(clnt_stat::RPC_PROCUNAVAIL);
        }
        let cred = match &opts.cred {
            Some(cred) => cred.clone(),
            None => self.cred.lock().expect("unable to unlock credential mutex").clone(),
        };
        encode_call(0, self.program.number(), self.program.version(), proc, &cred, args).map_err(|e| {
            warn!("{}: cannot encode arguments: {e}", self.program.label(proc));
            clnt_stat::RPC_CANTENCODEARGS
        })
    }

    /// Records a call and sends it. `None` means the call already finished.
    fn start(
        self: &Arc<Self>,
        mut msg: Vec<u8>,
        reply: Box<dyn PendingReply>,
        keep_xid: bool,
        opts: &CallOptions,
    ) -> Option<(CallId, u32)> {
        let (session, id) = self.binding();
        let call = {
            let mut calls = self.calls();
            calls.next += 1;
            calls.next
        };
        let embedded = if keep_xid { peek_header(&msg).map_or(0, |(xid, _)| xid) } else { 0 };
        let xid = if embedded != 0 && session.claim_xid(embedded, id, call) {
            embedded
        } else {
            if embedded != 0 {
                debug!("xid {:#x} is outstanding already, allocating another", embedded);
            }
            session.alloc_xid(id, call)
        };
        set_xid(&mut msg, xid);
        let msg: Arc<[u8]> = msg.into();
        let dest = opts.dest.or(self.dest);
        self.calls().records.insert(
            call,
            CallRecord {
                xid,
                dest,
                offset: 0,
                msg: Arc::clone(&msg),
                reply: Some(reply),
                deadline: None,
                retransmit: None,
            },
        );
        trace!("{} xid {:#x}: call issued", self.program.name(), xid);

        if session.transport().at_eof() {
            if matches!(self.flavor, Flavor::Resumable) {
                self.fail();
                return Some((call, xid));
            }
            self.finish(call, clnt_stat::RPC_CANTSEND);
            return None;
        }
        if let Err(e) = self.transmit(&session, call, &msg, dest) {
            if !matches!(self.flavor, Flavor::Resumable) {
                debug!("xid {:#x}: send failed: {e}", xid);
                self.finish(call, clnt_stat::RPC_CANTSEND);
                return None;
            }
        }

        if let Flavor::Unreliable(policy) = &self.flavor {
            let task = tokio::spawn(retry::retransmit(Arc::downgrade(self), call, policy.clone()));
            self.arm(call, Timer::Retransmit, task.abort_handle());
        }
        if let Some(timeout) = opts.timeout {
            let client = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(client) = client.upgrade() {
                    debug!("call {} timed out after {:?}", call, timeout);
                    client.finish(call, clnt_stat::RPC_TIMEDOUT);
                }
            });
            self.arm(call, Timer::Deadline, task.abort_handle());
        }
        Some((call, xid))
    }

    fn arm(&self, call: CallId, timer: Timer, task: AbortHandle) {
        let mut calls = self.calls();
        match calls.records.get_mut(&call) {
            Some(record) => match timer {
                Timer::Deadline => record.deadline = Some(task),
                Timer::Retransmit => record.retransmit = Some(task),
            },
            // finished before the timer was stored
            None => task.abort(),
        }
    }

    fn transmit(&self, session: &Session, call: CallId, msg: &[u8], dest: Option<SocketAddr>) -> io::Result<()> {
        self.run_send_hook(msg);
        let xprt = session.transport();
        xprt.send(&[msg], dest)?;
        let offset = xprt.raw_bytes_sent();
        if let Some(record) = self.calls().records.get_mut(&call) {
            record.offset = offset;
        }
        Ok(())
    }

    /// Sends a call's bytes again; false once the call is gone. A call whose
    /// transport is at EOF is finished with `RPC_CANTRECV` here.
    pub(crate) fn resend(&self, call: CallId) -> bool {
        let (msg, dest) = {
            let calls = self.calls();
            let Some(record) = calls.records.get(&call) else {
                return false;
            };
            (Arc::clone(&record.msg), record.dest)
        };
        let session = self.session();
        if session.transport().at_eof() {
            debug!("call {} not resent, transport is at EOF", call);
            self.finish(call, clnt_stat::RPC_CANTRECV);
            return false;
        }
        if let Err(e) = self.transmit(&session, call, &msg, dest) {
            debug!("retransmission of call {} failed: {e}", call);
        }
        true
    }

    fn take(&self, call: CallId) -> Option<CallRecord> {
        let record = self.calls().records.remove(&call)?;
        let (session, id) = self.binding();
        session.release_xid(record.xid, id, call);
        Some(record)
    }

    /// Completes a call once; later attempts find nothing to do.
    pub(crate) fn finish(&self, call: CallId, stat: clnt_stat) {
        if let Some(record) = self.take(call) {
            trace!("{} xid {:#x}: finished: {}", self.program.name(), record.xid, stat);
            record.complete(stat);
        }
    }

    fn handle_reply(&self, session: &Session, call: CallId, packet: Packet) {
        let (stat, offset) = {
            let mut calls = self.calls();
            let Some(record) = calls.records.get_mut(&call) else {
                return;
            };
            if !session.transport().is_connected() && record.dest != packet.source {
                debug!(
                    "xid {:#x}: reply from {:?} but call went to {:?}, dropped",
                    record.xid, packet.source, record.dest
                );
                return;
            }
            let Some(reply) = record.reply.as_mut() else {
                return;
            };
            (reply.decode(&packet.data), record.offset)
        };
        if stat == clnt_stat::RPC_SUCCESS {
            let hook = self.hooks().recv.clone();
            if let Some(hook) = hook {
                hook(&packet.data);
            }
            session.note_acked(offset);
        } else if matches!(self.flavor, Flavor::Resumable) {
            debug!("call {} failed on a resumable client: {}", call, stat);
            self.fail();
            return;
        }
        self.finish(call, stat);
    }

    /// Fails every outstanding call with `RPC_CANTRECV`, unless a resumable
    /// client's fail hook chooses to wait for a new transport.
    fn fail(&self) {
        if matches!(self.flavor, Flavor::Resumable) {
            let hook = self.hooks().fail.clone();
            if hook.is_some_and(|hook| hook()) {
                debug!("{} client waiting to be resumed", self.program.name());
                return;
            }
        }
        let records = std::mem::take(&mut self.calls().records);
        let (session, id) = self.binding();
        for (call, record) in &records {
            session.release_xid(record.xid, id, *call);
        }
        if !records.is_empty() {
            debug!("failing {} outstanding {} calls", records.len(), self.program.name());
        }
        for (_, record) in records {
            record.complete(clnt_stat::RPC_CANTRECV);
        }
        let hook = self.hooks().eof.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub(crate) fn on_eof(&self) {
        self.fail();
    }

    fn rebind(self: &Arc<Self>, session: Arc<Session>) {
        let id = session.register_client(Arc::downgrade(self));
        let old = {
            let mut binding = self.binding.lock().expect("unable to unlock binding mutex");
            std::mem::replace(&mut *binding, Binding { session: Arc::clone(&session), id })
        };
        old.session.unregister_client(old.id);
        let mut calls = self.calls();
        for (call, record) in calls.records.iter_mut() {
            if !session.claim_xid(record.xid, id, *call) {
                let xid = session.alloc_xid(id, *call);
                debug!("xid {:#x} is taken on the new transport, using {:#x}", record.xid, xid);
                let mut msg = record.msg.to_vec();
                set_xid(&mut msg, xid);
                record.msg = msg.into();
                record.xid = xid;
            }
            record.offset = 0;
        }
        drop(calls);
        drop(old);
    }

    fn retransmit_all(&self) -> usize {
        let session = self.session();
        let pending: Vec<(CallId, Arc<[u8]>, Option<SocketAddr>)> = self
            .calls()
            .records
            .iter()
            .map(|(call, record)| (*call, Arc::clone(&record.msg), record.dest))
            .collect();
        let mut resent = 0;
        for (call, msg, dest) in pending {
            if let Err(e) = self.transmit(&session, call, &msg, dest) {
                warn!("retransmission after resume failed: {e}");
                break;
            }
            resent += 1;
        }
        resent
    }
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        let binding = self.binding.get_mut().unwrap_or_else(PoisonError::into_inner);
        binding.session.unregister_client(binding.id);
    }
}

pub(crate) fn dispatch_reply(client: &Arc<ClientShared>, session: &Session, call: CallId, packet: Packet) {
    client.handle_reply(session, call, packet);
}

/// The pending result of one call.
///
/// Resolves exactly once. Dropping the handle leaves the call running with
/// its result discarded; [`CallHandle::cancel`] withdraws it instead.
#[must_use = "a call's outcome is only observable through its handle"]
pub struct CallHandle<R> {
    rx: oneshot::Receiver<Result<R, clnt_stat>>,
    call: Option<(Arc<ClientShared>, CallId)>,
    xid: u32,
}

impl<R> CallHandle<R> {
    fn detached(rx: oneshot::Receiver<Result<R, clnt_stat>>) -> Self {
        Self { rx, call: None, xid: 0 }
    }

    /// The XID the call went out with; 0 if it failed before being sent.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Withdraws the call without completing it. A reply arriving later is
    /// dropped.
    pub fn cancel(self) {
        if let Some((client, call)) = &self.call {
            if let Some(record) = client.take(*call) {
                trace!("xid {:#x}: cancelled", record.xid);
            }
        }
    }
}

impl<R> Future for CallHandle<R> {
    type Output = Result<R, clnt_stat>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|outcome| outcome.unwrap_or(Err(clnt_stat::RPC_CANTRECV)))
    }
}

impl<R> fmt::Debug for CallHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle").field("xid", &format_args!("{:#x}", self.xid)).finish()
    }
}
