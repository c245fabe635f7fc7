//! This module provides data structures for the Remote Procedure Call (RPC) protocol
//! as defined in RFC 5531 (previously RFC 1057), together with the envelope codec
//! used by both the client and the server engines.
//!
//! A call envelope is six words (xid, direction, rpcvers, prog, vers, proc)
//! followed by a credential and a verifier; the procedure arguments follow.
//! A reply envelope carries either an accepted status (with the result for
//! `SUCCESS`) or a denial.

// Keep RFC naming conventions
#![allow(non_camel_case_types)]

use std::fmt;
use std::io::{Read, Write};

use num_derive::{FromPrimitive, ToPrimitive};
use tracing::trace;

use super::*;

/// The only RPC protocol version spoken here.
pub const RPC_VERSION: u32 = 2;
/// `msg_type` discriminant of a call.
pub const CALL: u32 = 0;
/// `msg_type` discriminant of a reply.
pub const REPLY: u32 = 1;
/// Upper bound on the body of an `opaque_auth`.
pub const MAX_AUTH_BYTES: usize = 400;
/// Smallest well-formed message: the xid and the direction word.
pub const MIN_MESSAGE_LEN: usize = 8;

/// Authentication status codes indicating why authentication failed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum auth_stat {
    /// Success
    AUTH_OK = 0,
    /// Invalid credentials provided by client (checksum/signature verification failed)
    #[default]
    AUTH_BADCRED = 1,
    /// Credentials rejected - client needs to establish a new session
    AUTH_REJECTEDCRED = 2,
    /// Invalid verifier provided by client (checksum/signature verification failed)
    AUTH_BADVERF = 3,
    /// Verifier rejected due to expiration or replay attempt
    AUTH_REJECTEDVERF = 4,
    /// Authentication mechanism too weak for requested operation
    AUTH_TOOWEAK = 5,
    /// Bogus response verifier
    AUTH_INVALIDRESP = 6,
    /// Reason unknown
    AUTH_FAILED = 7,
}
impl SerializeEnum for auth_stat {}
impl DeserializeEnum for auth_stat {}

/// Authentication flavor (mechanism) identifiers for RPC
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum auth_flavor {
    /// No authentication
    #[default]
    AUTH_NULL = 0,
    /// UNIX-style authentication (uid/gid)
    AUTH_UNIX = 1,
    /// Short-form authentication
    AUTH_SHORT = 2,
    /// DES authentication
    AUTH_DES = 3,
}
impl SerializeEnum for auth_flavor {}
impl DeserializeEnum for auth_flavor {}

/// UNIX-style credentials used for authentication
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct auth_unix {
    /// Arbitrary id generated by the caller
    pub stamp: u32,
    /// The name of the client machine
    pub machinename: Opaque<255>,
    /// The effective user ID of the caller
    pub uid: u32,
    /// The effective group ID of the caller
    pub gid: u32,
    /// A list of additional group IDs for the caller
    pub gids: BoundedVec<u32, 16>,
}
DeserializeStruct!(auth_unix, stamp, machinename, uid, gid, gids);
SerializeStruct!(auth_unix, stamp, machinename, uid, gid, gids);

/// Authentication data as carried in every call (credential and verifier)
/// and every accepted reply (verifier).
///
/// The body is interpreted according to the flavor and never exceeds
/// [`MAX_AUTH_BYTES`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct opaque_auth {
    /// The authentication mechanism being used
    pub flavor: auth_flavor,
    /// The opaque authentication data associated with that mechanism
    pub body: Opaque<MAX_AUTH_BYTES>,
}
DeserializeStruct!(opaque_auth, flavor, body);
SerializeStruct!(opaque_auth, flavor, body);

impl opaque_auth {
    /// The `AUTH_NULL` credential, also the verifier of this profile.
    pub fn null() -> Self {
        Self::default()
    }

    /// Wraps UNIX-style credentials.
    pub fn unix(cred: &auth_unix) -> std::io::Result<Self> {
        let body = to_bytes(cred)?;
        if body.len() > MAX_AUTH_BYTES {
            return Err(utils::invalid_data("auth_unix credential too large"));
        }
        Ok(Self { flavor: auth_flavor::AUTH_UNIX, body: Opaque(body) })
    }

    /// Decodes the body as UNIX-style credentials, if that is its flavor.
    pub fn as_unix(&self) -> Option<auth_unix> {
        if self.flavor != auth_flavor::AUTH_UNIX {
            return None;
        }
        deserialize(&mut self.body.0.as_slice()).ok()
    }
}

/// RPC message structure as defined in RFC 5531 (previously RFC 1057).
///
/// The xid is not a sequence number: clients match replies with it and
/// servers use it, together with the caller's address, to spot retransmissions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct rpc_msg {
    /// Transaction identifier used to match calls and replies
    pub xid: u32,
    /// The body of the RPC message (call or reply)
    pub body: rpc_body,
}
DeserializeStruct!(rpc_msg, xid, body);
SerializeStruct!(rpc_msg, xid, body);

/// The body of an RPC message, which can be either a call or a reply
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum rpc_body {
    /// A call to a remote procedure
    CALL(call_body),
    /// A reply from a remote procedure
    REPLY(reply_body),
}

impl Default for rpc_body {
    fn default() -> rpc_body {
        rpc_body::CALL(call_body::default())
    }
}

impl Serialize for rpc_body {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            rpc_body::CALL(v) => {
                CALL.serialize(dest)?;
                v.serialize(dest)
            }
            rpc_body::REPLY(v) => {
                REPLY.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl Deserialize for rpc_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            CALL => *self = rpc_body::CALL(deserialize(src)?),
            REPLY => *self = rpc_body::REPLY(deserialize(src)?),
            msg_type => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid message type in rpc_body: {msg_type}"),
                ))
            }
        }

        Ok(())
    }
}

/// The body of an RPC call, containing all information needed for a remote procedure call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct call_body {
    /// RPC version, must be 2
    pub rpcvers: u32,
    /// The program to call
    pub prog: u32,
    /// The version of the program
    pub vers: u32,
    /// The procedure within the program to call
    pub proc: u32,
    /// Authentication credentials for the caller
    pub cred: opaque_auth,
    /// Authentication verifier for the caller
    pub verf: opaque_auth,
    /* procedure specific parameters start here */
}
DeserializeStruct!(call_body, rpcvers, prog, vers, proc, cred, verf);
SerializeStruct!(call_body, rpcvers, prog, vers, proc, cred, verf);

/// The body of an RPC reply, indicating whether the call was accepted or denied
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum reply_body {
    /// The call was accepted
    MSG_ACCEPTED(accepted_reply),
    /// The call was denied
    MSG_DENIED(rejected_reply),
}

impl Default for reply_body {
    fn default() -> reply_body {
        reply_body::MSG_ACCEPTED(accepted_reply::default())
    }
}

impl Serialize for reply_body {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            reply_body::MSG_ACCEPTED(v) => {
                0_u32.serialize(dest)?;
                v.serialize(dest)
            }
            reply_body::MSG_DENIED(v) => {
                1_u32.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl Deserialize for reply_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            0 => *self = reply_body::MSG_ACCEPTED(deserialize(src)?),
            1 => *self = reply_body::MSG_DENIED(deserialize(src)?),
            reply_status => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid reply status in reply_body: {reply_status}"),
                ))
            }
        }

        Ok(())
    }
}

/// Lowest and highest supported version
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct mismatch_info {
    pub low: u32,
    pub high: u32,
}
DeserializeStruct!(mismatch_info, low, high);
SerializeStruct!(mismatch_info, low, high);

/// Reply to an RPC call that was accepted by the server.
///
/// Acceptance only means the envelope and credentials were fine; the
/// `reply_data` arm says whether the procedure actually ran.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct accepted_reply {
    /// Authentication verifier from server
    pub verf: opaque_auth,
    /// Reply data union discriminated by accept_stat
    pub reply_data: accept_body,
}
DeserializeStruct!(accepted_reply, verf, reply_data);
SerializeStruct!(accepted_reply, verf, reply_data);

/// Response data for an accepted RPC call, discriminated by accept_stat.
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum accept_body {
    /// Call completed successfully, the result follows
    #[default]
    SUCCESS,
    /// Program is not available on this server
    PROG_UNAVAIL,
    /// Program version mismatch, includes supported version range
    PROG_MISMATCH(mismatch_info),
    /// Requested procedure is not available
    PROC_UNAVAIL,
    /// Server could not decode the call arguments
    GARBAGE_ARGS,
    /// Memory allocation failure or similar on the server
    SYSTEM_ERR,
}

impl Serialize for accept_body {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            accept_body::SUCCESS => 0_u32.serialize(dest),
            accept_body::PROG_UNAVAIL => 1_u32.serialize(dest),
            accept_body::PROG_MISMATCH(v) => {
                2_u32.serialize(dest)?;
                v.serialize(dest)
            }
            accept_body::PROC_UNAVAIL => 3_u32.serialize(dest),
            accept_body::GARBAGE_ARGS => 4_u32.serialize(dest),
            accept_body::SYSTEM_ERR => 5_u32.serialize(dest),
        }
    }
}
impl Deserialize for accept_body {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            0 => *self = accept_body::SUCCESS,
            1 => *self = accept_body::PROG_UNAVAIL,
            2 => *self = accept_body::PROG_MISMATCH(deserialize(src)?),
            3 => *self = accept_body::PROC_UNAVAIL,
            4 => *self = accept_body::GARBAGE_ARGS,
            5 => *self = accept_body::SYSTEM_ERR,
            accept_stat => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid accept stat in accept_body: {accept_stat}"),
                ));
            }
        }

        Ok(())
    }
}

/// Reply sent when an RPC call is rejected by the server, either because
/// the RPC protocol version is unsupported or because authentication failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum rejected_reply {
    /// RPC version mismatch - includes supported version range
    RPC_MISMATCH(mismatch_info),
    /// Authentication failed - includes specific error code
    AUTH_ERROR(auth_stat),
}

impl Default for rejected_reply {
    fn default() -> rejected_reply {
        rejected_reply::AUTH_ERROR(auth_stat::default())
    }
}

impl Serialize for rejected_reply {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        match self {
            rejected_reply::RPC_MISMATCH(v) => {
                0_u32.serialize(dest)?;
                v.serialize(dest)
            }
            rejected_reply::AUTH_ERROR(v) => {
                1_u32.serialize(dest)?;
                v.serialize(dest)
            }
        }
    }
}
impl Deserialize for rejected_reply {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match deserialize::<u32>(src)? {
            0 => *self = rejected_reply::RPC_MISMATCH(deserialize(src)?),
            1 => *self = rejected_reply::AUTH_ERROR(deserialize(src)?),
            stat => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid reject stat in rejected_reply: {stat}"),
                ))
            }
        }

        Ok(())
    }
}

/// Client-side outcome of a call, numbered as in the classic `clnt_stat`.
///
/// Every issued call completes with exactly one of these. `RPC_SUCCESS` is
/// never handed out as an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
pub enum clnt_stat {
    RPC_SUCCESS = 0,
    RPC_CANTENCODEARGS = 1,
    RPC_CANTDECODERES = 2,
    RPC_CANTSEND = 3,
    RPC_CANTRECV = 4,
    RPC_TIMEDOUT = 5,
    RPC_VERSMISMATCH = 6,
    RPC_AUTHERROR = 7,
    RPC_PROGUNAVAIL = 8,
    RPC_PROGVERSMISMATCH = 9,
    RPC_PROCUNAVAIL = 10,
    RPC_CANTDECODEARGS = 11,
    RPC_SYSTEMERROR = 12,
    RPC_UNKNOWNHOST = 13,
    RPC_PMAPFAILURE = 14,
    RPC_PROGNOTREGISTERED = 15,
    RPC_FAILED = 16,
    RPC_UNKNOWNPROTO = 17,
}

impl fmt::Display for clnt_stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            clnt_stat::RPC_SUCCESS => "RPC: Success",
            clnt_stat::RPC_CANTENCODEARGS => "RPC: Can't encode arguments",
            clnt_stat::RPC_CANTDECODERES => "RPC: Can't decode result",
            clnt_stat::RPC_CANTSEND => "RPC: Unable to send",
            clnt_stat::RPC_CANTRECV => "RPC: Unable to receive",
            clnt_stat::RPC_TIMEDOUT => "RPC: Timed out",
            clnt_stat::RPC_VERSMISMATCH => "RPC: Incompatible versions of RPC",
            clnt_stat::RPC_AUTHERROR => "RPC: Authentication error",
            clnt_stat::RPC_PROGUNAVAIL => "RPC: Program unavailable",
            clnt_stat::RPC_PROGVERSMISMATCH => "RPC: Program/version mismatch",
            clnt_stat::RPC_PROCUNAVAIL => "RPC: Procedure unavailable",
            clnt_stat::RPC_CANTDECODEARGS => "RPC: Server can't decode arguments",
            clnt_stat::RPC_SYSTEMERROR => "RPC: Remote system error",
            clnt_stat::RPC_UNKNOWNHOST => "RPC: Unknown host",
            clnt_stat::RPC_PMAPFAILURE => "RPC: Port mapper failure",
            clnt_stat::RPC_PROGNOTREGISTERED => "RPC: Program not registered",
            clnt_stat::RPC_FAILED => "RPC: Failed (unspecified error)",
            clnt_stat::RPC_UNKNOWNPROTO => "RPC: Unknown protocol",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for clnt_stat {}

impl From<&reply_body> for clnt_stat {
    fn from(body: &reply_body) -> Self {
        match body {
            reply_body::MSG_ACCEPTED(accepted) => match accepted.reply_data {
                accept_body::SUCCESS => clnt_stat::RPC_SUCCESS,
                accept_body::PROG_UNAVAIL => clnt_stat::RPC_PROGUNAVAIL,
                accept_body::PROG_MISMATCH(_) => clnt_stat::RPC_PROGVERSMISMATCH,
                accept_body::PROC_UNAVAIL => clnt_stat::RPC_PROCUNAVAIL,
                accept_body::GARBAGE_ARGS => clnt_stat::RPC_CANTDECODEARGS,
                accept_body::SYSTEM_ERR => clnt_stat::RPC_SYSTEMERROR,
            },
            reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(_)) => clnt_stat::RPC_VERSMISMATCH,
            reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(_)) => clnt_stat::RPC_AUTHERROR,
        }
    }
}

/// Builds a complete call message.
///
/// The verifier is always `AUTH_NULL`. The message is encoded into a fresh
/// buffer, so a failing argument encoder leaves nothing behind.
pub fn encode_call<A: Serialize + ?Sized>(
    xid: u32,
    prog: u32,
    vers: u32,
    proc: u32,
    cred: &opaque_auth,
    args: &A,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    xid.serialize(&mut buf)?;
    CALL.serialize(&mut buf)?;
    RPC_VERSION.serialize(&mut buf)?;
    prog.serialize(&mut buf)?;
    vers.serialize(&mut buf)?;
    proc.serialize(&mut buf)?;
    cred.serialize(&mut buf)?;
    opaque_auth::null().serialize(&mut buf)?;
    args.serialize(&mut buf)?;
    Ok(buf)
}

/// Parses a reply envelope, leaving `src` at the start of the result.
///
/// Anything other than an accepted `SUCCESS` is reported without touching
/// the result bytes. Reply verifiers are not checked in this profile.
pub fn decode_reply_header(src: &mut &[u8]) -> clnt_stat {
    let msg = match deserialize::<rpc_msg>(src) {
        Ok(msg) => msg,
        Err(e) => {
            trace!("undecodable reply envelope: {e}");
            return clnt_stat::RPC_CANTDECODERES;
        }
    };
    match msg.body {
        rpc_body::REPLY(body) => {
            if let reply_body::MSG_ACCEPTED(accepted) = &body {
                if accepted.verf.flavor != auth_flavor::AUTH_NULL {
                    trace!("xid {:#x}: ignoring {:?} reply verifier", msg.xid, accepted.verf.flavor);
                }
            }
            clnt_stat::from(&body)
        }
        rpc_body::CALL(_) => clnt_stat::RPC_CANTDECODERES,
    }
}

/// Parses a whole reply, decoding the result only on success.
pub fn decode_reply<R: Deserialize + Default>(msg: &[u8]) -> Result<R, clnt_stat> {
    let mut src = msg;
    match decode_reply_header(&mut src) {
        clnt_stat::RPC_SUCCESS => {
            deserialize::<R>(&mut src).map_err(|_| clnt_stat::RPC_CANTDECODERES)
        }
        stat => Err(stat),
    }
}

/// Builds a successful reply carrying `res`.
pub fn encode_reply<T: Serialize + ?Sized>(xid: u32, res: &T) -> std::io::Result<Vec<u8>> {
    let mut buf = to_bytes(&make_success_reply(xid))?;
    res.serialize(&mut buf)?;
    Ok(buf)
}

/// Builds a denial (`MSG_DENIED`) reply.
pub fn encode_reject(xid: u32, reason: rejected_reply) -> std::io::Result<Vec<u8>> {
    to_bytes(&rpc_msg { xid, body: rpc_body::REPLY(reply_body::MSG_DENIED(reason)) })
}

/// Builds an accepted reply with an error status and no payload.
pub fn encode_accept_error(xid: u32, stat: accept_body) -> std::io::Result<Vec<u8>> {
    to_bytes(&accepted_reply_message(xid, stat))
}

fn accepted_reply_message(xid: u32, reply_data: accept_body) -> rpc_msg {
    let reply =
        reply_body::MSG_ACCEPTED(accepted_reply { verf: opaque_auth::null(), reply_data });
    rpc_msg { xid, body: rpc_body::REPLY(reply) }
}

/// Creates a reply message indicating that the requested procedure is not available
pub fn proc_unavail_reply_message(xid: u32) -> rpc_msg {
    accepted_reply_message(xid, accept_body::PROC_UNAVAIL)
}

/// Creates a reply message indicating that the requested program is not available
pub fn prog_unavail_reply_message(xid: u32) -> rpc_msg {
    accepted_reply_message(xid, accept_body::PROG_UNAVAIL)
}

/// Creates a reply message indicating a program version mismatch
pub fn prog_mismatch_reply_message(xid: u32, low: u32, high: u32) -> rpc_msg {
    accepted_reply_message(xid, accept_body::PROG_MISMATCH(mismatch_info { low, high }))
}

/// Creates a reply message indicating that the arguments could not be decoded
pub fn garbage_args_reply_message(xid: u32) -> rpc_msg {
    accepted_reply_message(xid, accept_body::GARBAGE_ARGS)
}

/// Creates a reply message indicating an RPC version mismatch
pub fn rpc_vers_mismatch(xid: u32) -> rpc_msg {
    let info = mismatch_info { low: RPC_VERSION, high: RPC_VERSION };
    let reply = reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(info));
    rpc_msg { xid, body: rpc_body::REPLY(reply) }
}

/// Creates a successful reply message; the result is appended by the caller
pub fn make_success_reply(xid: u32) -> rpc_msg {
    accepted_reply_message(xid, accept_body::SUCCESS)
}

/// Reads the xid and direction words of a raw message without decoding the rest.
pub fn peek_header(msg: &[u8]) -> Option<(u32, u32)> {
    if msg.len() < MIN_MESSAGE_LEN {
        return None;
    }
    let xid = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
    let direction = u32::from_be_bytes([msg[4], msg[5], msg[6], msg[7]]);
    Some((xid, direction))
}

/// Overwrites the xid of an encoded message in place.
pub fn set_xid(msg: &mut [u8], xid: u32) {
    if msg.len() >= 4 {
        msg[..4].copy_from_slice(&xid.to_be_bytes());
    }
}
