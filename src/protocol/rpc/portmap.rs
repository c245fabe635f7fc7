//! Port lookups through a remote portmapper (program 100000, version 2).

use std::net::SocketAddr;
use std::time::Duration;

use tracing::debug;

use super::client::{CallOptions, Client, ClientConfig};
use super::program::Program;
use crate::transport::Transport;
use crate::xdr::portmap::{call_args, mapping, PortmapProgram, PROGRAM, VERSION};
use crate::xdr::rpc::clnt_stat;

/// How long a single lookup may take, retransmissions included.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// The portmap procedure table.
pub fn program() -> Program {
    Program::new("portmap", PROGRAM, VERSION)
        .procedure::<()>("PMAPPROC_NULL")
        .procedure::<mapping>("PMAPPROC_SET")
        .procedure::<mapping>("PMAPPROC_UNSET")
        .procedure::<mapping>("PMAPPROC_GETPORT")
        .procedure::<()>("PMAPPROC_DUMP")
        .procedure::<call_args>("PMAPPROC_CALLIT")
}

/// Asks the portmapper behind `client` for the port of (`prog`, `vers`)
/// over protocol `prot` (`IPPROTO_TCP` or `IPPROTO_UDP`).
///
/// A failed call is `RPC_PMAPFAILURE`; a program the portmapper does not
/// know is `RPC_PROGNOTREGISTERED`.
pub async fn get_port(client: &Client, prog: u32, vers: u32, prot: u32) -> Result<u16, clnt_stat> {
    let query = mapping { prog, vers, prot, port: 0 };
    let opts = CallOptions::default().with_timeout(LOOKUP_TIMEOUT);
    let port: u32 = client
        .call_with(PortmapProgram::PMAPPROC_GETPORT as u32, &query, opts)
        .await
        .map_err(|stat| {
            debug!("portmap lookup of {prog}:{vers} failed: {stat}");
            clnt_stat::RPC_PMAPFAILURE
        })?;
    if port == 0 {
        return Err(clnt_stat::RPC_PROGNOTREGISTERED);
    }
    u16::try_from(port).map_err(|_| clnt_stat::RPC_PMAPFAILURE)
}

/// Resolves the address of (`prog`, `vers`) through the portmapper at
/// `pmap`, querying over UDP from an ephemeral socket.
pub async fn lookup(pmap: SocketAddr, prog: u32, vers: u32, prot: u32) -> Result<SocketAddr, clnt_stat> {
    let local: SocketAddr = if pmap.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0_u16; 8], 0).into() };
    let socket = tokio::net::UdpSocket::bind(local).await.map_err(|e| {
        debug!("cannot bind portmap query socket: {e}");
        clnt_stat::RPC_CANTSEND
    })?;
    let xprt = Transport::datagram(socket);
    let client = Client::with_config(&xprt, program(), ClientConfig::default().with_dest(pmap)).map_err(|e| {
        debug!("cannot create portmap client: {e}");
        clnt_stat::RPC_CANTSEND
    })?;
    let port = get_port(&client, prog, vers, prot).await?;
    Ok(SocketAddr::new(pmap.ip(), port))
}
