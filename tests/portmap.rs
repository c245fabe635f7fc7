use std::net::SocketAddr;

mod support;

use tokio::sync::mpsc;

use mamont_arpc::rpc::{portmap, Client, ClientConfig, Server, ServerEvent, ServiceCall};
use mamont_arpc::xdr::portmap::{mapping, PortmapProgram, IPPROTO_TCP, IPPROTO_UDP};
use mamont_arpc::xdr::rpc::{accept_body, clnt_stat};

use support::{init_tracing, udp_transport};

const NFS_PROG: u32 = 100003;
const BROKEN_PROG: u32 = 100099;

fn answer_getport(call: ServiceCall) {
    if call.proc() != PortmapProgram::PMAPPROC_GETPORT as u32 {
        call.reply(&());
        return;
    }
    let query = *call.args::<mapping>().expect("GETPORT takes a mapping");
    match (query.prog, query.vers, query.prot) {
        (NFS_PROG, 3, IPPROTO_TCP) => call.reply(&2049u32),
        (BROKEN_PROG, _, _) => call.reject_accept(accept_body::SYSTEM_ERR),
        (_, _, _) => call.reply(&0u32),
    }
}

/// A portmapper that knows a single TCP registration.
async fn spawn_portmapper() -> (Server, SocketAddr) {
    let (xprt, addr) = udp_transport().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, portmap::program(), tx).expect("cannot create portmapper");
    tokio::spawn(async move {
        while let Some(ServerEvent::Call(call)) = rx.recv().await {
            answer_getport(call);
        }
    });
    (server, addr)
}

#[tokio::test]
async fn lookup_resolves_registered_programs() {
    init_tracing();
    let (_server, pmap) = spawn_portmapper().await;

    let addr = portmap::lookup(pmap, NFS_PROG, 3, IPPROTO_TCP).await.expect("lookup failed");
    assert_eq!(addr, SocketAddr::new(pmap.ip(), 2049));
}

#[tokio::test]
async fn unregistered_program_is_reported() {
    init_tracing();
    let (_server, pmap) = spawn_portmapper().await;

    assert_eq!(portmap::lookup(pmap, NFS_PROG, 3, IPPROTO_UDP).await, Err(clnt_stat::RPC_PROGNOTREGISTERED));
}

#[tokio::test]
async fn failed_query_is_a_portmap_failure() {
    init_tracing();
    let (_server, pmap) = spawn_portmapper().await;
    let (xprt, _) = udp_transport().await;
    let client = Client::with_config(&xprt, portmap::program(), ClientConfig::default().with_dest(pmap))
        .expect("cannot create client");

    assert_eq!(portmap::get_port(&client, BROKEN_PROG, 1, IPPROTO_TCP).await, Err(clnt_stat::RPC_PMAPFAILURE));
    assert_eq!(portmap::get_port(&client, NFS_PROG, 3, IPPROTO_TCP).await, Ok(2049));
}
