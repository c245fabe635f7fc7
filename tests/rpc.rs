use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod support;

use mamont_arpc::rpc::{Client, Server};
use mamont_arpc::tcp::{connect_tcp, connect_udp, ConnectionHandler, RpcTcp, RpcTcpListener};
use mamont_arpc::transport::Transport;

use support::{echo_program, init_tracing, spawn_echo_server, udp_transport, within, ECHO_U32};

#[tokio::test]
async fn tcp_listener_serves_each_connection() {
    init_tracing();
    let listener = RpcTcpListener::bind("127.0.0.1:0").await.expect("cannot bind");
    let port = listener.get_listen_port().expect("no port");
    assert_ne!(port, 0);
    assert!(listener.get_listen_ip().expect("no ip").is_loopback());

    let servers: Arc<Mutex<Vec<Server>>> = Arc::default();
    let kept = Arc::clone(&servers);
    let on_connection: ConnectionHandler = Arc::new(move |xprt: Arc<Transport>, _peer: SocketAddr| -> anyhow::Result<()> {
        kept.lock().expect("unable to unlock servers mutex").push(spawn_echo_server(&xprt));
        Ok(())
    });
    tokio::spawn(async move { listener.handle_forever(on_connection).await });

    for n in 0..3u32 {
        let xprt = connect_tcp(("127.0.0.1", port)).await.expect("cannot connect");
        let client = Client::new(&xprt, echo_program()).expect("cannot create client");
        assert_eq!(within(client.timedcall::<_, u32>(Duration::from_secs(2), ECHO_U32, &n)).await, Ok(n));
    }
    assert_eq!(servers.lock().expect("unable to unlock servers mutex").len(), 3);
}

#[tokio::test]
async fn refused_connection_is_closed() {
    init_tracing();
    let listener = RpcTcpListener::bind("127.0.0.1:0").await.expect("cannot bind");
    let addr = listener.local_addr().expect("no address");
    let on_connection: ConnectionHandler = Arc::new(|_xprt: Arc<Transport>, peer: SocketAddr| -> anyhow::Result<()> {
        Err(anyhow::anyhow!("{peer} is not welcome"))
    });
    tokio::spawn(async move { listener.handle_forever(on_connection).await });

    let xprt = connect_tcp(addr).await.expect("cannot connect");
    let client = Client::new(&xprt, echo_program()).expect("cannot create client");
    assert!(within(client.call::<_, u32>(ECHO_U32, &1u32)).await.is_err());
}

#[test]
fn listener_address_must_have_a_port() {
    let runtime = tokio::runtime::Runtime::new().expect("cannot start runtime");
    assert!(runtime.block_on(RpcTcpListener::bind("127.0.0.1")).is_err());
    assert!(runtime.block_on(RpcTcpListener::bind("127.0.0.1:http")).is_err());
}

#[tokio::test]
async fn connected_udp_client() {
    init_tracing();
    let (server_xprt, server_addr) = udp_transport().await;
    let _server = spawn_echo_server(&server_xprt);

    let xprt = connect_udp(server_addr).await.expect("cannot connect");
    assert!(xprt.is_connected());
    let client = Client::new(&xprt, echo_program()).expect("cannot create client");
    assert_eq!(within(client.call::<_, u32>(ECHO_U32, &12u32)).await, Ok(12));
}
