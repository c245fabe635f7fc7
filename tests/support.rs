#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mamont_arpc::rpc::{Program, Server, ServerEvent, ServiceCall};
use mamont_arpc::transport::{Packet, StreamConfig, Transport};
use mamont_arpc::xdr::rpc::{encode_call, opaque_auth};
use mamont_arpc::xdr::Serialize;

pub const ECHO_PROG: u32 = 0x2000_0101;
pub const ECHO_VERS: u32 = 1;
pub const ECHO_NULL: u32 = 0;
pub const ECHO_U32: u32 = 1;
pub const ECHO_BYTES: u32 = 2;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A small program used across the tests: NULL, ECHO of a u32, BYTES of an opaque.
pub fn echo_program() -> Program {
    echo_program_version(ECHO_VERS)
}

pub fn echo_program_version(vers: u32) -> Program {
    Program::new("echo", ECHO_PROG, vers)
        .procedure::<()>("NULL")
        .procedure::<u32>("ECHO")
        .procedure::<Vec<u8>>("BYTES")
}

/// Fails the test if `fut` takes longer than a few seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    timeout(Duration::from_secs(5), fut).await.expect("timed out")
}

/// Two framed transports joined by an in-memory pipe.
pub fn stream_pair() -> (Arc<Transport>, Arc<Transport>) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (Transport::stream(a, StreamConfig::default()), Transport::stream(b, StreamConfig::default()))
}

/// An unconnected datagram transport on loopback and its address.
pub async fn udp_transport() -> (Arc<Transport>, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("cannot bind udp socket");
    let addr = socket.local_addr().expect("no local address");
    (Transport::datagram(socket), addr)
}

/// Installs a handler that forwards everything `xprt` receives, bypassing
/// sessions entirely.
pub fn raw_receiver(xprt: &Arc<Transport>) -> mpsc::UnboundedReceiver<Option<Packet>> {
    let (tx, rx) = mpsc::unbounded_channel();
    xprt.set_receive_handler(Some(Arc::new(tx)));
    xprt.spawn_pump();
    rx
}

pub async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Option<Packet>>) -> Packet {
    within(rx.recv())
        .await
        .expect("receiver closed")
        .expect("unexpected EOF")
}

pub fn call_message<A: Serialize + ?Sized>(xid: u32, proc: u32, args: &A) -> Vec<u8> {
    encode_call(xid, ECHO_PROG, ECHO_VERS, proc, &opaque_auth::null(), args).expect("cannot encode call")
}

pub async fn next_call(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServiceCall {
    match within(rx.recv()).await.expect("server channel closed") {
        ServerEvent::Call(call) => call,
        ServerEvent::Eof => panic!("unexpected EOF"),
    }
}

/// Answers every call the way the echo program expects.
pub fn answer(call: ServiceCall) {
    match call.proc() {
        ECHO_U32 => {
            let value = *call.args::<u32>().expect("ECHO takes a u32");
            call.reply(&value);
        }
        ECHO_BYTES => {
            let data = call.args::<Vec<u8>>().expect("BYTES takes an opaque").clone();
            call.reply(&data[..]);
        }
        _ => call.reply(&()),
    }
}

/// Serves the echo program on `xprt` from a background task.
pub fn spawn_echo_server(xprt: &Arc<Transport>) -> Server {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let server = Server::new(xprt, echo_program(), tx).expect("cannot create server");
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::Call(call) => answer(call),
                ServerEvent::Eof => break,
            }
        }
    });
    server
}
