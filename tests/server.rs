use std::sync::Arc;
use std::time::Duration;

mod support;

use tokio::sync::mpsc;

use mamont_arpc::rpc::{
    CallOptions, Client, Lookup, ReplayCache, ReplayKey, ReplayPolicy, Server, ServerConfig, ServerEvent,
};
use mamont_arpc::xdr::rpc::{
    accept_body, auth_stat, auth_unix, call_body, clnt_stat, decode_reply, encode_call, mismatch_info, opaque_auth,
    peek_header, rejected_reply, reply_body, rpc_body, rpc_msg, REPLY,
};
use mamont_arpc::xdr::{deserialize, to_bytes, BoundedVec, Opaque};

use support::{
    answer, call_message, echo_program, echo_program_version, init_tracing, next_call, next_packet, raw_receiver,
    spawn_echo_server, stream_pair, udp_transport, within, ECHO_NULL, ECHO_PROG, ECHO_U32, ECHO_VERS,
};

fn reply_body_of(msg: &[u8]) -> reply_body {
    match deserialize::<rpc_msg>(&mut &msg[..]).expect("undecodable reply").body {
        rpc_body::REPLY(body) => body,
        rpc_body::CALL(_) => panic!("expected a reply"),
    }
}

#[tokio::test]
async fn serves_a_call() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(1, ECHO_U32, &5u32)], None).expect("send failed");
    let call = next_call(&mut calls).await;
    assert_eq!((call.xid(), call.prog(), call.vers(), call.proc()), (1, ECHO_PROG, ECHO_VERS, ECHO_U32));
    assert_eq!(call.args::<u32>(), Some(&5));
    assert_eq!(call.source(), None);
    assert_eq!(server.in_flight(), 1);
    assert_eq!(server.session().serving(), 1);

    call.reply(&6u32);
    let reply = next_packet(&mut replies).await.data;
    assert_eq!(peek_header(&reply), Some((1, REPLY)));
    assert_eq!(decode_reply::<u32>(&reply), Ok(6));
    assert_eq!(server.in_flight(), 0);
    assert_eq!(server.cached_replies(), None);
}

#[tokio::test]
async fn unknown_program_is_unavailable() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, _calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    let msg = encode_call(2, 99, 1, 0, &opaque_auth::null(), &()).expect("cannot encode");
    peer.send(&[&msg], None).expect("send failed");
    assert_eq!(decode_reply::<()>(&next_packet(&mut replies).await.data), Err(clnt_stat::RPC_PROGUNAVAIL));
}

#[tokio::test]
async fn unserved_version_reports_the_range() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx1, _calls1) = mpsc::unbounded_channel();
    let (tx3, _calls3) = mpsc::unbounded_channel();
    let _v1 = Server::new(&xprt, echo_program_version(1), tx1).expect("cannot create server");
    let _v3 = Server::new(&xprt, echo_program_version(3), tx3).expect("cannot create server");

    let msg = encode_call(3, ECHO_PROG, 2, 0, &opaque_auth::null(), &()).expect("cannot encode");
    peer.send(&[&msg], None).expect("send failed");
    match reply_body_of(&next_packet(&mut replies).await.data) {
        reply_body::MSG_ACCEPTED(accepted) => {
            assert_eq!(accepted.reply_data, accept_body::PROG_MISMATCH(mismatch_info { low: 1, high: 3 }));
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn server_without_handler_is_unavailable() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, _calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");
    server.set_handler(None);

    peer.send(&[&call_message(4, ECHO_NULL, &())], None).expect("send failed");
    assert_eq!(decode_reply::<()>(&next_packet(&mut replies).await.data), Err(clnt_stat::RPC_PROGUNAVAIL));
}

#[tokio::test]
async fn unknown_procedure_is_answered_here() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(5, 7, &())], None).expect("send failed");
    assert_eq!(decode_reply::<()>(&next_packet(&mut replies).await.data), Err(clnt_stat::RPC_PROCUNAVAIL));
    assert!(calls.try_recv().is_err());
    assert_eq!(server.in_flight(), 0);
}

#[tokio::test]
async fn undecodable_arguments_are_garbage() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(6, ECHO_U32, &())], None).expect("send failed");
    assert_eq!(decode_reply::<()>(&next_packet(&mut replies).await.data), Err(clnt_stat::RPC_CANTDECODEARGS));
    assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn other_rpc_versions_are_denied() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, _calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    let call = call_body { rpcvers: 3, prog: ECHO_PROG, vers: ECHO_VERS, proc: 0, ..call_body::default() };
    let msg = to_bytes(&rpc_msg { xid: 7, body: rpc_body::CALL(call) }).expect("cannot encode");
    peer.send(&[&msg], None).expect("send failed");

    let reply = next_packet(&mut replies).await.data;
    assert_eq!(
        reply_body_of(&reply),
        reply_body::MSG_DENIED(rejected_reply::RPC_MISMATCH(mismatch_info { low: 2, high: 2 }))
    );
    assert_eq!(decode_reply::<()>(&reply), Err(clnt_stat::RPC_VERSMISMATCH));
}

#[tokio::test]
async fn rejections_and_errors_reach_the_caller() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(8, ECHO_NULL, &())], None).expect("send failed");
    next_call(&mut calls).await.reject(auth_stat::AUTH_TOOWEAK);
    match reply_body_of(&next_packet(&mut replies).await.data) {
        reply_body::MSG_DENIED(rejected_reply::AUTH_ERROR(stat)) => assert_eq!(stat, auth_stat::AUTH_TOOWEAK),
        other => panic!("unexpected reply {other:?}"),
    }

    peer.send(&[&call_message(9, ECHO_NULL, &())], None).expect("send failed");
    next_call(&mut calls).await.reject_accept(accept_body::SYSTEM_ERR);
    assert_eq!(decode_reply::<()>(&next_packet(&mut replies).await.data), Err(clnt_stat::RPC_SYSTEMERROR));
}

#[tokio::test]
async fn dropped_call_is_ignored() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(10, ECHO_NULL, &())], None).expect("send failed");
    drop(next_call(&mut calls).await);
    assert_eq!(server.in_flight(), 0);

    peer.send(&[&call_message(11, ECHO_NULL, &())], None).expect("send failed");
    next_call(&mut calls).await.ignore();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(replies.try_recv().is_err());
}

#[tokio::test]
async fn unix_credentials_are_visible() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");
    let cred = auth_unix {
        stamp: 0,
        machinename: Opaque(b"client".to_vec()),
        uid: 501,
        gid: 20,
        gids: BoundedVec(vec![20, 80]),
    };

    let auth = opaque_auth::unix(&cred).expect("credential fits");
    let msg = encode_call(12, ECHO_PROG, ECHO_VERS, ECHO_NULL, &auth, &()).expect("cannot encode");
    peer.send(&[&msg], None).expect("send failed");

    let call = next_call(&mut calls).await;
    assert_eq!(call.auth_unix(), Some(cred));
    call.ignore();
}

#[tokio::test]
async fn garbage_on_a_stream_is_eof() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let _server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&[1, 2, 3, 4, 5, 6]], None).expect("send failed");
    assert!(matches!(within(calls.recv()).await, Some(ServerEvent::Eof)));
    assert!(xprt.at_eof());
}

#[tokio::test]
async fn stream_eof_reaches_the_handler() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.fail();
    assert!(matches!(within(calls.recv()).await, Some(ServerEvent::Eof)));

    // a new handler learns about it straight away
    let (tx, mut late) = mpsc::unbounded_channel();
    server.set_handler(Some(Arc::new(tx)));
    assert!(matches!(late.try_recv(), Ok(ServerEvent::Eof)));
}

#[tokio::test]
async fn delayed_eof_waits_for_calls_in_flight() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let (early_tx, mut early_rx) = mpsc::unbounded_channel();
    let _server = Server::with_delayed_eof(&xprt, echo_program(), tx, move || {
        let _ = early_tx.send(());
    })
    .expect("cannot create server");

    peer.send(&[&call_message(13, ECHO_U32, &1u32)], None).expect("send failed");
    let call = next_call(&mut calls).await;
    peer.fail();

    within(early_rx.recv()).await.expect("early EOF hook not run");
    assert!(calls.try_recv().is_err());

    call.reply(&1u32);
    assert!(matches!(within(calls.recv()).await, Some(ServerEvent::Eof)));
}

#[tokio::test]
async fn delayed_eof_needs_a_reliable_transport() {
    let (udp, _) = udp_transport().await;
    let (tx, _calls) = mpsc::unbounded_channel();
    assert!(Server::with_delayed_eof(&udp, echo_program(), tx, || {}).is_err());
}

#[tokio::test]
#[should_panic(expected = "already served")]
async fn one_server_per_program_version() {
    let (xprt, _peer) = stream_pair();
    let (tx1, _calls1) = mpsc::unbounded_channel();
    let (tx2, _calls2) = mpsc::unbounded_channel();
    let _first = Server::new(&xprt, echo_program(), tx1).expect("cannot create server");
    let _second = Server::new(&xprt, echo_program(), tx2);
}

#[tokio::test]
async fn dropped_server_frees_its_slot() {
    let (xprt, _peer) = stream_pair();
    let (tx1, _calls1) = mpsc::unbounded_channel();
    let (tx2, _calls2) = mpsc::unbounded_channel();
    let first = Server::new(&xprt, echo_program(), tx1).expect("cannot create server");
    drop(first);
    let _second = Server::new(&xprt, echo_program(), tx2).expect("cannot create server");
}

#[tokio::test]
async fn datagram_duplicates_run_once() {
    init_tracing();
    let (xprt, server_addr) = udp_transport().await;
    let (peer, peer_addr) = udp_transport().await;
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");
    let msg = call_message(20, ECHO_U32, &3u32);

    peer.send(&[&msg], Some(server_addr)).expect("send failed");
    let call = next_call(&mut calls).await;
    assert_eq!(call.source(), Some(peer_addr));

    // still being served: the duplicate is dropped
    peer.send(&[&msg], Some(server_addr)).expect("send failed");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.try_recv().is_err());
    assert!(replies.try_recv().is_err());

    call.reply(&3u32);
    let first = next_packet(&mut replies).await.data;
    assert_eq!(server.cached_replies(), Some(1));

    // answered: the duplicate gets the cached reply
    peer.send(&[&msg], Some(server_addr)).expect("send failed");
    let again = next_packet(&mut replies).await.data;
    assert_eq!(first, again);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.try_recv().is_err());
}

#[tokio::test]
async fn datagram_replay_cache_is_bounded() {
    init_tracing();
    let (xprt, server_addr) = udp_transport().await;
    let (peer, _) = udp_transport().await;
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let config = ServerConfig::default().with_replay_capacity(2);
    let server = Server::with_config(&xprt, echo_program(), tx, config).expect("cannot create server");

    for xid in 30..33u32 {
        peer.send(&[&call_message(xid, ECHO_U32, &xid)], Some(server_addr)).expect("send failed");
        answer(next_call(&mut calls).await);
        next_packet(&mut replies).await;
    }
    assert_eq!(server.cached_replies(), Some(2));

    // the oldest reply was evicted, so its duplicate runs again
    peer.send(&[&call_message(30, ECHO_U32, &30u32)], Some(server_addr)).expect("send failed");
    let rerun = next_call(&mut calls).await;
    assert_eq!(rerun.xid(), 30);
    rerun.reply_nocache(&30u32);
    next_packet(&mut replies).await;
    assert_eq!(server.cached_replies(), Some(2));
}

#[tokio::test]
async fn errors_are_not_cached() {
    init_tracing();
    let (xprt, server_addr) = udp_transport().await;
    let (peer, _) = udp_transport().await;
    let mut replies = raw_receiver(&peer);
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::new(&xprt, echo_program(), tx).expect("cannot create server");

    peer.send(&[&call_message(40, ECHO_U32, &())], Some(server_addr)).expect("send failed");
    next_packet(&mut replies).await;
    peer.send(&[&call_message(41, ECHO_NULL, &())], Some(server_addr)).expect("send failed");
    next_call(&mut calls).await.reject(auth_stat::AUTH_BADCRED);
    next_packet(&mut replies).await;

    assert_eq!(server.cached_replies(), Some(0));
}

#[tokio::test]
async fn unexpected_datagrams_are_dropped() {
    init_tracing();
    let (xprt, server_addr) = udp_transport().await;
    let (peer, _) = udp_transport().await;
    let mut replies = raw_receiver(&peer);
    let server = support::spawn_echo_server(&xprt);

    peer.send(&[&[9, 9, 9]], Some(server_addr)).expect("send failed");
    peer.send(&[&call_message(50, ECHO_U32, &50u32)], Some(server_addr)).expect("send failed");
    assert_eq!(decode_reply::<u32>(&next_packet(&mut replies).await.data), Ok(50));
    assert!(!server.transport().at_eof());
}

#[tokio::test]
async fn resumed_server_answers_duplicates_from_its_cache() {
    init_tracing();
    let (xprt, peer) = stream_pair();
    let (tx, mut calls) = mpsc::unbounded_channel();
    let server = Server::resumable(&xprt, echo_program(), tx).expect("cannot create server");
    let caller = Client::new(&peer, echo_program()).expect("cannot create client");

    for xid in [60u32, 62] {
        let pending = caller.call_marshaled::<u32>(call_message(xid, ECHO_U32, &xid), CallOptions::default());
        answer(next_call(&mut calls).await);
        assert_eq!(within(pending).await, Ok(xid));
    }
    let _lost = caller.call_marshaled::<u32>(call_message(61, ECHO_U32, &61u32), CallOptions::default());
    let in_flight = next_call(&mut calls).await;
    assert_eq!(server.cached_replies(), Some(2));

    peer.fail();
    assert!(matches!(within(calls.recv()).await, Some(ServerEvent::Eof)));

    let old_session = server.session();
    let (xprt, peer) = stream_pair();
    server.resume(&xprt).expect("cannot resume");
    let caller = Client::new(&peer, echo_program()).expect("cannot create client");

    // a call from the old connection is accounted where it arrived
    in_flight.reply(&61u32);
    assert_eq!(old_session.serving(), 0);
    assert_eq!(server.session().serving(), 0);
    assert_eq!(server.in_flight(), 0);
    assert_eq!(server.cached_replies(), Some(3));

    // a retransmission is answered without running the procedure again
    let again = caller.call_marshaled::<u32>(call_message(60, ECHO_U32, &60u32), CallOptions::default());
    assert_eq!(within(again).await, Ok(60));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(calls.try_recv().is_err());

    // the first new call drops replies left over from the old connection
    let fresh = caller.call::<_, u32>(ECHO_U32, &70u32);
    answer(next_call(&mut calls).await);
    assert_eq!(within(fresh).await, Ok(70));
    let rerun = caller.call_marshaled::<u32>(call_message(62, ECHO_U32, &62u32), CallOptions::default());
    let call = next_call(&mut calls).await;
    assert_eq!(call.xid(), 62);
    answer(call);
    assert_eq!(within(rerun).await, Ok(62));
    assert_eq!(server.cached_replies(), Some(4));

    // once the peer answers a call sent after those replies, they are known
    // to have arrived
    let _echo = spawn_echo_server(&peer);
    let back = Client::new(&xprt, echo_program()).expect("cannot create client");
    assert_eq!(within(back.call::<_, u32>(ECHO_U32, &1u32)).await, Ok(1));
    assert!(server.session().max_acked_offset() > 0);

    let last = caller.call::<_, u32>(ECHO_U32, &80u32);
    answer(next_call(&mut calls).await);
    assert_eq!(within(last).await, Ok(80));
    assert_eq!(server.cached_replies(), Some(1));
}

#[tokio::test]
async fn resumable_server_needs_a_reliable_transport() {
    let (udp, _) = udp_transport().await;
    let (tx, _calls) = mpsc::unbounded_channel();
    assert!(Server::resumable(&udp, echo_program(), tx).is_err());

    let (xprt, _peer) = stream_pair();
    let (tx, _calls) = mpsc::unbounded_channel();
    let plain = Server::new(&xprt, echo_program(), tx).expect("cannot create server");
    let (other, _other_peer) = stream_pair();
    assert!(plain.resume(&other).is_err());
}

fn key(xid: u32) -> ReplayKey {
    ReplayKey { xid, source: None, prog: ECHO_PROG, vers: ECHO_VERS, proc: ECHO_U32 }
}

#[test]
fn unreliable_cache_evicts_oldest_reply() {
    let mut cache = ReplayCache::new(ReplayPolicy::Unreliable { capacity: 2 });
    for xid in 1..=3 {
        assert_eq!(cache.begin(&key(xid)), Lookup::New);
    }
    assert_eq!(cache.begin(&key(1)), Lookup::InProgress);
    for xid in 1..=3 {
        cache.complete(&key(xid), Arc::from(vec![xid as u8]), 0, 0);
    }

    assert_eq!(cache.replied(), 2);
    assert!(!cache.contains(&key(1)));
    assert_eq!(cache.begin(&key(3)), Lookup::Replied(Arc::from(vec![3u8])));
}

#[test]
fn resumable_cache_evicts_what_the_peer_has_read() {
    let mut cache = ReplayCache::new(ReplayPolicy::Resumable);
    cache.begin(&key(1));
    cache.begin(&key(2));
    cache.complete(&key(1), Arc::from(vec![1u8]), 100, 0);
    cache.complete(&key(2), Arc::from(vec![2u8]), 200, 150);

    assert!(!cache.contains(&key(1)));
    assert_eq!(cache.offset(&key(2)), Some(200));

    // resending moves the reply to a later offset
    assert_eq!(cache.begin(&key(2)), Lookup::Replied(Arc::from(vec![2u8])));
    cache.resent(&key(2), 300);
    assert_eq!(cache.offset(&key(2)), Some(300));

    // after reconnection, old replies go as soon as a new request arrives
    cache.reset_offsets();
    assert_eq!(cache.offset(&key(2)), Some(0));
    assert_eq!(cache.begin(&key(3)), Lookup::New);
    assert!(!cache.contains(&key(2)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn removed_calls_are_forgotten() {
    let mut cache = ReplayCache::new(ReplayPolicy::Unreliable { capacity: 4 });
    cache.begin(&key(1));
    cache.remove(&key(1));
    assert!(cache.is_empty());
    assert_eq!(cache.begin(&key(1)), Lookup::New);
}
