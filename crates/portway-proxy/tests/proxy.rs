//! End-to-end proxy engine tests over loopback TCP and a pipe transport

use bytes::Bytes;
use portway_proto::{TunnelCodec, TunnelEvent, TunnelMessage};
use portway_proxy::{ProxyConfig, ProxyError, ProxyState, TcpProxy};
use portway_transport::{PipeTransport, Transport};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Next frame observed by the remote peer
async fn recv_event(peer: &mut PipeTransport) -> TunnelEvent {
    let frame = timeout(WAIT, peer.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport error")
        .expect("transport closed unexpectedly");
    TunnelCodec::decode(&frame).expect("malformed frame").event
}

/// Inject an inbound frame as the remote peer
async fn send_event(peer: &mut PipeTransport, tunnel_id: &str, event: TunnelEvent) {
    let msg = TunnelMessage {
        tunnel_id: tunnel_id.to_string(),
        event,
    };
    let frame = TunnelCodec::encode(&msg).unwrap();
    peer.send(frame).await.unwrap();
}

/// Start a listening proxy on an ephemeral port and consume ProxyCreated
async fn start_proxy(tunnel_id: &str, peer: &mut PipeTransport, local: PipeTransport) -> (TcpProxy, u16) {
    let config = ProxyConfig::new(0, 9000).with_tunnel_id(tunnel_id);
    let mut proxy = TcpProxy::new(config, Box::new(local));
    let port = proxy.start_listening().await.unwrap();

    match recv_event(peer).await {
        TunnelEvent::ProxyCreated {
            port: announced, ..
        } => assert_eq!(announced, port),
        other => panic!("expected ProxyCreated, got {:?}", other),
    }
    (proxy, port)
}

async fn connect_client(peer: &mut PipeTransport, port: u16) -> (TcpStream, u32) {
    let client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    match recv_event(peer).await {
        TunnelEvent::Connection { client_id } => (client, client_id),
        other => panic!("expected Connection, got {:?}", other),
    }
}

#[tokio::test]
async fn single_client_round_trip() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();

    let config = ProxyConfig::new(0, 9000).with_tunnel_id("t1");
    let mut proxy = TcpProxy::new(config, Box::new(local));
    assert_eq!(proxy.state(), ProxyState::Initializing);
    assert_eq!(proxy.id(), "t1");

    let port = proxy.start_listening().await.unwrap();
    assert_eq!(proxy.state(), ProxyState::Listening);
    assert_eq!(proxy.local_addr().unwrap().port(), port);

    match recv_event(&mut peer).await {
        TunnelEvent::ProxyCreated {
            port: announced,
            use_ipv4,
            remote_port,
        } => {
            assert_eq!(announced, port);
            assert!(use_ipv4);
            assert_eq!(remote_port, 9000);
        }
        other => panic!("expected ProxyCreated, got {:?}", other),
    }

    let (mut client, client_id) = connect_client(&mut peer, port).await;

    // local bytes flow outward
    client.write_all(b"hello").await.unwrap();
    match recv_event(&mut peer).await {
        TunnelEvent::Data { client_id: id, data } => {
            assert_eq!(id, client_id);
            assert_eq!(data, b"hello");
        }
        other => panic!("expected Data, got {:?}", other),
    }

    // peer bytes flow back into the socket
    send_event(
        &mut peer,
        "t1",
        TunnelEvent::Data {
            client_id,
            data: b"world".to_vec(),
        },
    )
    .await;
    let mut buf = [0u8; 5];
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"world");

    // clean local disconnect forwards End then Close
    drop(client);
    match recv_event(&mut peer).await {
        TunnelEvent::End { client_id: id } => assert_eq!(id, client_id),
        other => panic!("expected End, got {:?}", other),
    }
    match recv_event(&mut peer).await {
        TunnelEvent::Close { client_id: id } => assert_eq!(id, client_id),
        other => panic!("expected Close, got {:?}", other),
    }
}

#[tokio::test]
async fn bind_failure_is_surfaced_and_announced() {
    init_tracing();
    let occupied = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let (local, mut peer) = PipeTransport::pair();
    let config = ProxyConfig::new(port, 9000).with_tunnel_id("t-bind");
    let mut proxy = TcpProxy::new(config, Box::new(local));

    let err = proxy.start_listening().await.unwrap_err();
    assert!(matches!(err, ProxyError::Bind { .. }));
    assert_eq!(proxy.state(), ProxyState::Closed);

    match recv_event(&mut peer).await {
        TunnelEvent::ProxyError {
            port: announced,
            use_ipv4,
            remote_port,
            error,
        } => {
            assert_eq!(announced, port);
            assert!(use_ipv4);
            assert_eq!(remote_port, 9000);
            assert!(!error.is_empty());
        }
        other => panic!("expected ProxyError, got {:?}", other),
    }
}

#[tokio::test]
async fn two_clients_keep_per_client_order() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (_proxy, port) = start_proxy("t2", &mut peer, local).await;

    let (mut client_a, a_id) = connect_client(&mut peer, port).await;
    let (mut client_b, b_id) = connect_client(&mut peer, port).await;
    assert_ne!(a_id, b_id);

    client_a.write_all(b"A1").await.unwrap();
    client_b.write_all(b"B1").await.unwrap();
    client_a.write_all(b"A2").await.unwrap();

    // interleaving between the two clients may vary; bytes for each client
    // must arrive in write order
    let mut a_bytes = Vec::new();
    let mut b_bytes = Vec::new();
    while a_bytes.len() < 4 || b_bytes.len() < 2 {
        match recv_event(&mut peer).await {
            TunnelEvent::Data { client_id, data } => {
                if client_id == a_id {
                    a_bytes.extend_from_slice(&data);
                } else {
                    assert_eq!(client_id, b_id);
                    b_bytes.extend_from_slice(&data);
                }
            }
            other => panic!("expected Data, got {:?}", other),
        }
    }
    assert_eq!(a_bytes, b"A1A2");
    assert_eq!(b_bytes, b"B1");
}

#[tokio::test]
async fn inbound_data_for_dead_client_is_dropped() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (proxy, port) = start_proxy("t4", &mut peer, local).await;

    let (client, client_id) = connect_client(&mut peer, port).await;
    drop(client);
    assert!(matches!(recv_event(&mut peer).await, TunnelEvent::End { .. }));
    assert!(matches!(recv_event(&mut peer).await, TunnelEvent::Close { .. }));

    // both inbound paths: the transport and direct receive()
    send_event(
        &mut peer,
        "t4",
        TunnelEvent::Data {
            client_id,
            data: b"x".to_vec(),
        },
    )
    .await;
    proxy
        .receive(TunnelMessage::data("t4", client_id, b"y".to_vec()))
        .await;

    // proxy is still healthy: a fresh client connects and is announced
    let (_client2, client2_id) = connect_client(&mut peer, port).await;
    assert_ne!(client2_id, client_id);
}

#[tokio::test]
async fn close_ends_clients_and_announces_once() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (mut proxy, port) = start_proxy("t5", &mut peer, local).await;

    let (mut client_a, a_id) = connect_client(&mut peer, port).await;
    let (mut client_b, _b_id) = connect_client(&mut peer, port).await;

    proxy.close().await;
    assert_eq!(proxy.state(), ProxyState::Closed);

    // exactly one ProxyClosed, then the transport itself is released
    match recv_event(&mut peer).await {
        TunnelEvent::ProxyClosed => {}
        other => panic!("expected ProxyClosed, got {:?}", other),
    }
    let after = timeout(WAIT, peer.recv()).await.unwrap().unwrap();
    assert!(after.is_none(), "no frames may follow ProxyClosed");

    // both local sockets observe EOF
    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, client_a.read(&mut buf)).await.unwrap().unwrap(), 0);
    assert_eq!(timeout(WAIT, client_b.read(&mut buf)).await.unwrap().unwrap(), 0);

    // subsequent calls are no-ops
    proxy
        .receive(TunnelMessage::data("t5", a_id, b"late".to_vec()))
        .await;
    proxy.close().await;
    assert_eq!(proxy.state(), ProxyState::Closed);

    // further local connections are refused or reset, never announced
    if let Ok(mut late) = TcpStream::connect(("127.0.0.1", port)).await {
        let n = timeout(WAIT, late.read(&mut buf)).await.unwrap().unwrap_or(0);
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn socket_reset_forwards_error_then_close() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (mut proxy, port) = start_proxy("t6", &mut peer, local).await;

    let (client_a, a_id) = connect_client(&mut peer, port).await;
    let (mut client_b, b_id) = connect_client(&mut peer, port).await;

    // abortive close: linger 0 turns the FIN into a RST
    client_a.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client_a);

    match recv_event(&mut peer).await {
        TunnelEvent::Error {
            client_id,
            error,
        } => {
            assert_eq!(client_id, a_id);
            assert!(!error.is_empty());
        }
        other => panic!("expected Error, got {:?}", other),
    }
    match recv_event(&mut peer).await {
        TunnelEvent::Close { client_id } => assert_eq!(client_id, a_id),
        other => panic!("expected Close, got {:?}", other),
    }

    // the error is also surfaced upward
    let mut errors = proxy.take_socket_errors().unwrap();
    let upward = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(upward.client_id, a_id);

    // B is unaffected
    client_b.write_all(b"ok").await.unwrap();
    match recv_event(&mut peer).await {
        TunnelEvent::Data { client_id, data } => {
            assert_eq!(client_id, b_id);
            assert_eq!(data, b"ok");
        }
        other => panic!("expected Data, got {:?}", other),
    }
}

#[tokio::test]
async fn frames_for_other_tunnels_are_ignored() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (_proxy, port) = start_proxy("t7", &mut peer, local).await;

    let (mut client, client_id) = connect_client(&mut peer, port).await;

    // same client id, wrong tunnel: must not reach the socket
    send_event(
        &mut peer,
        "someone-else",
        TunnelEvent::Data {
            client_id,
            data: b"stray".to_vec(),
        },
    )
    .await;
    let mut buf = [0u8; 5];
    let read = timeout(Duration::from_millis(200), client.read(&mut buf)).await;
    assert!(read.is_err(), "stray bytes were written to the socket");

    // matching tunnel id still works
    send_event(
        &mut peer,
        "t7",
        TunnelEvent::Data {
            client_id,
            data: b"real!".to_vec(),
        },
    )
    .await;
    timeout(WAIT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"real!");
}

#[tokio::test]
async fn malformed_inbound_frames_are_dropped() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (_proxy, port) = start_proxy("t8", &mut peer, local).await;

    peer.send(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
        .await
        .unwrap();

    // engine keeps serving after the bad frame
    let (mut client, client_id) = connect_client(&mut peer, port).await;
    client.write_all(b"still-alive").await.unwrap();
    match recv_event(&mut peer).await {
        TunnelEvent::Data { client_id: id, data } => {
            assert_eq!(id, client_id);
            assert_eq!(data, b"still-alive");
        }
        other => panic!("expected Data, got {:?}", other),
    }
}

#[tokio::test]
async fn idle_client_gets_timeout_events() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let config = ProxyConfig::new(0, 9000)
        .with_tunnel_id("t9")
        .with_idle_timeout(Duration::from_millis(50));
    let mut proxy = TcpProxy::new(config, Box::new(local));
    let port = proxy.start_listening().await.unwrap();
    assert!(matches!(
        recv_event(&mut peer).await,
        TunnelEvent::ProxyCreated { .. }
    ));

    let (_client, client_id) = connect_client(&mut peer, port).await;

    match recv_event(&mut peer).await {
        TunnelEvent::Timeout { client_id: id } => assert_eq!(id, client_id),
        other => panic!("expected Timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn transport_close_tears_the_proxy_down() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (proxy, port) = start_proxy("t10", &mut peer, local).await;

    let (mut client, _client_id) = connect_client(&mut peer, port).await;

    peer.close().await.unwrap();

    // the engine releases the socket once it observes transport close
    let mut buf = [0u8; 1];
    assert_eq!(timeout(WAIT, client.read(&mut buf)).await.unwrap().unwrap(), 0);

    // and stops listening
    timeout(WAIT, async {
        loop {
            if proxy.state() == ProxyState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("proxy never reached Closed after transport loss");
}

#[tokio::test]
async fn start_listening_twice_is_rejected() {
    init_tracing();
    let (local, mut peer) = PipeTransport::pair();
    let (mut proxy, _port) = start_proxy("t11", &mut peer, local).await;

    assert!(matches!(
        proxy.start_listening().await,
        Err(ProxyError::InvalidState(ProxyState::Listening))
    ));
}
