//! Integration tests for carrier-mux
//!
//! Drives real sessions against either a full server or a raw
//! frame-speaking peer over in-memory carriers, with in-process TCP echo
//! targets, and checks the wire behavior frame by frame where it matters.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use carrier_mux::mux::{
    read_frame, Frame, Resolver, Role, Session, SessionContext, ERR_AUTH, ERR_IDEXIST, ERR_NONE,
    WINDOW_SIZE,
};
use carrier_mux::pool::SessionPool;
use carrier_mux::server::Server;
use carrier_mux::transport::TcpCarrierDialer;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

/// TCP listener echoing every connection until EOF.
async fn echo_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn single_user_auth() -> HashMap<String, String> {
    let mut auth = HashMap::new();
    auth.insert("u".to_string(), "p".to_string());
    auth
}

/// Client session talking to a full in-process server over a duplex pair.
async fn connected_client(server: Server, username: &str, password: &str) -> Session {
    let (local, remote) = tokio::io::duplex(1024 * 1024);
    tokio::spawn(async move {
        let _ = server.handle_carrier(Box::new(remote)).await;
    });

    let client = Session::new(Box::new(local), Role::Client, SessionContext::default());
    client.auth(username, password).await.unwrap();

    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    client
}

/// Client session against a raw frame-speaking peer (no server logic).
fn raw_peer_client() -> (Session, DuplexStream) {
    let (local, remote) = tokio::io::duplex(4 * 1024 * 1024);
    let client = Session::new(Box::new(local), Role::Client, SessionContext::default());
    let runner = client.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (client, remote)
}

async fn send_raw(peer: &mut DuplexStream, frame: Frame) {
    peer.write_all(&frame.pack()).await.unwrap();
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn test_auth_success_then_echo() {
    let echo = echo_listener().await;
    let client = connected_client(Server::new(single_user_auth()), "u", "p").await;

    let stream = client.dial("tcp", &echo.to_string()).await.unwrap();

    let blob = b"hello across the tunnel";
    stream.write(blob).await.unwrap();

    let mut buf = vec![0u8; blob.len()];
    let mut got = 0;
    while got < blob.len() {
        let n = stream.read(&mut buf[got..]).await.unwrap();
        assert_ne!(n, 0, "eof before echo completed");
        got += n;
    }
    assert_eq!(&buf[..], blob);

    // half-close: our FIN reaches the echo target, which closes in turn,
    // and the FIN/FIN pair empties the port table
    stream.close().await.unwrap();
    let mut tail = [0u8; 16];
    assert_eq!(stream.read(&mut tail).await.unwrap(), 0);
    wait_until("port table to drain", || client.stream_count() == 0).await;
}

#[tokio::test]
async fn test_auth_failure_surfaces_and_closes() {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let server = Server::new(single_user_auth());
    let handle = tokio::spawn(async move { server.handle_carrier(Box::new(remote)).await });

    let client = Session::new(Box::new(local), Role::Client, SessionContext::default());
    let err = client.auth("u", "wrong").await.unwrap_err();
    assert!(matches!(err, carrier_mux::mux::MuxError::Auth));

    let server_result = handle.await.unwrap();
    assert!(matches!(
        server_result,
        Err(carrier_mux::mux::MuxError::Auth)
    ));
}

#[tokio::test]
async fn test_first_frame_must_be_syn() {
    let (mut raw, remote) = tokio::io::duplex(64 * 1024);
    let server = Server::new(HashMap::new());
    let handle = tokio::spawn(async move { server.handle_carrier(Box::new(remote)).await });

    send_raw(&mut raw, Frame::Ping { streamid: 0 }).await;
    assert!(matches!(
        handle.await.unwrap(),
        Err(carrier_mux::mux::MuxError::UnexpectedPkg(_))
    ));
}

#[tokio::test]
async fn test_id_collision_keeps_session_alive() {
    let echo = echo_listener().await;
    let (mut raw, remote) = tokio::io::duplex(256 * 1024);
    let server = Server::new(single_user_auth());
    tokio::spawn(async move {
        let _ = server.handle_carrier(Box::new(remote)).await;
    });

    // auth handshake, by hand
    send_raw(
        &mut raw,
        Frame::Syn {
            streamid: 0,
            network: "u".into(),
            address: "p".into(),
        },
    )
    .await;
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Result {
            streamid: 0,
            errno: ERR_NONE
        }
    ));

    let dial_syn = |streamid| Frame::Syn {
        streamid,
        network: "tcp".into(),
        address: echo.to_string(),
    };

    send_raw(&mut raw, dial_syn(7)).await;
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Result {
            streamid: 7,
            errno: ERR_NONE
        }
    ));

    // the peer reuses a busy id: rejected, session survives
    send_raw(&mut raw, dial_syn(7)).await;
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Result {
            streamid: 7,
            errno: ERR_IDEXIST
        }
    ));

    send_raw(&mut raw, dial_syn(9)).await;
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Result {
            streamid: 9,
            errno: ERR_NONE
        }
    ));
}

#[tokio::test]
async fn test_flow_control_stalls_at_window() {
    let (client, mut raw) = raw_peer_client();

    let dialed = {
        let client = client.clone();
        tokio::spawn(async move { client.dial("tcp", "target.test:80").await })
    };
    let streamid = match read_frame(&mut raw).await.unwrap() {
        Frame::Syn { streamid, .. } => streamid,
        other => panic!("unexpected {}", other),
    };
    send_raw(
        &mut raw,
        Frame::Result {
            streamid,
            errno: ERR_NONE,
        },
    )
    .await;
    let stream = dialed.await.unwrap().unwrap();

    // write a full window plus a tail without granting any credit back
    let total = WINDOW_SIZE as usize + 1000;
    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&vec![0x5au8; total]).await })
    };

    let mut received = 0usize;
    while received < WINDOW_SIZE as usize {
        match read_frame(&mut raw).await.unwrap() {
            Frame::Data { payload, .. } => received += payload.len(),
            other => panic!("unexpected {}", other),
        }
    }
    assert_eq!(received, WINDOW_SIZE as usize);

    // the wire must now be silent: credit is exhausted
    assert!(
        timeout(Duration::from_millis(200), read_frame(&mut raw))
            .await
            .is_err()
    );
    assert!(!writer.is_finished());

    // granting credit releases exactly the tail
    send_raw(
        &mut raw,
        Frame::Wnd {
            streamid,
            window: 1000,
        },
    )
    .await;
    match read_frame(&mut raw).await.unwrap() {
        Frame::Data { payload, .. } => assert_eq!(payload.len(), 1000),
        other => panic!("unexpected {}", other),
    }
    assert_eq!(writer.await.unwrap().unwrap(), total);
}

#[tokio::test]
async fn test_half_close_allows_write_back() {
    let (client, mut raw) = raw_peer_client();

    let dialed = {
        let client = client.clone();
        tokio::spawn(async move { client.dial("tcp", "target.test:80").await })
    };
    let streamid = match read_frame(&mut raw).await.unwrap() {
        Frame::Syn { streamid, .. } => streamid,
        other => panic!("unexpected {}", other),
    };
    send_raw(
        &mut raw,
        Frame::Result {
            streamid,
            errno: ERR_NONE,
        },
    )
    .await;
    let stream = dialed.await.unwrap().unwrap();

    // peer half-closes with some buffered bytes in flight
    send_raw(
        &mut raw,
        Frame::Data {
            streamid,
            payload: bytes::Bytes::from_static(b"last words"),
        },
    )
    .await;
    send_raw(&mut raw, Frame::Fin { streamid }).await;

    let mut buf = [0u8; 32];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

    // writing back is still legal after the peer's FIN
    stream.write(&[7u8; 1024]).await.unwrap();
    match read_frame(&mut raw).await.unwrap() {
        Frame::Data { payload, .. } => assert_eq!(payload.len(), 1024),
        other => panic!("unexpected {}", other),
    }

    // our FIN completes the close and frees the port
    stream.close().await.unwrap();
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Fin { .. }
    ));
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn test_client_syn_ids_are_odd() {
    let (client, mut raw) = raw_peer_client();

    for expected in [1u16, 3] {
        let dialed = {
            let client = client.clone();
            tokio::spawn(async move { client.dial("tcp", "target.test:80").await })
        };
        match read_frame(&mut raw).await.unwrap() {
            Frame::Syn { streamid, .. } => assert_eq!(streamid, expected),
            other => panic!("unexpected {}", other),
        }
        send_raw(
            &mut raw,
            Frame::Result {
                streamid: expected,
                errno: ERR_NONE,
            },
        )
        .await;
        dialed.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_ping_and_spam_are_ignored() {
    let (client, mut raw) = raw_peer_client();

    send_raw(&mut raw, Frame::Ping { streamid: 0 }).await;
    send_raw(
        &mut raw,
        Frame::Spam {
            streamid: 0,
            payload: bytes::Bytes::from_static(&[0u8; 128]),
        },
    )
    .await;
    client.ping().await.unwrap();
    assert!(matches!(
        read_frame(&mut raw).await.unwrap(),
        Frame::Ping { streamid: 0 }
    ));

    // the session survived all of it
    let dialed = {
        let client = client.clone();
        tokio::spawn(async move { client.dial("tcp", "target.test:80").await })
    };
    let streamid = match read_frame(&mut raw).await.unwrap() {
        Frame::Syn { streamid, .. } => streamid,
        other => panic!("unexpected {}", other),
    };
    send_raw(
        &mut raw,
        Frame::Result {
            streamid,
            errno: ERR_NONE,
        },
    )
    .await;
    dialed.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_dial_maps_errno() {
    let (client, mut raw) = raw_peer_client();

    let dialed = {
        let client = client.clone();
        tokio::spawn(async move { client.dial("tcp", "target.test:80").await })
    };
    let streamid = match read_frame(&mut raw).await.unwrap() {
        Frame::Syn { streamid, .. } => streamid,
        other => panic!("unexpected {}", other),
    };
    send_raw(
        &mut raw,
        Frame::Result {
            streamid,
            errno: ERR_AUTH,
        },
    )
    .await;
    assert!(matches!(
        dialed.await.unwrap(),
        Err(carrier_mux::mux::MuxError::Auth)
    ));
    assert_eq!(client.stream_count(), 0);
}

struct MockResolver {
    ip: [u8; 4],
}

#[async_trait]
impl Resolver for MockResolver {
    async fn exchange(&self, query: &[u8]) -> io::Result<Vec<u8>> {
        // echo the question back with one A answer, id preserved
        let mut response = query.to_vec();
        response[2] |= 0x80;
        response[7] = 1;
        response.extend_from_slice(&[0xC0, 0x0C]);
        response.extend_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&1u16.to_be_bytes());
        response.extend_from_slice(&60u32.to_be_bytes());
        response.extend_from_slice(&4u16.to_be_bytes());
        response.extend_from_slice(&self.ip);
        Ok(response)
    }
}

#[tokio::test]
async fn test_dns_tunnel_roundtrip() {
    let server =
        Server::new(HashMap::new()).with_resolver(Arc::new(MockResolver { ip: [1, 2, 3, 4] }));
    let client = connected_client(server, "anyone", "anything").await;

    let addrs = client.lookup_ip("example.test").await.unwrap();
    assert_eq!(addrs, vec![IpAddr::from([1, 2, 3, 4])]);

    // the waiter port is gone once the lookup resolves
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn test_lookup_literal_ip_sends_nothing() {
    let (client, mut raw) = raw_peer_client();

    let addrs = client.lookup_ip("192.0.2.9").await.unwrap();
    assert_eq!(addrs, vec!["192.0.2.9".parse::<IpAddr>().unwrap()]);
    let addrs = client.lookup_ip("::1").await.unwrap();
    assert_eq!(addrs, vec!["::1".parse::<IpAddr>().unwrap()]);

    // no frame ever hits the wire
    assert!(
        timeout(Duration::from_millis(100), read_frame(&mut raw))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_dns_lookup_times_out_without_resolver() {
    // a server with no resolver silently drops tunneled queries
    let server = Server::new(HashMap::new());
    let client = connected_client(server, "anyone", "anything").await;

    tokio::time::pause();
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.lookup_ip("example.test").await })
    };
    sleep(Duration::from_millis(50)).await; // let the query leave
    tokio::time::advance(Duration::from_secs(11)).await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(carrier_mux::mux::MuxError::Timeout)
    ));
    assert_eq!(client.stream_count(), 0);
}

#[tokio::test]
async fn test_pool_dials_through_real_tcp() {
    let echo = echo_listener().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let server = Server::new(single_user_auth());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let pool = SessionPool::new(2, 4);
    pool.add_session_factory(
        Arc::new(TcpCarrierDialer),
        &server_addr.to_string(),
        "u",
        "p",
    );

    let stream = pool.dial("tcp", &echo.to_string()).await.unwrap();
    stream.write(b"pooled bytes").await.unwrap();
    let mut buf = [0u8; 32];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pooled bytes");

    // the pool tops itself up to min_sess
    wait_until("pool to reach min_sess", || pool.session_count() == 2).await;
}
