//! Message routing across concurrent waiters, fatal errors and pump mode.

mod common;

use bytes::Bytes;
use common::{connect_default, TestServer, SERVER_CHANNEL_BASE};
use fynx_platform::{FynxError, FynxResult};
use fynx_ssh::channel::messages::data_payload;
use fynx_ssh::message::{Disconnect, DisconnectReason, GlobalRequest};
use fynx_ssh::MessageType;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

#[test]
fn test_mac_failure_reaches_every_waiter() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        server.confirm_open(32768, 32768);
        server.expect(80);
        thread::sleep(Duration::from_millis(100));

        let mut packet = server.encode(&[81]);
        let last = packet.len() - 1;
        packet[last] ^= 0x01;
        server.send_raw(&packet);

        let disconnect = server.expect(1);
        assert_eq!(&disconnect[1..5], &5u32.to_be_bytes());
    });

    let channel = conn.open_session().unwrap();
    let start = Barrier::new(4);
    let results: Vec<FynxResult<()>> = thread::scope(|s| {
        let global = s.spawn(|| {
            start.wait();
            conn.global_request("doomed@fynx", &[], TIMEOUT).map(|_| ())
        });
        let predicates: Vec<_> = (0..2)
            .map(|_| {
                s.spawn(|| {
                    start.wait();
                    conn.next_global_message(|m| m.is(MessageType::RequestFailure), TIMEOUT)
                        .map(|_| ())
                })
            })
            .collect();
        let reader = s.spawn(|| {
            start.wait();
            channel.read_data(TIMEOUT).map(|_| ())
        });

        let mut results = vec![global.join().unwrap(), reader.join().unwrap()];
        results.extend(predicates.into_iter().map(|p| p.join().unwrap()));
        results
    });

    for result in results {
        assert!(matches!(result, Err(FynxError::MacVerification)), "{:?}", result);
    }
    server.join().unwrap();

    assert!(conn.is_closed());
    assert!(channel.is_closed());
    assert!(matches!(
        channel.read_data(TIMEOUT),
        Err(FynxError::MacVerification)
    ));
    assert!(matches!(conn.terminal_error(), Some(FynxError::MacVerification)));
    assert!(matches!(
        conn.next_global_message(|_| true, TIMEOUT),
        Err(FynxError::MacVerification)
    ));
}

#[test]
fn test_peer_disconnect_is_terminal() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        server.send(&Disconnect::new(DisconnectReason::ByApplication, "bye").to_bytes());
    });

    match conn.next_global_message(|_| true, TIMEOUT) {
        Err(FynxError::Disconnected {
            reason_code,
            description,
        }) => {
            assert_eq!(reason_code, 11);
            assert_eq!(description, "bye");
        }
        other => panic!("Expected Disconnected, got {:?}", other),
    }
    assert!(matches!(conn.open_session(), Err(FynxError::Disconnected { .. })));
    server.join().unwrap();
}

#[test]
fn test_messages_reach_only_their_channel() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        let a = server.confirm_open(32768, 32768);
        let b = server.confirm_open(32768, 32768);
        server.send(&data_payload(b, b"for b"));
        server.send(&data_payload(a, b"for a"));
    });

    let a = conn.open_session().unwrap();
    let b = conn.open_session().unwrap();
    assert_eq!(b.remote_id(), SERVER_CHANNEL_BASE + b.local_id());

    assert_eq!(a.read_data(TIMEOUT).unwrap().unwrap(), Bytes::from_static(b"for a"));
    assert_eq!(b.read_data(TIMEOUT).unwrap().unwrap(), Bytes::from_static(b"for b"));
    server.join().unwrap();
}

#[test]
fn test_concurrent_readers_and_rekey() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        let a = server.confirm_open(32768, 32768);
        let b = server.confirm_open(32768, 32768);

        // Let the client's exchange start first
        thread::sleep(Duration::from_millis(200));
        server.key_exchange();
        assert_eq!(server.exchanges(), 2);

        server.send(&data_payload(a, b"after rekey a"));
        server.send(&data_payload(b, b"after rekey b"));
        server.expect(80);
        server.send(&[81]);
    });

    let a = conn.open_session().unwrap();
    let b = conn.open_session().unwrap();

    let session_id = conn.session_id().unwrap();
    thread::scope(|s| {
        let reader_a = s.spawn(|| a.read_data(TIMEOUT));
        let reader_b = s.spawn(|| b.read_data(TIMEOUT));
        let rekey = s.spawn(|| conn.rekey(TIMEOUT));

        rekey.join().unwrap().unwrap();
        assert_eq!(
            reader_a.join().unwrap().unwrap().unwrap(),
            Bytes::from_static(b"after rekey a")
        );
        assert_eq!(
            reader_b.join().unwrap().unwrap().unwrap(),
            Bytes::from_static(b"after rekey b")
        );
    });

    assert_eq!(conn.session_id().unwrap(), session_id);
    assert!(conn.global_request("check@fynx", &[], TIMEOUT).unwrap().is_some());
    server.join().unwrap();
}

#[test]
fn test_pump_answers_without_callers() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        server.send(
            &GlobalRequest {
                name: "keepalive@openssh.com".to_string(),
                want_reply: true,
                data: Bytes::new(),
            }
            .to_bytes(),
        );
        // Nobody on the client is waiting; the pump answers on its own
        server.expect(82);

        let id = server.confirm_open(32768, 32768);
        server.send(&data_payload(id, b"pumped"));
    });

    conn.start_pump().unwrap();
    assert!(matches!(conn.start_pump(), Err(FynxError::Config(_))));

    let channel = conn.open_session().unwrap();
    assert_eq!(
        channel.read_data(TIMEOUT).unwrap().unwrap(),
        Bytes::from_static(b"pumped")
    );
    server.join().unwrap();
}

#[test]
fn test_request_timeout_is_local() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        server.expect(80);
        server.expect(80);
        server.send(&[82]);
        server.send(&[81]);
    });

    let first = conn.global_request("slow@fynx", &[], Some(Duration::from_millis(100)));
    assert!(matches!(first, Err(FynxError::Timeout(_))));
    assert!(!conn.is_closed());

    // The failure answers the timed-out request and is skipped
    let second = conn.global_request("fast@fynx", &[], TIMEOUT).unwrap();
    assert_eq!(second, Some(Bytes::new()));
    server.join().unwrap();
}

#[test]
fn test_interleaved_traffic_reaches_each_waiter() {
    const CHANNELS: usize = 4;
    const ROUNDS: usize = 25;

    let (conn, server) = connect_default(|mut server: TestServer| {
        let ids: Vec<u32> = (0..CHANNELS)
            .map(|_| server.confirm_open(32768, 32768))
            .collect();
        for round in 0..ROUNDS {
            // Rotate the order so every channel sees its data interleaved
            for k in 0..CHANNELS {
                let id = ids[(round + k) % CHANNELS];
                server.send(&data_payload(id, format!("{}:{}", id, round).as_bytes()));
            }
            server.expect(80);
            server.send(&[81]);
        }
    });

    let channels: Vec<_> = (0..CHANNELS).map(|_| conn.open_session().unwrap()).collect();

    thread::scope(|s| {
        let readers: Vec<_> = channels
            .iter()
            .map(|channel| {
                s.spawn(move || {
                    (0..ROUNDS)
                        .map(|_| channel.read_data(TIMEOUT).unwrap().unwrap())
                        .collect::<Vec<Bytes>>()
                })
            })
            .collect();
        let requester = s.spawn(|| {
            (0..ROUNDS)
                .map(|_| conn.global_request("round@fynx", &[], TIMEOUT).unwrap())
                .filter(Option::is_some)
                .count()
        });

        for (channel, reader) in channels.iter().zip(readers) {
            let received = reader.join().unwrap();
            let expected: Vec<Bytes> = (0..ROUNDS)
                .map(|round| Bytes::from(format!("{}:{}", channel.local_id(), round)))
                .collect();
            assert_eq!(received, expected);
        }
        assert_eq!(requester.join().unwrap(), ROUNDS);
    });

    assert!(!conn.is_closed());
    assert!(channels.iter().all(|channel| channel.local_window() > 0));
    server.join().unwrap();
}

#[test]
fn test_disconnect_joins_pump() {
    let (conn, server) = connect_default(|mut server: TestServer| {
        server.expect(80);
        server.send(&[81]);
        server.expect(1);
    });

    conn.start_pump().unwrap();
    assert!(conn.global_request("pumped@fynx", &[], TIMEOUT).unwrap().is_some());

    conn.disconnect(DisconnectReason::ByApplication, "done").unwrap();
    // The pump thread has exited and released its share of the router
    assert_eq!(Arc::strong_count(conn.router()), 1);
    server.join().unwrap();
}
