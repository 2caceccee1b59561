mod common;

use common::*;
use sorng_openvpn_proto::openvpn::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PUSH: &str = "PUSH_REPLY,route-gateway 10.8.0.1,topology subnet,\
    ifconfig 10.8.0.2 255.255.255.0,redirect-gateway def1,dhcp-option DNS 10.8.0.1,\
    peer-id 5,auth-token SESS_abcdef";

fn manual_session(clock: &ManualClock) -> Session {
    Session::new(
        Configuration::default(),
        Some(Credentials::basic("bob", "hunter2")),
        Arc::new(TestProvider),
    )
    .with_clock(Arc::new(clock.clone()))
    .with_prng(Arc::new(SequencePrng::default()))
}

/// Walk `session` up to the point where it has sent its first PUSH_REQUEST.
async fn until_push_request(session: &mut Session, server: &MemoryLink) {
    for (pid, code, payload) in [
        (0, Opcode::HardResetServerV2, Vec::new()),
        (1, Opcode::ControlV1, SERVER_HELLO.to_vec()),
        (2, Opcode::ControlV1, auth_reply()),
    ] {
        session
            .receive_link(vec![control(code, 0, pid, &payload)])
            .await
            .unwrap();
    }
    let sent = decode_control(&drain(server).await);
    assert!(sent
        .iter()
        .any(|p| p.payload.starts_with(b"PUSH_REQUEST")));
}

// ── control channel ─────────────────────────────────────────────────

#[test]
fn test_duplicate_packet_delivered_once_acked_twice() {
    let mut channel = ControlChannel::new(Box::new(PlainSerializer), 1000, 50);
    channel.reset(&SequencePrng::default(), true).unwrap();

    let packet = ControlPacket::new(Opcode::ControlV1, 0, SERVER_SID, 0, b"hello".to_vec());
    let mut deliveries = 0;
    let mut acks = Vec::new();
    for _ in 0..2 {
        let decoded = channel.read_inbound(&packet.encode()).unwrap();
        acks.push(
            channel
                .write_acks(decoded.key, vec![decoded.packet_id], decoded.session_id)
                .unwrap(),
        );
        deliveries += channel.enqueue_inbound(decoded).len();
    }
    assert_eq!(deliveries, 1);
    assert_eq!(acks.len(), 2);
    for raw in &acks {
        let ack = ControlPacket::decode(raw).unwrap();
        assert_eq!(ack.code, Opcode::AckV1);
        assert_eq!(ack.ack_ids, vec![0]);
        assert_eq!(ack.ack_remote_session_id, Some(SERVER_SID));
    }
}

#[test]
fn test_out_of_order_packets_delivered_in_order() {
    let mut channel = ControlChannel::new(Box::new(PlainSerializer), 1000, 50);
    channel.reset(&SequencePrng::default(), true).unwrap();

    let second = ControlPacket::new(Opcode::ControlV1, 0, SERVER_SID, 1, b"b".to_vec());
    let first = ControlPacket::new(Opcode::ControlV1, 0, SERVER_SID, 0, b"a".to_vec());
    assert!(channel.enqueue_inbound(second).is_empty());
    let delivered = channel.enqueue_inbound(first);
    let payloads: Vec<&[u8]> = delivered.iter().map(|p| p.payload.as_slice()).collect();
    assert_eq!(payloads, vec![b"a".as_slice(), b"b".as_slice()]);
}

#[test]
fn test_retransmission_is_bounded() {
    let mut channel = ControlChannel::new(Box::new(PlainSerializer), 1000, 3);
    channel.reset(&SequencePrng::default(), true).unwrap();
    channel
        .enqueue_outbound(Opcode::HardResetClientV2, 0, &[])
        .unwrap();

    let start = Instant::now();
    let step = Duration::from_millis(100);
    assert_eq!(channel.write_outbound(start, step).unwrap().len(), 1);
    for i in 1..=3 {
        assert_eq!(channel.write_outbound(start + step * i, step).unwrap().len(), 1);
    }
    let err = channel.write_outbound(start + step * 4, step).unwrap_err();
    assert_eq!(err.kind, OpenVpnErrorKind::Timeout);
}

// ── session ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_push_request_retries_end_in_timeout() {
    let clock = ManualClock::new();
    let mut session = manual_session(&clock);
    let (client, server) = MemoryLink::pair(true);
    session.start_negotiation(Arc::new(client)).await.unwrap();
    drain(&server).await;
    until_push_request(&mut session, &server).await;

    let max = ConnectionOptions::default().max_push_requests;
    let mut requests = 1;
    let mut outcome = None;
    for _ in 0..(max * 2) {
        clock.advance(ConnectionOptions::default().push_request_interval);
        match session.tick().await {
            Ok(()) => {
                requests += decode_control(&drain(&server).await)
                    .iter()
                    .filter(|p| p.payload.starts_with(b"PUSH_REQUEST"))
                    .count() as u32;
            }
            Err(e) => {
                outcome = Some(e);
                break;
            }
        }
    }
    let err = outcome.expect("negotiation never gave up");
    assert_eq!(err.kind, OpenVpnErrorKind::Timeout);
    assert_eq!(requests, max);
}

#[tokio::test]
async fn test_session_end_to_end() {
    let session = Session::new(
        Configuration::builder()
            .no_pull_mask(vec![PullCategory::Dns])
            .build(),
        Some(Credentials::basic("bob", "hunter2")),
        Arc::new(TestProvider),
    );
    let (client, server) = MemoryLink::pair(true);
    let (tunnel, os) = MemoryLink::pair(true);
    let (handle, mut events) = SessionHandle::spawn(session, Arc::new(client), Arc::new(tunnel));

    let hello = decode_control(&Link::read_packets(&server).await.unwrap());
    assert_eq!(hello[0].code, Opcode::HardResetClientV2);
    Link::write_packets(
        &server,
        vec![
            control(Opcode::HardResetServerV2, 0, 0, &[]),
            control(Opcode::ControlV1, 0, 1, SERVER_HELLO),
            control(Opcode::ControlV1, 0, 2, &auth_reply()),
            control(Opcode::ControlV1, 0, 3, &message(PUSH)),
        ],
    )
    .await
    .unwrap();

    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(started.session_id, handle.id());
    let SessionEventKind::Started { remote, modules } = started.kind else {
        panic!("expected Started first");
    };
    assert_eq!(remote, "memory");
    assert!(modules.dns.is_none());
    let v4 = modules.ip.unwrap().ipv4.unwrap();
    assert_eq!(v4.subnet.to_string(), "10.8.0.2/24");
    assert_eq!(v4.included_routes[0].to_string(), "default via 10.8.0.1");

    // Tunnel -> link.
    Tunnel::write_packets(&os, vec![b"outbound".to_vec()]).await.unwrap();
    let framed = loop {
        let raw = Link::read_packets(&server).await.unwrap();
        if let Some(data) = raw.into_iter().find(|p| p[0] == 0x48) {
            break data;
        }
    };
    assert_eq!(&framed[1..4], &[0, 0, 5]);
    assert_eq!(&framed[4..], b"outbound");

    // Link -> tunnel.
    let mut inbound = vec![0x48, 0, 0, 5];
    inbound.extend_from_slice(b"inbound");
    Link::write_packets(&server, vec![inbound]).await.unwrap();
    let delivered = tokio::time::timeout(Duration::from_secs(5), Tunnel::read_packets(&os))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, vec![b"inbound".to_vec()]);

    handle.shutdown().await.unwrap();
    let stopped = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SessionEventKind::Stopped { error } = event.kind {
            break error;
        }
    };
    assert!(stopped.is_none());
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_session_over_obfuscated_link() {
    let method = XorMethod::XorMask(b"mask".to_vec());
    let session = Session::new(
        Configuration::builder().xor_method(method.clone()).build(),
        Some(Credentials::basic("bob", "hunter2")),
        Arc::new(TestProvider),
    );
    let (client, server) = MemoryLink::pair(true);
    let (tunnel, _os) = MemoryLink::pair(true);
    let server = XorLink::wrap(Arc::new(server), Some(&method));
    let (handle, mut events) = SessionHandle::spawn(session, Arc::new(client), Arc::new(tunnel));

    let hello = decode_control(&server.read_packets().await.unwrap());
    assert_eq!(hello[0].code, Opcode::HardResetClientV2);
    server
        .write_packets(vec![
            control(Opcode::HardResetServerV2, 0, 0, &[]),
            control(Opcode::ControlV1, 0, 1, SERVER_HELLO),
            control(Opcode::ControlV1, 0, 2, &auth_reply()),
            control(Opcode::ControlV1, 0, 3, &message(PUSH)),
        ])
        .await
        .unwrap();

    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(started.kind, SessionEventKind::Started { .. }));
    handle.shutdown().await.unwrap();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_server_reset_surfaces_stale_session() {
    let session = Session::new(
        Configuration::default(),
        Some(Credentials::basic("bob", "hunter2")),
        Arc::new(TestProvider),
    );
    let (client, server) = MemoryLink::pair(true);
    let (tunnel, _os) = MemoryLink::pair(true);
    let (handle, mut events) = SessionHandle::spawn(session, Arc::new(client), Arc::new(tunnel));

    Link::read_packets(&server).await.unwrap();
    Link::write_packets(
        &server,
        vec![
            control(Opcode::HardResetServerV2, 0, 0, &[]),
            control(Opcode::ControlV1, 0, 1, SERVER_HELLO),
            control(Opcode::ControlV1, 0, 2, &auth_reply()),
            control(Opcode::ControlV1, 0, 3, &message(PUSH)),
        ],
    )
    .await
    .unwrap();
    let started = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(started.kind, SessionEventKind::Started { .. }));

    Link::write_packets(&server, vec![control(Opcode::HardResetServerV2, 0, 4, &[])])
        .await
        .unwrap();
    let error = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let SessionEventKind::Stopped { error } = event.kind {
            break error;
        }
    };
    assert_eq!(error.unwrap().kind, OpenVpnErrorKind::StaleSession);
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_event_serialization() {
    let clock = ManualClock::new();
    let mut session = manual_session(&clock);
    session.shutdown(None).await;
    let (client, _server) = MemoryLink::pair(true);
    session.start_negotiation(Arc::new(client)).await.unwrap();
    session.shutdown(None).await;

    let events = session.take_events();
    assert_eq!(events.len(), 1);
    let json = serde_json::to_value(&events[0]).unwrap();
    assert_eq!(json["type"], "stopped");
    assert_eq!(json["session_id"], session.id().to_string());
    let back: SessionEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, events[0]);
}
