use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use bytes::Bytes;
use hex_literal::hex;
use ring::hmac;

use crate::{
    chlo::tests::{client_hello, client_initial},
    CloseSource, ConnectionId, DispatcherConfig, HashedConnectionIdGenerator, ProcessError,
    RandomConnectionIdGenerator, ResetToken, SessionEvent, TransportErrorCode,
    DEFAULT_SUPPORTED_VERSIONS,
};

pub(crate) mod util;
use util::*;

fn established(odcid: &ConnectionId) -> TestDispatcher {
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    t.recv(initial(odcid, &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 1);
    t
}

#[test]
fn version_negotiate_unknown_version() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    let mut datagram = hex!("80 0a1a2a3a 04 00000000 04 11111111 00").to_vec();
    datagram.resize(1200, 0);
    let datagram = Bytes::from(datagram);
    t.recv(datagram.clone());

    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let vn = &sent[0];
    assert_ne!(vn[0] & 0x80, 0);
    assert_eq!(&vn[1..15], hex!("00000000 04 11111111 04 00000000"));
    let versions: Vec<u32> = vn[15..]
        .chunks(4)
        .map(|x| u32::from_be_bytes(x.try_into().unwrap()))
        .collect();
    assert!(DEFAULT_SUPPORTED_VERSIONS.iter().all(|v| versions.contains(v)));
    assert!(versions.contains(&0x0a1a_2a3a));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(t.dispatcher.is_in_time_wait(&ConnectionId::new(&[0; 4])));

    // Later packets for the same ID get the identical datagram, throttled
    let answered: Vec<Vec<Bytes>> = (0..5)
        .map(|_| {
            t.recv(datagram.clone());
            t.take_sent()
        })
        .collect();
    assert_eq!(answered[0], sent);
    assert!(answered[1].is_empty());
    assert_eq!(answered[2], sent);
    assert!(answered[3..].iter().all(|x| x.is_empty()));
    assert_eq!(t.dispatcher.stats().version_negotiations_sent, 1);
}

#[test]
fn version_negotiation_for_empty_cid_is_not_remembered() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    let mut datagram = hex!("80 0a1a2a3a 00 04 11111111 00").to_vec();
    datagram.resize(1200, 0);
    let datagram = Bytes::from(datagram);
    t.recv(datagram.clone());
    assert_eq!(t.take_sent().len(), 1);
    assert!(!t.dispatcher.is_in_time_wait(&ConnectionId::new(&[])));

    t.recv(datagram);
    assert_eq!(t.take_sent().len(), 1);
    assert_eq!(t.dispatcher.stats().version_negotiations_sent, 2);
}

#[test]
fn undersized_unknown_version_is_ignored() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.recv(hex!("80 0a1a2a3a 04 00000000 04 11111111 00")[..].to_vec().into());
    assert!(t.take_sent().is_empty());
    assert_eq!(t.dispatcher.last_error(), Some(&ProcessError::TooSmall));
}

#[test]
fn version_negotiation_is_never_answered() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    let mut datagram = hex!("80 00000000 08 0102030405060708 04 11111111 00000001").to_vec();
    datagram.resize(1200, 0);
    t.recv(datagram.into());
    assert!(t.take_sent().is_empty());
    assert_eq!(
        t.dispatcher.last_error(),
        Some(&ProcessError::VersionNegotiationPacket)
    );
}

#[test]
fn malformed_header_is_dropped() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.recv(hex!("c0 00000001 15")[..].to_vec().into());
    assert!(t.take_sent().is_empty());
    assert_matches!(t.dispatcher.last_error(), Some(ProcessError::Decode(_)));
    assert_eq!(t.dispatcher.stats().packets_dropped, 1);
}

#[test]
fn single_packet_chlo_creates_session() {
    let _guard = subscribe();
    let odcid = cid(0x10);
    let t = established(&odcid);

    let created = t.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].server_cid, odcid);
    assert_eq!(created[0].original_cid, odcid);
    assert_eq!(created[0].client_cid, cid(0xcc));
    assert_eq!(created[0].alpn.as_deref(), Some(&b"h3"[..]));
    assert_eq!(created[0].chlo.sni.as_deref(), Some("localhost"));
    assert_eq!(t.received_by(&odcid).len(), 1);
    assert!(!t.dispatcher.has_buffered_packets(&odcid));
    assert_eq!(t.dispatcher.stats().sessions_created, 1);
}

#[test]
fn fragments_then_chlo_are_delivered_in_order() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    let odcid = cid(0x11);
    let client = cid(0xcc);

    let first = long_packet(0xc0, &odcid, &client, FRAGMENT, 1200);
    let early = zero_rtt(&odcid, &client);
    let second = long_packet(0xc0, &odcid, &client, FRAGMENT, 1201);
    let last = initial(&odcid, &client, COMPLETE);
    for packet in [&first, &early, &second] {
        t.recv(packet.clone());
        assert_eq!(t.dispatcher.num_sessions(), 0);
    }
    assert!(t.dispatcher.has_buffered_packets(&odcid));
    assert!(!t.dispatcher.has_chlos_buffered());

    t.recv(last.clone());
    assert_eq!(t.dispatcher.num_sessions(), 1);
    assert!(t.created()[0].chlo.multi_packet);
    assert_eq!(t.received_by(&odcid), vec![last, first, early, second]);
    assert!(!t.dispatcher.has_buffered_packets(&odcid));
    assert!(t.take_sent().is_empty());
}

#[test]
fn live_session_traffic_bypasses_buffer_and_time_wait() {
    let _guard = subscribe();
    let odcid = cid(0x12);
    let mut t = established(&odcid);
    let before = t.dispatcher.stats();

    t.recv(short(&odcid, 100));
    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));
    assert_eq!(t.received_by(&odcid).len(), 3);
    assert_eq!(t.created().len(), 1);
    let stats = t.dispatcher.stats();
    assert_eq!(stats.packets_buffered, before.packets_buffered);
    assert_eq!(stats.packets_with_unknown_cid, before.packets_with_unknown_cid);
    assert!(t.take_sent().is_empty());
}

#[test]
fn session_budget_is_fifo() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(2);
    let ids: Vec<_> = (0x20..0x25).map(cid).collect();
    for id in &ids {
        t.recv(initial(id, &cid(0xcc), COMPLETE));
    }
    assert_eq!(t.dispatcher.num_sessions(), 2);
    assert!(t.dispatcher.has_chlos_buffered());

    // Joins the waiting ClientHello rather than starting over
    let straggler = short(&ids[3], 50);
    t.recv(straggler.clone());
    assert!(t.take_sent().is_empty());

    t.allow_sessions(2);
    assert_eq!(t.dispatcher.num_sessions(), 4);
    t.allow_sessions(2);
    assert_eq!(t.dispatcher.num_sessions(), 5);
    assert!(!t.dispatcher.has_chlos_buffered());

    let order: Vec<_> = t.created().iter().map(|s| s.original_cid).collect();
    assert_eq!(order, ids);
    let received = t.received_by(&ids[3]);
    assert_eq!(received.len(), 2);
    assert_eq!(received[1], straggler);
}

#[test]
fn unknown_short_header_gets_stateless_reset() {
    let _guard = subscribe();
    let key = Arc::new(hmac::Key::new(hmac::HMAC_SHA256, &[7; 64]));
    let mut config = DispatcherConfig::default();
    config.reset_key(key.clone());
    let mut t = TestDispatcher::with_config(config);

    let unknown = cid(0x30);
    t.recv(short(&unknown, 100));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let reset = &sent[0];
    assert!(reset.len() < 100);
    assert_eq!(reset[0] & 0xc0, 0x40);
    let token = ResetToken::new(&*key, &unknown);
    assert_eq!(&reset[reset.len() - 16..], &token[..]);
    assert_eq!(t.dispatcher.stats().stateless_resets_sent, 1);
    // No state is kept for the unknown connection
    assert!(!t.dispatcher.is_in_time_wait(&unknown));
}

#[test]
fn undersized_unversioned_packets_get_nothing() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    for size in 9..=22 {
        t.recv(short(&cid(0x31), size));
    }
    assert!(t.take_sent().is_empty());
    assert_eq!(t.dispatcher.last_error(), Some(&ProcessError::TooSmall));

    // Just large enough for a short header with an 8 byte ID and a minimal protected payload
    t.recv(short(&cid(0x31), 23));
    assert_eq!(t.take_sent().len(), 1);
}

#[test]
fn stateless_resets_are_rate_limited_per_peer() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.recv(short(&cid(0x32), 100));
    t.recv(short(&cid(0x33), 100));
    assert_eq!(t.take_sent().len(), 1);
    assert_eq!(
        t.dispatcher.last_error(),
        Some(&ProcessError::StatelessResetLimited)
    );

    let other_peer = "[::3]:7890".parse().unwrap();
    t.recv_from(other_peer, short(&cid(0x33), 100));
    assert_eq!(t.take_sent().len(), 1);

    assert_eq!(t.dispatcher.poll_timeout(), Some(t.time + Duration::from_secs(1)));
    t.advance(Duration::from_secs(1));
    t.recv(short(&cid(0x33), 100));
    assert_eq!(t.take_sent().len(), 1);
}

#[test]
fn recent_reset_addresses_are_capped() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config.max_recent_reset_addresses(2);
    let mut t = TestDispatcher::with_config(config);
    for port in 7000..7004 {
        let peer = format!("[::2]:{port}").parse().unwrap();
        t.recv_from(peer, short(&cid(0x34), 100));
    }
    assert_eq!(t.take_sent().len(), 2);
    assert_eq!(
        t.dispatcher.last_error(),
        Some(&ProcessError::StatelessResetLimited)
    );
}

#[test]
fn blocked_source_ports_are_dropped() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    for port in [53, 123, 11211] {
        let peer = format!("[::2]:{port}").parse().unwrap();
        t.recv_from(peer, initial(&cid(0x35), &cid(0xcc), COMPLETE));
        t.recv_from(peer, short(&cid(0x35), 100));
    }
    assert!(t.take_sent().is_empty());
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert_eq!(t.dispatcher.last_error(), Some(&ProcessError::BlockedPort));
}

#[test]
fn short_initial_cids_are_dropped() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    t.recv(initial(&ConnectionId::new(&[1; 4]), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert_eq!(
        t.dispatcher.last_error(),
        Some(&ProcessError::InvalidConnectionIdLength)
    );

    let mut config = DispatcherConfig::default();
    config.allow_short_initial_cids(true);
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);
    t.recv(initial(&ConnectionId::new(&[1; 4]), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 1);
}

#[test]
fn undersized_initial_is_dropped() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    t.recv(long_packet(0xc0, &cid(0x36), &cid(0xcc), COMPLETE, 1199));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(!t.dispatcher.has_buffered_packets(&cid(0x36)));
    assert!(t.take_sent().is_empty());

    let mut config = DispatcherConfig::default();
    config.validate_chlo_size(false);
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);
    t.recv(long_packet(0xc0, &cid(0x36), &cid(0xcc), COMPLETE, 1199));
    assert_eq!(t.dispatcher.num_sessions(), 1);
}

#[test]
fn unroutable_cids_are_dropped() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    t.log.lock().unwrap().unroutable.push(cid(0x37));
    t.recv(initial(&cid(0x37), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert_eq!(t.dispatcher.last_error(), Some(&ProcessError::Unroutable));
}

#[test]
fn rejected_connections_get_close_then_throttled_replays() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    t.dispatcher.stop_accepting_new_connections();
    let odcid = cid(0x40);
    let client = cid(0xcc);

    t.recv(initial(&odcid, &client, COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &odcid);
    assert_eq!(code, TransportErrorCode::CONNECTION_REFUSED);
    assert_eq!(reason, "Stop accepting new connections");
    {
        let log = t.log.lock().unwrap();
        assert_eq!(log.rejections, 1);
        assert_eq!(
            log.stateless_closes,
            vec![TransportErrorCode::CONNECTION_REFUSED]
        );
    }
    assert!(t.dispatcher.is_in_time_wait(&odcid));

    // Packets 2 through 8: answered on the 2nd, 4th and 8th
    let answered: Vec<usize> = (0..7)
        .map(|_| {
            t.recv(initial(&odcid, &client, COMPLETE));
            t.take_sent().len()
        })
        .collect();
    assert_eq!(answered, vec![1, 0, 1, 0, 0, 0, 1]);

    t.dispatcher.start_accepting_new_connections();
    t.recv(initial(&cid(0x41), &client, COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 1);
}

#[test]
fn rejected_unknown_version_replays_empty_version_negotiation() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.dispatcher.stop_accepting_new_connections();
    let mut datagram = hex!("80 0a1a2a3a 08 0102030405060708 04 11111111 00").to_vec();
    datagram.resize(1200, 0);
    let datagram = Bytes::from(datagram);

    t.recv(datagram.clone());
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        &sent[0][1..],
        hex!("00000000 04 11111111 08 0102030405060708")
    );
    t.recv(datagram);
    assert_eq!(t.take_sent(), sent);
    assert!(t.log.lock().unwrap().stateless_closes.is_empty());
}

#[test]
fn stop_accepting_discards_buffered_packets() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.recv(initial(&cid(0x42), &cid(0xcc), FRAGMENT));
    t.recv(initial(&cid(0x43), &cid(0xcc), COMPLETE));
    assert!(t.dispatcher.has_buffered_packets(&cid(0x42)));
    assert!(t.dispatcher.has_chlos_buffered());

    t.dispatcher.stop_accepting_new_connections();
    assert!(!t.dispatcher.is_accepting_new_connections());
    assert!(!t.dispatcher.has_buffered_packets(&cid(0x42)));
    assert!(!t.dispatcher.has_chlos_buffered());
    t.allow_sessions(16);
    assert_eq!(t.dispatcher.num_sessions(), 0);
}

#[test]
fn fatal_chlo_closes_with_tls_alert() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    let odcid = cid(0x44);
    t.recv(initial(&odcid, &cid(0xcc), FRAGMENT));
    t.recv(initial(&odcid, &cid(0xcc), BAD_CHLO));

    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(!t.dispatcher.has_buffered_packets(&odcid));
    assert!(t.dispatcher.is_in_time_wait(&odcid));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &odcid);
    assert_eq!(code, TransportErrorCode::crypto(50));
    assert_eq!(u64::from(code), 0x132);
    assert_eq!(
        reason,
        "TLS handshake failure from dispatcher (ENCRYPTION_INITIAL) 50: DecodeError"
    );
    assert_eq!(
        t.log.lock().unwrap().stateless_closes,
        vec![TransportErrorCode::crypto(50)]
    );
}

#[test]
fn replacement_cid_aliases_original() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config.cid_generator(|| Box::new(HashedConnectionIdGenerator::from_key(42)));
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);
    let odcid = cid(0x50);
    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));

    let created = t.created();
    assert_eq!(created.len(), 1);
    let server_cid = created[0].server_cid;
    assert_ne!(server_cid, odcid);
    assert!(HashedConnectionIdGenerator::from_key(42).validate(&server_cid));

    t.recv(short(&server_cid, 60));
    t.recv(initial(&odcid, &cid(0xcc), FRAGMENT));
    assert_eq!(t.received_by(&server_cid).len(), 3);

    let (handle, _) = t.dispatcher.sessions().next().unwrap();
    let ids = t.dispatcher.connection_ids(handle).to_vec();
    assert_eq!(ids, vec![server_cid, odcid]);

    t.push_event(
        server_cid,
        SessionEvent::Closed {
            code: TransportErrorCode::NO_ERROR,
            reason: String::new(),
            source: CloseSource::Peer,
        },
    );
    t.recv(short(&server_cid, 60));
    assert!(t.dispatcher.is_in_time_wait(&server_cid));
    assert!(t.dispatcher.is_in_time_wait(&odcid));
    assert_eq!(t.dispatcher.num_sessions(), 0);
}

#[test]
fn cid_collision_refuses_second_connection() {
    let _guard = subscribe();
    let shared = cid(0x60);
    let mut config = DispatcherConfig::default();
    config.cid_generator(move || Box::new(FixedReplacement(shared)));
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);

    t.recv(initial(&cid(0x61), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 1);
    let second = cid(0x62);
    t.recv(initial(&second, &cid(0xcd), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 1);
    assert_eq!(t.dispatcher.last_error(), Some(&ProcessError::CidCollision));
    assert_eq!(t.dispatcher.stats().cid_collisions, 1);
    assert!(t.dispatcher.is_in_time_wait(&second));

    t.recv(initial(&second, &cid(0xcd), COMPLETE));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &second);
    assert_eq!(code, TransportErrorCode::CONNECTION_REFUSED);
    assert_eq!(reason, "Connection ID collision, please retry");
}

#[test]
fn failed_session_creation_is_survivable() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(1);
    t.log.lock().unwrap().fail_creation = true;
    t.recv(initial(&cid(0x63), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert_eq!(
        t.dispatcher.last_error(),
        Some(&ProcessError::SessionCreationFailed)
    );

    // The failed attempt used up the budget
    t.log.lock().unwrap().fail_creation = false;
    t.recv(initial(&cid(0x64), &cid(0xcc), COMPLETE));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(t.dispatcher.has_chlos_buffered());
}

#[test]
fn peer_close_defers_deletion_and_resets_stragglers() {
    let _guard = subscribe();
    let odcid = cid(0x70);
    let mut t = established(&odcid);
    t.log.lock().unwrap().handshake_complete = true;
    t.push_event(
        odcid,
        SessionEvent::Closed {
            code: TransportErrorCode::NO_ERROR,
            reason: "bye".into(),
            source: CloseSource::Peer,
        },
    );
    t.recv(short(&odcid, 100));
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(t.dispatcher.is_in_time_wait(&odcid));

    // Destroyed only once the deletion deadline fires
    assert!(t.log.lock().unwrap().dropped.is_empty());
    assert_eq!(t.dispatcher.poll_timeout(), Some(t.time));
    t.advance(Duration::ZERO);
    assert_eq!(t.log.lock().unwrap().dropped, vec![odcid]);

    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));
    assert!(t.take_sent().is_empty());
    t.recv(short(&odcid, 100));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].len() < 100);
    assert_eq!(t.created().len(), 1);
}

#[test]
fn local_close_before_handshake_synthesizes_close() {
    let _guard = subscribe();
    let odcid = cid(0x71);
    let mut t = established(&odcid);
    t.push_event(
        odcid,
        SessionEvent::Closed {
            code: TransportErrorCode::INTERNAL_ERROR,
            reason: String::new(),
            source: CloseSource::Local,
        },
    );
    t.recv(short(&odcid, 100));
    assert!(t.take_sent().is_empty());

    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &odcid);
    assert_eq!(code, TransportErrorCode::PROTOCOL_VIOLATION);
    assert_eq!(
        reason,
        "Connection is closed by server before handshake confirmed"
    );
}

#[test]
fn session_termination_packets_are_replayed() {
    let _guard = subscribe();
    let odcid = cid(0x72);
    let mut t = established(&odcid);
    t.log.lock().unwrap().termination_packets = vec![Bytes::from_static(b"goodbye")];
    t.push_event(
        odcid,
        SessionEvent::Closed {
            code: TransportErrorCode::APPLICATION_ERROR,
            reason: String::new(),
            source: CloseSource::Local,
        },
    );
    t.recv(short(&odcid, 100));
    t.recv(short(&odcid, 100));
    assert_eq!(t.take_sent(), vec![Bytes::from_static(b"goodbye")]);
}

#[test]
fn time_wait_entries_expire() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config.time_wait_period(Duration::from_secs(10));
    let mut t = TestDispatcher::with_config(config);
    t.dispatcher.stop_accepting_new_connections();
    t.recv(initial(&cid(0x73), &cid(0xcc), COMPLETE));
    assert!(t.dispatcher.is_in_time_wait(&cid(0x73)));
    t.advance(Duration::from_secs(10));
    assert!(!t.dispatcher.is_in_time_wait(&cid(0x73)));
    assert_eq!(t.dispatcher.poll_timeout(), None);
}

#[test]
fn connection_id_events_update_routing() {
    let _guard = subscribe();
    let odcid = cid(0x80);
    let mut t = established(&odcid);
    let issued = cid(0x81);
    t.push_event(odcid, SessionEvent::NewConnectionId(issued));
    t.recv(short(&odcid, 60));
    t.recv(short(&issued, 60));
    assert_eq!(t.received_by(&odcid).len(), 3);
    assert!(t.take_sent().is_empty());

    t.push_event(odcid, SessionEvent::RetireConnectionId(issued));
    t.recv(short(&odcid, 60));
    t.recv(short(&issued, 60));
    assert_eq!(t.received_by(&odcid).len(), 4);
    // Unknown again, so answered with a reset
    assert_eq!(t.take_sent().len(), 1);
}

#[test]
fn connection_id_owned_by_another_session_is_rejected() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    let (a, b) = (cid(0x82), cid(0x83));
    t.recv(initial(&a, &cid(0xcc), COMPLETE));
    t.recv(initial(&b, &cid(0xcd), COMPLETE));
    t.push_event(a, SessionEvent::NewConnectionId(b));
    t.recv(short(&a, 60));
    assert_eq!(t.log.lock().unwrap().rejected_cids, vec![b]);
    t.recv(short(&b, 60));
    assert_eq!(t.received_by(&b).len(), 2);
}

#[test]
fn write_blocked_writers_resume_in_order() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    let (a, b) = (cid(0x90), cid(0x91));
    t.recv(initial(&a, &cid(0xcc), COMPLETE));
    t.recv(initial(&b, &cid(0xcd), COMPLETE));
    t.log.lock().unwrap().echo = true;
    t.block_writes();

    t.recv(short(&b, 60));
    t.recv(short(&a, 60));
    t.recv(short(&b, 60));
    // A time-wait response queued behind them
    t.recv(short(&cid(0x92), 100));
    assert!(t.dispatcher.has_pending_writes());
    assert!(t.take_sent().is_empty());

    t.dispatcher.on_can_write(t.time);
    assert_eq!(t.log.lock().unwrap().can_write, vec![b, a]);
    assert!(!t.dispatcher.has_pending_writes());
    assert_eq!(t.take_sent().len(), 4);

    // Writers blocking again wait for the next notification
    t.block_writes();
    t.recv(short(&a, 60));
    assert!(t.dispatcher.has_pending_writes());
    t.dispatcher.on_can_write(t.time);
    assert_eq!(t.log.lock().unwrap().can_write, vec![b, a, a]);
}

#[test]
fn shutdown_closes_every_session() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    t.allow_sessions(16);
    let (a, b) = (cid(0xa0), cid(0xa1));
    t.recv(initial(&a, &cid(0xcc), COMPLETE));
    t.recv(initial(&b, &cid(0xcd), COMPLETE));
    // One session never reports its closure
    t.log.lock().unwrap().ignore_close = true;

    t.dispatcher.shutdown(t.time);
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert_eq!(t.dispatcher.num_time_wait_connections(), 2);
    let log = t.log.lock().unwrap();
    assert_eq!(log.closed.len(), 2);
    assert!(log
        .closed
        .iter()
        .all(|(_, code, reason)| *code == TransportErrorCode::NO_ERROR
            && reason == "Server shutdown imminent"));
    assert_eq!(log.dropped.len(), 2);
}

#[test]
fn buffered_packets_expire_into_time_wait() {
    let _guard = subscribe();
    let mut t = TestDispatcher::new();
    let odcid = cid(0xb0);
    t.recv(initial(&odcid, &cid(0xcc), FRAGMENT));
    assert_eq!(
        t.dispatcher.poll_timeout(),
        Some(t.time + Duration::from_secs(5))
    );
    t.advance(Duration::from_secs(5));
    assert!(!t.dispatcher.has_buffered_packets(&odcid));
    assert!(t.dispatcher.is_in_time_wait(&odcid));

    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &odcid);
    assert_eq!(code, TransportErrorCode::PROTOCOL_VIOLATION);
    assert_eq!(reason, "Packets buffered for too long");
}

#[test]
fn chlo_buffering_disabled_creates_session_immediately() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config.buffer_chlos(false);
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);
    t.recv(initial(&cid(0xb1), &cid(0xcc), FRAGMENT));
    assert_eq!(t.dispatcher.num_sessions(), 1);
    assert_eq!(t.created()[0].chlo, Default::default());
    assert_eq!(t.created()[0].alpn, None);
}

#[test]
fn fixed_short_header_cid_len_fallback() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config
        .cid_generator(|| Box::new(RandomConnectionIdGenerator::new(4)))
        .fixed_short_header_cid_len(Some(8));
    let mut t = TestDispatcher::with_config(config);
    t.allow_sessions(16);
    let odcid = cid(0xb2);
    t.recv(initial(&odcid, &cid(0xcc), COMPLETE));
    let server_cid = t.created()[0].server_cid;
    assert_eq!(server_cid.len(), 4);

    // Parsed with 4 byte IDs this matches nothing; the fixed length finds the original ID
    t.recv(short(&odcid, 60));
    assert_eq!(t.received_by(&server_cid).len(), 2);
    assert!(t.take_sent().is_empty());
}

#[test]
fn tls_chlo_across_two_datagrams() {
    let _guard = subscribe();
    let mut config = DispatcherConfig::default();
    config.alpn_protocols(vec![b"h3".to_vec()]);
    let mut t = TestDispatcher::with_tls(config);
    t.allow_sessions(16);

    let odcid = ConnectionId::new(&hex!("8394c8f03e515708"));
    let client = cid(0xcc);
    let chlo = client_hello(Some("example.com"), &[b"hq-interop", b"h3"], false);
    let split = chlo.len() / 2;
    let first = client_initial(&odcid, &client, 0, 0, &chlo[..split], 1200);
    let second = client_initial(&odcid, &client, 1, split as u64, &chlo[split..], 1200);

    t.recv(first.into());
    assert_eq!(t.dispatcher.num_sessions(), 0);
    assert!(t.dispatcher.has_buffered_packets(&odcid));
    t.recv(second.into());
    assert_eq!(t.dispatcher.num_sessions(), 1);

    let created = t.created();
    assert_eq!(created[0].chlo.sni.as_deref(), Some("example.com"));
    assert_eq!(created[0].alpn.as_deref(), Some(&b"h3"[..]));
    assert!(created[0].chlo.multi_packet);
    assert_eq!(t.received_by(&odcid).len(), 2);
}

#[test]
fn tls_chlo_with_wrong_message_is_refused() {
    let _guard = subscribe();
    let mut t = TestDispatcher::with_tls(DispatcherConfig::default());
    t.allow_sessions(16);
    let odcid = cid(0xb3);
    let mut msg = client_hello(None, &[], false);
    msg[0] = 2;
    t.recv(client_initial(&odcid, &cid(0xcc), 0, 0, &msg, 1200).into());

    assert_eq!(t.dispatcher.num_sessions(), 0);
    let sent = t.take_sent();
    assert_eq!(sent.len(), 1);
    let (code, reason) = open_close(&sent[0], &odcid);
    assert_eq!(code.tls_alert(), Some(10));
    assert!(reason.ends_with("10: UnexpectedMessage"));
}
