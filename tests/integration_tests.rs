//! Integration tests for RigelNet
//!
//! These tests run real servers and clients over localhost UDP.

use rigelnet_core::node::{
    NodeConfig, NodeExt, NodeInterface, Recipient, UdpClient, UdpServer, UnknownHandlerPolicy,
    UpdateMode,
};
use rigelnet_core::{
    ConnectFailReason, ConnectorStatus, DisconnectReason, Event, HandlerRegistry, Packet,
};
use rigelnet_integration_tests::fixtures::{ClientServerFixture, Inbox, test_registry};
use rigelnet_integration_tests::test_helpers::{ci_timeout, init_tracing};
use rigelnet_transport::{Transport, UdpTransport};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn count(events: &[Event], pred: impl Fn(&Event) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_beetlejuice_handshake() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    assert!(
        fixture
            .server_events
            .contains(&Event::Connected { client_index: Some(0) })
    );
    assert_eq!(fixture.client_events[0], vec![Event::Connected { client_index: None }]);
    assert_eq!(fixture.clients[0].client_index(), Some(0));
    assert_eq!(
        fixture.server.client_connector(0).map(|c| c.status()),
        Some(ConnectorStatus::Connected)
    );
}

/// Alternate Receive and Send on both nodes once, then sleep 25 ms.
fn lockstep_cycle(
    server: &mut UdpServer,
    client: &mut UdpClient,
    server_events: &mut Vec<Event>,
    client_events: &mut Vec<Event>,
) {
    server.update(UpdateMode::Receive);
    client.update(UpdateMode::Receive);
    server_events.extend(std::iter::from_fn(|| server.poll_event()));
    client_events.extend(std::iter::from_fn(|| client.poll_event()));
    server.update(UpdateMode::Send);
    client.update(UpdateMode::Send);
    std::thread::sleep(Duration::from_millis(25));
}

#[test]
fn test_localhost_session_within_twenty_cycles() {
    init_tracing();
    let registry = Arc::new(test_registry());
    let mut server = UdpServer::new(NodeConfig::with_passphrase("beetlejuice"), 1, Arc::clone(&registry)).unwrap();
    server.start(0).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut client = UdpClient::new(NodeConfig::with_passphrase("beetlejuice"), registry).unwrap();
    client.connect(0, "localhost", port).unwrap();

    let mut server_events = Vec::new();
    let mut client_events = Vec::new();
    for _ in 0..20 {
        lockstep_cycle(&mut server, &mut client, &mut server_events, &mut client_events);
        if client.status() == ConnectorStatus::Connected && server.connected_count() == 1 {
            break;
        }
    }
    assert_eq!(client.status(), ConnectorStatus::Connected);
    assert_eq!(server.connected_count(), 1);
    assert_eq!(server_events, vec![Event::Connected { client_index: Some(0) }]);
    assert_eq!(client_events, vec![Event::Connected { client_index: None }]);

    client.disconnect(true);
    client_events.clear();
    client_events.extend(std::iter::from_fn(|| client.poll_event()));
    assert!(matches!(client_events.as_slice(), [Event::Disconnected { .. }]));
    client_events.clear();
    for _ in 0..20 {
        lockstep_cycle(&mut server, &mut client, &mut server_events, &mut client_events);
        if server.connected_count() == 0 {
            break;
        }
    }
    assert_eq!(server.connected_count(), 0);
    assert_eq!(server_events.len(), 2);
    assert!(matches!(
        server_events[1],
        Event::Disconnected {
            client_index: Some(0),
            reason: DisconnectReason::Graceful,
            ..
        }
    ));
    // Both queues stay quiet afterwards.
    for _ in 0..3 {
        lockstep_cycle(&mut server, &mut client, &mut server_events, &mut client_events);
    }
    assert_eq!(server_events.len(), 2);
    assert!(client_events.is_empty());
}

#[test]
fn test_bad_passphrase_rejected() {
    let mut fixture = ClientServerFixture::builder()
        .client_config(NodeConfig::with_passphrase("betelgeuse"))
        .build();
    fixture.connect(0);

    let rejected = fixture.run_until(Duration::from_secs(2), |f| !f.client_events[0].is_empty());
    assert!(rejected, "client was never rejected");

    assert_eq!(
        fixture.client_events[0],
        vec![Event::BadPassphrase {
            client_index: None,
            passphrase: "betelgeuse".to_string(),
        }]
    );
    fixture.run_for(Duration::from_millis(100));
    assert_eq!(
        fixture.server_events,
        vec![Event::BadPassphrase {
            client_index: Some(0),
            passphrase: "betelgeuse".to_string(),
        }]
    );
    assert_eq!(fixture.server.connected_count(), 0);
    assert_eq!(fixture.clients[0].status(), ConnectorStatus::Disconnected);
    assert!(!fixture.clients[0].is_running());
}

#[test]
fn test_server_full() {
    let mut fixture = ClientServerFixture::builder().capacity(1).clients(2).build();
    fixture.connect(0);
    assert!(fixture.run_until(Duration::from_secs(2), |f| f.server.connected_count() == 1));

    fixture.connect(1);
    let rejected = fixture.run_until(Duration::from_secs(2), |f| !f.client_events[1].is_empty());
    assert!(rejected);
    assert_eq!(
        fixture.client_events[1],
        vec![Event::ConnectAttemptFailed {
            client_index: None,
            reason: ConnectFailReason::ServerFull,
        }]
    );
    assert!(!fixture.clients[1].is_running());

    // The established client is unaffected
    assert_eq!(fixture.clients[0].status(), ConnectorStatus::Connected);
}

#[test]
fn test_connect_attempt_times_out() {
    // A bound socket that never answers
    let silent = UdpTransport::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let target = silent.local_addr().unwrap();

    let mut config = NodeConfig::with_passphrase("beetlejuice");
    config.timeout_limit = Duration::from_millis(200);
    let mut client = UdpClient::new(config, Arc::new(test_registry())).unwrap();
    client.connect_addr(0, target).unwrap();

    let deadline = Instant::now() + ci_timeout(Duration::from_secs(2));
    let mut events = Vec::new();
    while events.is_empty() && Instant::now() < deadline {
        client.update(UpdateMode::Receive);
        client.update(UpdateMode::Send);
        while let Some(event) = client.poll_event() {
            events.push(event);
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(
        events,
        vec![Event::ConnectAttemptFailed {
            client_index: None,
            reason: ConnectFailReason::TimedOut,
        }]
    );
    assert_eq!(client.status(), ConnectorStatus::Disconnected);
}

#[test]
fn test_reconnect_reuses_slot() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    fixture.clients[0].disconnect(true);
    assert!(fixture.run_until(Duration::from_secs(2), |f| f.server.connected_count() == 0));

    fixture.client_events[0].clear();
    fixture.establish();
    assert_eq!(fixture.clients[0].client_index(), Some(0));
}

// ============================================================================
// Delivery
// ============================================================================

#[test]
fn test_reliable_delivery_in_order() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    for i in 0..100u32 {
        fixture.clients[0].compose(0, "number", &i);
    }
    let delivered = fixture.run_until(Duration::from_secs(5), |f| f.server_inbox().numbers.len() >= 100);
    assert!(delivered);
    assert_eq!(fixture.server_inbox().numbers, (0..100).collect::<Vec<_>>());
}

#[test]
fn test_echo_uses_sender_index() {
    let mut fixture = ClientServerFixture::builder().clients(2).build();
    fixture.establish();

    fixture.clients[1].compose(0, "echo", "hello");
    let echoed = fixture.run_until(Duration::from_secs(2), |f| !f.client_inbox(1).texts.is_empty());
    assert!(echoed);

    assert_eq!(fixture.client_inbox(1).texts, vec![(None, "echo: hello".to_string())]);
    assert!(fixture.client_inbox(0).texts.is_empty());
}

#[test]
fn test_server_sees_sender_slot() {
    let mut fixture = ClientServerFixture::builder().clients(2).build();
    fixture.establish();
    let slot = fixture.clients[1].client_index().unwrap();

    fixture.clients[1].compose(0, "text", "from one");
    assert!(fixture.run_until(Duration::from_secs(2), |f| !f.server_inbox().texts.is_empty()));
    assert_eq!(
        fixture.server_inbox().texts,
        vec![(Some(slot), "from one".to_string())]
    );
}

#[test]
fn test_broadcast_reaches_every_client() {
    let mut fixture = ClientServerFixture::builder().clients(3).build();
    fixture.establish();

    fixture.server.compose(Recipient::All, "text", "everyone");
    let delivered = fixture.run_until(Duration::from_secs(2), |f| {
        (0..3).all(|i| !f.client_inbox(i).texts.is_empty())
    });
    assert!(delivered);
    for i in 0..3 {
        assert_eq!(fixture.client_inbox(i).texts, vec![(None, "everyone".to_string())]);
    }
}

#[test]
fn test_delivery_under_heavy_loss() {
    let mut fixture = ClientServerFixture::builder()
        .timeout(Duration::from_secs(30))
        .loss(0.3, 0x5eed)
        .build();
    fixture.establish();

    for i in 0..50u32 {
        fixture.clients[0].compose(0, "number", &i);
        fixture.server.compose(0, "number", &(1000 + i));
    }
    let delivered = fixture.run_until(Duration::from_secs(20), |f| {
        f.server_inbox().numbers.len() >= 50 && f.client_inbox(0).numbers.len() >= 50
    });
    assert!(delivered, "messages were not delivered through 30% loss");

    // Keep cycling so retransmissions of already-delivered slots arrive
    fixture.run_for(Duration::from_millis(200));

    assert_eq!(fixture.server_inbox().numbers, (0..50).collect::<Vec<_>>());
    assert_eq!(fixture.client_inbox(0).numbers, (1000..1050).collect::<Vec<_>>());
    assert_eq!(fixture.clients[0].status(), ConnectorStatus::Connected);
}

#[test]
fn test_fragmented_blob_under_loss() {
    let mut fixture = ClientServerFixture::builder()
        .timeout(Duration::from_secs(30))
        .loss(0.2, 0xb10b)
        .build();
    fixture.establish();

    // Several times the 1200-byte packet limit, each way.
    let upload: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
    let download: Vec<u8> = (0..3700u32).map(|i| (i % 7) as u8).collect();
    fixture.clients[0].compose(0, "number", &1u32);
    fixture.clients[0].compose(0, "blob", &upload);
    fixture.clients[0].compose(0, "number", &2u32);
    fixture.server.compose(0, "blob", &download);

    let delivered = fixture.run_until(Duration::from_secs(20), |f| {
        f.server_inbox().numbers.len() >= 2 && !f.client_inbox(0).blobs.is_empty()
    });
    assert!(delivered, "fragmented messages were not delivered through 20% loss");
    fixture.run_for(Duration::from_millis(200));

    assert_eq!(fixture.server_inbox().blobs, vec![upload]);
    assert_eq!(fixture.server_inbox().numbers, vec![1, 2]);
    assert_eq!(fixture.client_inbox(0).blobs, vec![download]);
    assert_eq!(fixture.clients[0].status(), ConnectorStatus::Connected);
}

#[test]
fn test_transport_stats_exposed() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    let server = fixture.server.transport_stats().unwrap();
    let client = fixture.clients[0].transport_stats().unwrap();
    assert!(server.packets_received > 0);
    assert!(client.packets_received > 0);
    assert_eq!(server.send_errors + server.recv_errors, 0);

    fixture.clients[0].disconnect(true);
    assert!(fixture.clients[0].transport_stats().is_none());
}

#[test]
fn test_unsafe_delivery() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    fixture.clients[0].compose(0, "number", &1u32);
    fixture.clients[0].compose_unsafe(0, "number", &2u32);
    let delivered = fixture.run_until(Duration::from_secs(2), |f| f.server_inbox().numbers.len() >= 2);
    assert!(delivered);

    // Within one send cycle reliable payloads travel first
    assert_eq!(fixture.server_inbox().numbers, vec![1, 2]);
}

#[test]
fn test_telemetry_reports_traffic() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    assert!(fixture.telemetry.upload_bytes > 0);
    assert!(fixture.telemetry.download_bytes > 0);
    // Nothing is lost on localhost without a lossy wrapper
    assert!(fixture.telemetry.download_bytes <= fixture.telemetry.upload_bytes);
}

#[test]
fn test_latency_estimate_is_sane() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();
    fixture.run_for(Duration::from_millis(100));

    let info = fixture.clients[0].server_connector().remote_info();
    assert!(info.mean_latency < Duration::from_secs(1));
    assert!(info.optimistic_latency <= info.pessimistic_latency);
}

// ============================================================================
// Disconnects
// ============================================================================

#[test]
fn test_timeout_fires_exactly_once() {
    let mut fixture = ClientServerFixture::builder()
        .timeout(Duration::from_millis(200))
        .build();
    fixture.establish();
    fixture.server_events.clear();

    // The client goes silent
    let deadline = Instant::now() + ci_timeout(Duration::from_secs(2));
    while fixture.server_events.is_empty() && Instant::now() < deadline {
        fixture.cycle_server();
        std::thread::sleep(Duration::from_millis(5));
    }
    let silence_end = Instant::now() + Duration::from_millis(400);
    while Instant::now() < silence_end {
        fixture.cycle_server();
        std::thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(
        fixture.server_events,
        vec![Event::Disconnected {
            client_index: Some(0),
            reason: DisconnectReason::TimedOut,
            message: "Connection timed out".to_string(),
        }]
    );
    assert_eq!(fixture.server.connected_count(), 0);
}

#[test]
fn test_zero_timeout_never_fires() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();
    fixture.server.set_timeout_limit(Duration::ZERO);
    fixture.server_events.clear();

    let end = Instant::now() + Duration::from_millis(300);
    while Instant::now() < end {
        fixture.cycle_server();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(fixture.server_events.is_empty());
    assert_eq!(fixture.server.connected_count(), 1);
}

#[test]
fn test_client_disconnect_notifies_server() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    fixture.clients[0].disconnect(true);
    let noticed = fixture.run_until(Duration::from_secs(2), |f| {
        count(&f.server_events, |e| matches!(e, Event::Disconnected { .. })) == 1
    });
    assert!(noticed);

    let last = fixture.server_events.last().unwrap();
    assert!(matches!(
        last,
        Event::Disconnected { client_index: Some(0), reason: DisconnectReason::Graceful, message }
            if message.contains("Client disconnected.")
    ));
    assert!(!fixture.clients[0].is_running());
}

#[test]
fn test_kick_client() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    fixture.server.kick_client(0, true, "bye").unwrap();
    assert_eq!(fixture.server.connected_count(), 0);

    let kicked = fixture.run_until(Duration::from_secs(2), |f| f.client_events[0].len() >= 2);
    assert!(kicked);
    assert_eq!(
        fixture.client_events[0][1],
        Event::Disconnected {
            client_index: None,
            reason: DisconnectReason::Graceful,
            message: "Remote terminated the connection: bye".to_string(),
        }
    );
    assert!(!fixture.clients[0].is_running());
}

#[test]
fn test_server_stop_notifies_clients() {
    let mut fixture = ClientServerFixture::builder().clients(2).build();
    fixture.establish();

    fixture.server.stop(true);
    assert!(!fixture.server.is_running());

    let notified = fixture.run_until(Duration::from_secs(2), |f| {
        f.clients.iter().all(|c| c.status() == ConnectorStatus::Disconnected)
    });
    assert!(notified);
    for events in &fixture.client_events {
        assert!(matches!(
            events.last(),
            Some(Event::Disconnected { message, .. }) if message.contains("Server shutting down.")
        ));
    }
    assert_eq!(
        count(&fixture.server_events, |e| matches!(e, Event::Disconnected { .. })),
        2
    );
}

// ============================================================================
// Handler dispatch
// ============================================================================

/// Client registry with one handler the server has never heard of.
///
/// `zzz.extra` sorts last, so the IDs of the shared handlers still agree.
fn registry_with_extra() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register("blob", |_, _: &mut Packet| Ok(()))
        .register("echo", |_, _: &mut Packet| Ok(()))
        .register("number", |_, _: &mut Packet| Ok(()))
        .register("text", |_, _: &mut Packet| Ok(()))
        .register("zzz.extra", |_, _: &mut Packet| Ok(()));
    registry.index();
    registry
}

#[test]
fn test_unknown_handler_disconnects() {
    let mut fixture = ClientServerFixture::builder()
        .client_registry(registry_with_extra())
        .build();
    fixture.establish();

    fixture.clients[0].compose(0, "zzz.extra", &());
    let dropped = fixture.run_until(Duration::from_secs(2), |f| {
        f.clients[0].status() == ConnectorStatus::Disconnected
    });
    assert!(dropped);

    assert!(fixture.server_events.iter().any(|e| matches!(
        e,
        Event::Disconnected { client_index: Some(0), reason: DisconnectReason::Error, message }
            if message.contains("Unknown handler ID 4")
    )));
    assert!(matches!(
        fixture.client_events[0].last(),
        Some(Event::Disconnected { reason: DisconnectReason::Graceful, .. })
    ));
}

#[test]
fn test_unknown_handler_ignored_by_policy() {
    let mut server_config = NodeConfig::with_passphrase("beetlejuice");
    server_config.unknown_handler_policy = UnknownHandlerPolicy::Ignore;
    let mut fixture = ClientServerFixture::builder()
        .server_config(server_config)
        .client_registry(registry_with_extra())
        .build();
    fixture.establish();

    fixture.clients[0].compose(0, "zzz.extra", &());
    fixture.run_for(Duration::from_millis(50));
    fixture.clients[0].compose(0, "number", &7u32);

    assert!(fixture.run_until(Duration::from_secs(2), |f| !f.server_inbox().numbers.is_empty()));
    assert_eq!(fixture.server_inbox().numbers, vec![7]);
    assert_eq!(fixture.clients[0].status(), ConnectorStatus::Connected);
}

#[test]
fn test_illegal_message_drops_client() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();

    // `echo` is client-to-server only
    fixture.server.compose(0, "echo", "nope");
    let dropped = fixture.run_until(Duration::from_secs(2), |f| {
        f.clients[0].status() == ConnectorStatus::Disconnected
    });
    assert!(dropped);
    assert!(fixture.client_events[0].iter().any(|e| matches!(
        e,
        Event::Disconnected { reason: DisconnectReason::Error, message, .. }
            if message.starts_with("Illegal 'echo' message")
    )));
}

#[test]
fn test_user_data_survives_cycles() {
    let mut fixture = ClientServerFixture::builder().build();
    fixture.establish();
    fixture.run_for(Duration::from_millis(20));

    let previous = fixture.server.replace_user_data(None);
    assert!(previous.is_some_and(|data| data.downcast::<Inbox>().is_ok()));
    assert!(fixture.server.user_data_mut::<Inbox>().is_none());
}
