//! End-to-end tests over TCP loopback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use netcomms::prelude::*;
use tokio::task::JoinSet;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

async fn start_server() -> (Server, EventStream, Provider) {
    start_server_with(Provider::builder()).await
}

async fn start_server_with(builder: ProviderConfigBuilder) -> (Server, EventStream, Provider) {
    let config = builder
        .transport(TransportKind::Stream)
        .bind_ip(LOCALHOST)
        .port(0)
        .build()
        .unwrap();
    let server = Provider::new(config).unwrap().create_server();
    let events = server.subscribe();
    server.start().await.unwrap();

    let port = server.local_addr().unwrap().port();
    (server, events, Provider::stream(port))
}

async fn next_event(events: &mut EventStream) -> Event {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Connect a client and return it with the server-side member.
async fn connect(provider: &Provider, server_events: &mut EventStream) -> (Connection, Connection) {
    let client = provider.create_client(LOCALHOST);
    client.start().await.unwrap();

    match next_event(server_events).await {
        Event::NewConnection(member) => {
            assert_eq!(member.role(), Role::Server);
            (client, member)
        }
        other => panic!("expected NewConnection, got {other:?}"),
    }
}

/// Answer every transaction with its command reversed.
fn spawn_reverser(mut events: EventStream) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Event::Transaction(tx) = event {
                let mut reply = tx.command().to_vec();
                reply.reverse();
                tx.send_response(reply).await.unwrap();
            }
        }
    })
}

#[tokio::test]
async fn test_notifications_arrive_in_order() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, member) = connect(&provider, &mut server_events).await;

    for body in [[1u8, 2, 3], [4, 5, 6], [7, 8, 9]] {
        client.send_notification(body).await.unwrap();
    }

    for expected in [[1u8, 2, 3], [4, 5, 6], [7, 8, 9]] {
        match next_event(&mut server_events).await {
            Event::Notification { connection, payload } => {
                assert_eq!(connection, member);
                assert_eq!(&payload[..], &expected[..]);
            }
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_empty_notification() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;

    client.send_notification(b"").await.unwrap();
    match next_event(&mut server_events).await {
        Event::Notification { payload, .. } => assert!(payload.is_empty()),
        other => panic!("expected Notification, got {other:?}"),
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let (server, mut server_events, provider) = start_server().await;
    let (first, _) = connect(&provider, &mut server_events).await;
    let (second, _) = connect(&provider, &mut server_events).await;
    let mut first_events = first.subscribe();
    let mut second_events = second.subscribe();

    assert_eq!(server.connection_count(), 2);
    assert_eq!(server.send_notification(b"hello all").await.unwrap(), 2);

    for events in [&mut first_events, &mut second_events] {
        match next_event(events).await {
            Event::Notification { payload, .. } => assert_eq!(&payload[..], b"hello all"),
            other => panic!("expected Notification, got {other:?}"),
        }
    }

    first.dispose().await;
    second.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_request_response() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;
    let responder = spawn_reverser(server_events);

    let response = timeout(WAIT, client.request(b"abc")).await.unwrap().unwrap();
    assert_eq!(&response[..], b"cba");
    assert_eq!(client.pending_transactions(), 0);

    client.dispose().await;
    server.dispose().await;
    responder.abort();
}

#[tokio::test]
async fn test_concurrent_requests_matched_by_tag() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;
    let responder = spawn_reverser(server_events);

    let mut requests = JoinSet::new();
    for i in 0..32u32 {
        let client = client.clone();
        requests.spawn(async move {
            let command = format!("request-{i}");
            let response = client.request(command.as_bytes()).await.unwrap();
            let expected: Vec<u8> = command.bytes().rev().collect();
            assert_eq!(&response[..], &expected[..]);
        });
    }
    while let Some(result) = timeout(WAIT, requests.join_next()).await.unwrap() {
        result.unwrap();
    }
    assert_eq!(client.pending_transactions(), 0);

    client.dispose().await;
    server.dispose().await;
    responder.abort();
}

#[tokio::test]
async fn test_send_transaction_callback() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;
    let responder = spawn_reverser(server_events);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tag = client
        .send_transaction(b"xyz", move |response| {
            let _ = tx.send(response);
        })
        .await
        .unwrap();
    assert!((0x1000_0000..0x2000_0000).contains(&tag));

    let response = timeout(WAIT, rx).await.unwrap().unwrap();
    assert_eq!(&response[..], b"zyx");

    client.dispose().await;
    server.dispose().await;
    responder.abort();
}

#[tokio::test]
async fn test_server_initiated_transaction() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, member) = connect(&provider, &mut server_events).await;
    let client_events = client.subscribe();
    let responder = spawn_reverser(client_events);

    let response = timeout(WAIT, member.request(b"ping")).await.unwrap().unwrap();
    assert_eq!(&response[..], b"gnip");

    client.dispose().await;
    server.dispose().await;
    responder.abort();
}

#[tokio::test]
async fn test_transaction_answered_once() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(b"once").await })
    };

    let tx = match next_event(&mut server_events).await {
        Event::Transaction(tx) => tx,
        other => panic!("expected Transaction, got {other:?}"),
    };
    assert!(tx.tag() >= 0x1000_0000);
    assert_eq!(&tx.command()[..], b"once");

    tx.send_response(b"first").await.unwrap();
    assert!(matches!(
        tx.send_response(b"second").await,
        Err(NetError::AlreadyResponded)
    ));

    let response = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert_eq!(&response[..], b"first");

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_client_dispose_seen_by_server() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, member) = connect(&provider, &mut server_events).await;
    let mut client_events = client.subscribe();

    client.dispose().await;
    client.dispose().await;
    assert!(!client.is_running());
    assert!(matches!(client.start().await, Err(NetError::Disposed)));
    assert!(matches!(
        client.send_notification(b"late").await,
        Err(NetError::NotConnected)
    ));

    // The disposing side hears about it too.
    assert!(matches!(
        next_event(&mut client_events).await,
        Event::ConnectionDropped(_)
    ));

    match next_event(&mut server_events).await {
        Event::ConnectionDropped(dropped) => assert_eq!(dropped, member),
        other => panic!("expected ConnectionDropped, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);

    server.dispose().await;
}

#[tokio::test]
async fn test_server_dispose_drops_clients() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;
    let mut client_events = client.subscribe();

    // Nobody answers on the server side; the request is cut short instead.
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request(b"never").await })
    };
    assert!(matches!(
        next_event(&mut server_events).await,
        Event::Transaction(_)
    ));

    server.dispose().await;
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);

    assert!(matches!(
        next_event(&mut client_events).await,
        Event::ConnectionDropped(_)
    ));
    assert!(!client.is_running());
    assert!(matches!(
        timeout(WAIT, pending).await.unwrap().unwrap(),
        Err(NetError::ConnectionDropped)
    ));

    client.dispose().await;
}

#[tokio::test]
async fn test_client_start_twice() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, _member) = connect(&provider, &mut server_events).await;

    assert!(matches!(client.start().await, Err(NetError::AlreadyConnected)));

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_connect_refused() {
    // Bind then release a port so nothing listens on it.
    let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = Provider::stream(port).create_client(LOCALHOST);
    assert!(matches!(client.start().await, Err(NetError::Io(_))));
    assert!(!client.is_running());
    assert!(matches!(
        client.send_notification(b"x").await,
        Err(NetError::NotConnected)
    ));
}

#[tokio::test]
async fn test_malformed_length_drops_connection() {
    use tokio::io::AsyncWriteExt;

    let (server, mut server_events, provider) = start_server().await;
    let port = provider.config().port;

    let mut raw = tokio::net::TcpStream::connect((LOCALHOST, port)).await.unwrap();
    let member = match next_event(&mut server_events).await {
        Event::NewConnection(member) => member,
        other => panic!("expected NewConnection, got {other:?}"),
    };

    // Negative length prefix.
    raw.write_all(&(-5i32).to_le_bytes()).await.unwrap();
    raw.write_all(&0i32.to_le_bytes()).await.unwrap();

    match next_event(&mut server_events).await {
        Event::ConnectionDropped(dropped) => assert_eq!(dropped, member),
        other => panic!("expected ConnectionDropped, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);

    server.dispose().await;
}

#[tokio::test]
async fn test_associated_data_on_member() {
    let (server, mut server_events, provider) = start_server().await;
    let (client, member) = connect(&provider, &mut server_events).await;

    member.set_associated_data(42u64);
    client.send_notification(b"hi").await.unwrap();

    match next_event(&mut server_events).await {
        Event::Notification { connection, .. } => {
            assert_eq!(connection.associated_data::<u64>().as_deref(), Some(&42));
        }
        other => panic!("expected Notification, got {other:?}"),
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_dispose_cancels_send_blocked_on_silent_peer() {
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Provider::stream(port).create_client(LOCALHOST);
    client.start().await.unwrap();
    // Accepted and held open, but never read.
    let (_peer, _) = listener.accept().await.unwrap();

    let sender = {
        let client = client.clone();
        tokio::spawn(async move {
            let payload = vec![0x5Au8; 32_000];
            loop {
                if let Err(e) = client.send_notification(&payload).await {
                    return e;
                }
            }
        })
    };

    // Long enough for the socket buffers to fill and the sender to block.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!sender.is_finished());

    timeout(WAIT, client.dispose())
        .await
        .expect("dispose waited on a blocked send");
    assert!(client.is_disposed());

    let error = timeout(WAIT, sender).await.unwrap().unwrap();
    assert!(matches!(error, NetError::NotConnected), "unexpected error: {error:?}");
}

#[tokio::test]
async fn test_broadcast_not_blocked_by_stalled_member() {
    const ROUNDS: usize = 600;

    let (server, mut server_events, provider) =
        start_server_with(Provider::builder().send_timeout(Duration::from_millis(500))).await;
    let (healthy, _) = connect(&provider, &mut server_events).await;
    let mut healthy_events = healthy.subscribe();

    // Connects but never reads.
    let _silent = tokio::net::TcpStream::connect((LOCALHOST, provider.config().port))
        .await
        .unwrap();
    let stalled = match next_event(&mut server_events).await {
        Event::NewConnection(member) => member,
        other => panic!("expected NewConnection, got {other:?}"),
    };

    let received = tokio::spawn(async move {
        let mut count = 0;
        while count < ROUNDS {
            match healthy_events.recv().await {
                Some(Event::Notification { .. }) => count += 1,
                Some(_) => {}
                None => break,
            }
        }
        count
    });

    let payload = vec![0xC3u8; 32_000];
    for round in 0..ROUNDS {
        let delivered = timeout(WAIT, server.send_notification(&payload))
            .await
            .unwrap_or_else(|_| panic!("broadcast {round} blocked"))
            .unwrap();
        assert!(delivered >= 1);
    }
    assert_eq!(timeout(WAIT, received).await.unwrap().unwrap(), ROUNDS);

    // The stalled member was given up on and dropped.
    match next_event(&mut server_events).await {
        Event::ConnectionDropped(dropped) => assert_eq!(dropped, stalled),
        other => panic!("expected ConnectionDropped, got {other:?}"),
    }
    assert!(stalled.is_disposed());
    assert_eq!(server.connection_count(), 1);

    healthy.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_ipv6_bind() {
    // Hosts without an IPv6 loopback have nothing to test.
    if std::net::TcpListener::bind((Ipv6Addr::LOCALHOST, 0)).is_err() {
        return;
    }

    let config = Provider::builder()
        .transport(TransportKind::Stream)
        .bind_ip(IpAddr::V6(Ipv6Addr::LOCALHOST))
        .port(0)
        .build()
        .unwrap();
    let server = Provider::new(config).unwrap().create_server();
    let mut server_events = server.subscribe();
    server.start().await.unwrap();
    assert!(server.local_addr().unwrap().is_ipv6());

    let port = server.local_addr().unwrap().port();
    let client = Provider::stream(port).create_client(IpAddr::V6(Ipv6Addr::LOCALHOST));
    client.start().await.unwrap();
    assert!(matches!(next_event(&mut server_events).await, Event::NewConnection(_)));

    client.send_notification(b"v6").await.unwrap();
    match next_event(&mut server_events).await {
        Event::Notification { connection, payload } => {
            assert_eq!(&payload[..], b"v6");
            assert!(connection.peer_addr().is_ipv6());
        }
        other => panic!("expected Notification, got {other:?}"),
    }

    client.dispose().await;
    server.dispose().await;
}
