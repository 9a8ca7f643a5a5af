mod common;

use common::{connect, eventually, fast_options, init_tracing, EventLog, WAIT};
use natsio::testing::{MessageCollector, MockServer, MockServerConfig};
use natsio::{
    ConnectOptions, ConnectionEvent, DisconnectReason, NatsClient, NatsError, Server,
    SubscribeOptions,
};
use natsio_protocol::ClientOp;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn is_reconnected(event: &ConnectionEvent) -> bool {
    matches!(event, ConnectionEvent::Reconnected { .. })
}

async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_subscriptions_and_buffered_publishes_survive_reconnect() {
    init_tracing();
    let server = MockServer::start().await.unwrap();
    let options = fast_options(&server).with_reconnect_wait(Duration::from_millis(300));
    let client = NatsClient::connect_with(options).await.unwrap();
    let events = EventLog::attach(&client);

    let collector = MessageCollector::new();
    client
        .subscribe("updates", SubscribeOptions::new(), collector.callback())
        .unwrap();
    client.flush().await.unwrap();

    server.drop_connections();
    assert!(eventually(|| !client.is_connected()).await);
    client.publish("updates", "buffered").unwrap();

    assert!(events.wait_for(is_reconnected).await);
    client.flush().await.unwrap();
    assert!(collector.wait_for(1, WAIT).await);
    assert_eq!(collector.payloads(), vec!["buffered"]);
    assert_eq!(client.stats().reconnects, 1);

    let subs = server
        .received_ops()
        .into_iter()
        .filter(|op| matches!(op, ClientOp::Sub { subject, .. } if subject == "updates"))
        .count();
    assert_eq!(subs, 2);
    assert!(events.contains(|e| matches!(
        e,
        ConnectionEvent::Disconnected {
            reason: DisconnectReason::ServerClosed
        }
    )));
}

#[tokio::test]
async fn test_auto_unsubscribe_replays_remaining_count() {
    let server = MockServer::start().await.unwrap();
    let client = connect(&server).await;
    let events = EventLog::attach(&client);
    let collector = MessageCollector::new();
    let sid = client
        .subscribe("limited", SubscribeOptions::new().with_max(5), collector.callback())
        .unwrap();
    client.publish("limited", "1").unwrap();
    client.publish("limited", "2").unwrap();
    client.flush().await.unwrap();
    assert_eq!(collector.count(), 2);

    server.drop_connections();
    assert!(events.wait_for(is_reconnected).await);
    let replayed = ClientOp::Unsub {
        sid: sid.as_u64(),
        max: Some(3),
    };
    assert!(eventually(|| server.received_ops().contains(&replayed)).await);

    for i in 3..=10 {
        client.publish("limited", i.to_string()).unwrap();
    }
    client.flush().await.unwrap();
    assert_eq!(collector.payloads(), vec!["1", "2", "3", "4", "5"]);
    assert!(client.subscription(sid).is_none());
}

#[tokio::test]
async fn test_unanswered_pings_trigger_reconnect() {
    let server = MockServer::start_with(MockServerConfig::default().with_answer_pings(false))
        .await
        .unwrap();
    let options = fast_options(&server)
        .with_ping_interval(Duration::from_millis(50))
        .with_max_pings_out(2);
    let client = NatsClient::connect_with(options).await.unwrap();
    let events = EventLog::attach(&client);

    assert!(
        events
            .wait_for(|e| matches!(
                e,
                ConnectionEvent::Disconnected {
                    reason: DisconnectReason::StaleConnection
                }
            ))
            .await
    );
    assert!(events.wait_for(is_reconnected).await);
}

#[tokio::test]
async fn test_server_stale_error_triggers_reconnect() {
    let server = MockServer::start().await.unwrap();
    let client = connect(&server).await;
    let events = EventLog::attach(&client);
    server.broadcast_raw(&b"-ERR 'Stale Connection'\r\n"[..]);

    assert!(events.wait_for(is_reconnected).await);
    assert!(events.contains(|e| matches!(
        e,
        ConnectionEvent::Disconnected {
            reason: DisconnectReason::StaleConnection
        }
    )));
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_gives_up_after_max_reconnect_attempts() {
    let server = MockServer::start().await.unwrap();
    let options = fast_options(&server).with_max_reconnect_attempts(Some(2));
    let client = NatsClient::connect_with(options).await.unwrap();
    let events = EventLog::attach(&client);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    client.on_error(move |error| e.lock().push(error.clone()));

    server.stop();
    assert!(events.wait_for(|e| *e == ConnectionEvent::Closed).await);
    assert!(client.is_closed());

    let attempts: Vec<u32> = events
        .events()
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Reconnecting { attempt } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], NatsError::Io(_)));
}

#[tokio::test]
async fn test_reconnects_when_server_returns() {
    let mut server = MockServer::start().await.unwrap();
    let options = fast_options(&server).with_max_reconnect_attempts(None);
    let client = NatsClient::connect_with(options).await.unwrap();
    let events = EventLog::attach(&client);
    let collector = MessageCollector::new();
    client
        .subscribe("back", SubscribeOptions::new(), collector.callback())
        .unwrap();

    server.stop();
    assert!(eventually(|| !client.is_connected()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.restart().await.unwrap();

    assert!(events.wait_for(is_reconnected).await);
    client.publish("back", "again").unwrap();
    client.flush().await.unwrap();
    assert_eq!(collector.payloads(), vec!["again"]);
}

#[tokio::test]
async fn test_initial_connect_fails_fast_when_refused() {
    let port = unused_port().await;
    let options = ConnectOptions::new(format!("nats://127.0.0.1:{port}"));
    let client = NatsClient::new(options).unwrap();
    let result = tokio::time::timeout(WAIT, client.connect()).await.unwrap();
    assert!(matches!(result, Err(NatsError::Io(_))));
    assert!(client.is_closed());
    assert!(matches!(
        client.connect().await,
        Err(NatsError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_wait_on_first_connect_keeps_trying() {
    let mut server = MockServer::start().await.unwrap();
    let url = server.url();
    server.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let options = ConnectOptions::new(url)
        .with_wait_on_first_connect(true)
        .with_max_reconnect_attempts(None)
        .with_reconnect_wait(Duration::from_millis(50))
        .with_reconnect_jitter(Duration::ZERO, Duration::ZERO);
    let pending = tokio::spawn(NatsClient::connect_with(options));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());
    server.restart().await.unwrap();

    let client = tokio::time::timeout(WAIT, pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_discovered_servers_join_the_pool() {
    let config = MockServerConfig::default().with_connect_urls(["127.0.0.1:4333"]);
    let server = MockServer::start_with(config).await.unwrap();
    let client = NatsClient::new(fast_options(&server)).unwrap();
    let events = EventLog::attach(&client);
    client.connect().await.unwrap();

    let addresses = |client: &NatsClient| -> Vec<String> {
        client.servers().iter().map(Server::address).collect()
    };
    assert!(addresses(&client).contains(&"127.0.0.1:4333".to_string()));
    assert!(
        events
            .wait_for(|e| *e
                == ConnectionEvent::ServersDiscovered {
                    servers: vec!["127.0.0.1:4333".into()]
                })
            .await
    );

    server.announce_servers(&["127.0.0.1:4333".into(), "127.0.0.1:4334".into()]);
    assert!(
        events
            .wait_for(|e| *e
                == ConnectionEvent::ServersDiscovered {
                    servers: vec!["127.0.0.1:4334".into()]
                })
            .await
    );
    assert_eq!(addresses(&client).len(), 3);
    assert_eq!(client.servers().iter().filter(|s| s.implicit).count(), 2);
}

#[tokio::test]
async fn test_fails_over_to_discovered_server() {
    let backup = MockServer::start().await.unwrap();
    let backup_address = format!("127.0.0.1:{}", backup.port());
    let primary = MockServer::start_with(
        MockServerConfig::default().with_connect_urls([backup_address.clone()]),
    )
    .await
    .unwrap();

    let client = connect(&primary).await;
    let events = EventLog::attach(&client);
    let collector = MessageCollector::new();
    client
        .subscribe("ha", SubscribeOptions::new(), collector.callback())
        .unwrap();
    primary.stop();

    assert!(
        events
            .wait_for(|e| matches!(
                e,
                ConnectionEvent::Reconnected { server } if server.contains(&backup_address)
            ))
            .await
    );
    client.publish("ha", "on backup").unwrap();
    client.flush().await.unwrap();
    assert_eq!(collector.payloads(), vec!["on backup"]);
    assert_eq!(backup.connection_count(), 1);
}

#[test]
fn test_configured_order_is_kept_without_randomization() {
    let urls = ["nats://a:4222", "nats://b:4222", "nats://c:4222"];
    let client = NatsClient::new(ConnectOptions::default().with_servers(urls)).unwrap();
    let order: Vec<String> = client.servers().iter().map(Server::address).collect();
    assert_eq!(order, vec!["a:4222", "b:4222", "c:4222"]);
}
