#![allow(dead_code)]

use natsio::testing::MockServer;
use natsio::{ConnectOptions, ConnectionEvent, NatsClient};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Options for `server` with short reconnect delays.
pub fn fast_options(server: &MockServer) -> ConnectOptions {
    ConnectOptions::new(server.url())
        .with_reconnect_wait(Duration::from_millis(50))
        .with_reconnect_jitter(Duration::ZERO, Duration::ZERO)
}

pub async fn connect(server: &MockServer) -> NatsClient {
    NatsClient::connect_with(fast_options(server))
        .await
        .expect("connect failed")
}

/// Records every connection event a client emits.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<ConnectionEvent>>>,
}

impl EventLog {
    pub fn attach(client: &NatsClient) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        client.on_event(move |event| events.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.lock().clone()
    }

    pub fn contains(&self, predicate: impl Fn(&ConnectionEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }

    pub async fn wait_for(&self, predicate: impl Fn(&ConnectionEvent) -> bool) -> bool {
        eventually(|| self.contains(&predicate)).await
    }
}

/// Polls `condition` every 10ms until it holds or [`WAIT`] elapses.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
