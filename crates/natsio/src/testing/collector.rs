use natsio_protocol::Message;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Collects messages delivered to a subscriber for later assertion.
///
/// Clone-friendly. Use [`callback`](Self::callback) to get a closure
/// suitable for `NatsClient::subscribe`.
#[derive(Clone, Default)]
pub struct MessageCollector {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl MessageCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(Message) + Send + Sync + 'static {
        let messages = Arc::clone(&self.messages);
        move |msg| messages.lock().push(msg)
    }

    /// Polls until at least `count` messages arrived or `timeout` elapses.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count() >= count
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Payloads decoded as UTF-8, lossily.
    #[must_use]
    pub fn payloads(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .map(|m| m.payload_str().into_owned())
            .collect()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }
}
