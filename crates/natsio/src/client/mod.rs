//! The public client handle.
//!
//! [`NatsClient`] is a cheap, cloneable handle over one logical
//! connection. Application calls mutate the shared engine state under a
//! short lock and wake the writer; the driver task owns the socket.

mod direct;
mod drain;
mod request;
mod state;

pub use request::{CancelledRequest, Request, RequestHandle, RequestId, RequestOptions};
pub use state::Statistics;

use crate::callback::{ReplyCallback, MessageCallback};
use crate::codec::codec_for;
use crate::error::{NatsError, Result};
use crate::transport::TlsConfig;
use bytes::Bytes;
use natsio_protocol::{
    create_inbox_with_prefix, validate_subject, ClientOp, ConnectOptions, ConnectionEvent,
    ConnectionState, FrameKind, Message, RequestToken, Server, ServerInfo, ServerPool,
    SubscriptionId, Unsubscribe,
};
use serde_json::Value;
use state::{Core, Shared};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::instrument;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub queue: Option<String>,
    /// Unsubscribe automatically after this many messages.
    pub max: Option<u64>,
}

impl SubscribeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub sid: SubscriptionId,
    pub subject: String,
    pub queue: Option<String>,
    pub received: u64,
    pub max: Option<u64>,
    pub has_timeout: bool,
    pub draining: bool,
}

/// What a subscription timer does when it fires.
enum TimeoutAction {
    Notify(Box<dyn FnOnce() + Send>),
    /// Legacy request: drop the reply subscription, then report the timeout.
    Request(ReplyCallback),
}

#[derive(Clone)]
pub struct NatsClient {
    shared: Arc<Shared>,
}

impl fmt::Debug for NatsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl NatsClient {
    /// Creates a client without connecting. Option errors are reported
    /// here, before any I/O.
    pub fn new(options: ConnectOptions) -> Result<Self> {
        options.validate()?;
        let pool = ServerPool::new(
            &options.servers,
            options.no_randomize,
            options.randomize_configured,
        )?;
        let codec = codec_for(&options);
        Ok(Self {
            shared: Arc::new(Shared::new(options, pool, codec)),
        })
    }

    /// Creates a client and waits for the initial connection.
    pub async fn connect_with(options: ConnectOptions) -> Result<Self> {
        let client = Self::new(options)?;
        client.connect().await?;
        Ok(client)
    }

    /// TLS material used whenever a server connection is upgraded. Takes
    /// effect from the next connection attempt.
    pub fn set_tls_config(&self, config: TlsConfig) {
        *self.shared.tls.write() = Some(config);
    }

    pub fn on_event(&self, callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
        self.shared.callbacks.on_event(Arc::new(callback));
    }

    /// Fatal connection errors and failed connection attempts.
    pub fn on_error(&self, callback: impl Fn(&NatsError) + Send + Sync + 'static) {
        self.shared.callbacks.on_error(Arc::new(callback));
    }

    pub fn on_permission_error(&self, callback: impl Fn(&NatsError) + Send + Sync + 'static) {
        self.shared.callbacks.on_permission_error(Arc::new(callback));
    }

    /// Starts the connection driver and waits for the first connection.
    ///
    /// # Errors
    /// Returns the last connection error if no server could be reached, or
    /// `ConnectionClosed` if the client was closed meanwhile.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<()> {
        let ready = {
            let mut driver = self.shared.driver.lock();
            if driver.is_some() {
                return Err(NatsError::InvalidState("connect already called".into()));
            }
            if self.shared.is_shutdown() {
                return Err(NatsError::ConnectionClosed);
            }
            let (tx, rx) = oneshot::channel();
            *driver = Some(tokio::spawn(direct::run(Arc::clone(&self.shared), tx)));
            rx
        };
        ready.await.map_err(|_| NatsError::ConnectionClosed)?
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// The `INFO` of the current or last server.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.lock().server_info.clone()
    }

    /// The server pool in rotation order.
    pub fn servers(&self) -> Vec<Server> {
        self.shared.lock().pool.iter().cloned().collect()
    }

    pub fn stats(&self) -> Statistics {
        self.shared.lock().stats
    }

    pub fn create_inbox(&self) -> String {
        create_inbox_with_prefix(&self.shared.options.inbox_prefix)
    }

    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject, None, payload.into())
    }

    pub fn publish_request(&self, subject: &str, reply: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.publish_inner(subject, Some(reply), payload.into())
    }

    /// Publishes and invokes `callback` once the server has processed the
    /// message.
    pub fn publish_with_flush(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.publish(subject, payload)?;
        self.flush_with(callback);
        Ok(())
    }

    /// Encodes `value` with the configured codec and publishes it.
    pub fn publish_value(&self, subject: &str, value: &Value) -> Result<()> {
        let payload = self.shared.codec.encode(value)?;
        self.publish(subject, payload)
    }

    /// Decodes a message payload with the configured codec.
    pub fn decode(&self, message: &Message) -> Result<Value> {
        self.shared.codec.decode(&message.payload)
    }

    fn publish_inner(&self, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
        enqueue_publish(&mut self.shared.lock(), subject, reply, payload)?;
        self.shared.wake_writer();
        Ok(())
    }

    /// Registers a subscription. Before the first connection and while
    /// reconnecting, the `SUB` is sent when the connection is restored.
    pub fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        callback: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let callback: MessageCallback = Arc::new(callback);
        let sid = {
            let mut core = self.shared.lock();
            core.connection_state().admission()?;
            let sid = core
                .registry
                .subscribe(subject, options.queue.as_deref(), callback)?;
            core.send_control(&ClientOp::Sub {
                subject: subject.to_string(),
                queue: options.queue,
                sid: sid.as_u64(),
            });
            if let Some(max) = options.max.filter(|max| *max > 0) {
                if let Unsubscribe::Deferred { max, .. } = core.registry.unsubscribe(sid, Some(max)) {
                    core.send_control(&ClientOp::Unsub {
                        sid: sid.as_u64(),
                        max: Some(max),
                    });
                }
            }
            sid
        };
        tracing::debug!(sid = %sid, subject, "subscribed");
        self.shared.wake_writer();
        Ok(sid)
    }

    /// Removes a subscription now, or after `max` messages in total.
    /// Unknown ids are ignored.
    pub fn unsubscribe(&self, sid: SubscriptionId, max: Option<u64>) {
        {
            let mut core = self.shared.lock();
            match core.registry.unsubscribe(sid, max) {
                Unsubscribe::Removed(sub) => {
                    core.clear_sub_timer(sub.timeout);
                    core.send_control(&ClientOp::Unsub {
                        sid: sid.as_u64(),
                        max: None,
                    });
                }
                Unsubscribe::Deferred { max, .. } => {
                    core.send_control(&ClientOp::Unsub {
                        sid: sid.as_u64(),
                        max: Some(max),
                    });
                }
                Unsubscribe::Unknown => return,
            }
        }
        self.shared.wake_writer();
    }

    /// Invokes `callback` unless `expected` messages arrive on `sid`
    /// within `after`. Re-arming replaces the previous timer.
    ///
    /// # Errors
    /// `InvalidState` when called outside a tokio runtime, since the timer
    /// runs as a task.
    pub fn timeout(
        &self,
        sid: SubscriptionId,
        after: Duration,
        expected: u64,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let mut core = self.shared.lock();
        self.arm_sub_timeout(
            &mut core,
            sid,
            after,
            expected,
            TimeoutAction::Notify(Box::new(callback)),
        )
    }

    /// Whether a timeout is armed on `sid`. Timers that fired or were
    /// satisfied report `false`.
    pub fn has_timeout(&self, sid: SubscriptionId) -> bool {
        self.shared
            .lock()
            .registry
            .get(sid)
            .is_some_and(|sub| sub.timeout.is_some())
    }

    pub fn subscription(&self, sid: SubscriptionId) -> Option<SubscriptionInfo> {
        let core = self.shared.lock();
        core.registry.get(sid).map(|sub| SubscriptionInfo {
            sid: sub.sid,
            subject: sub.subject.clone(),
            queue: sub.queue.clone(),
            received: sub.received,
            max: sub.max,
            has_timeout: sub.timeout.is_some(),
            draining: sub.draining,
        })
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().registry.len()
    }

    /// Closes the connection immediately without flushing. Pending flush,
    /// drain and request callbacks fail with `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    fn arm_sub_timeout(
        &self,
        core: &mut Core,
        sid: SubscriptionId,
        after: Duration,
        expected: u64,
        action: TimeoutAction,
    ) -> Result<()> {
        let runtime = timer_runtime()?;
        let (armed, replaced) = core.registry.set_timeout(sid, after, expected, Instant::now())?;
        core.clear_sub_timer(replaced);
        let shared = Arc::downgrade(&self.shared);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(shared) = shared.upgrade() {
                fire_sub_timeout(&shared, sid, armed.timer_id, action);
            }
        });
        core.sub_timers.insert(armed.timer_id, timer.abort_handle());
        Ok(())
    }

    fn arm_mux_timeout(
        &self,
        runtime: &Handle,
        core: &mut Core,
        token: RequestToken,
        timer_id: u64,
        after: Duration,
    ) {
        let shared = Arc::downgrade(&self.shared);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let entry = {
                let mut core = shared.lock();
                core.mux_timers.remove(&timer_id);
                core.mux.take_timed_out(&token, timer_id)
            };
            if let Some(entry) = entry {
                tracing::debug!(token = %token, received = entry.received, "request timed out");
                (entry.callback)(Err(NatsError::RequestTimeout));
            }
        });
        core.mux_timers.insert(timer_id, timer.abort_handle());
    }
}

/// Timers are tasks on the caller's runtime.
fn timer_runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|_| NatsError::InvalidState("timers need a running tokio runtime".into()))
}

fn fire_sub_timeout(shared: &Shared, sid: SubscriptionId, timer_id: u64, action: TimeoutAction) {
    let mut core = shared.lock();
    core.sub_timers.remove(&timer_id);
    if core.registry.take_expired_timeout(sid, timer_id).is_none() {
        return;
    }
    tracing::debug!(sid = %sid, "subscription timed out");
    match action {
        TimeoutAction::Notify(callback) => {
            drop(core);
            callback();
        }
        TimeoutAction::Request(callback) => {
            if core.registry.remove(sid).is_some() {
                core.send_control(&ClientOp::Unsub {
                    sid: sid.as_u64(),
                    max: None,
                });
            }
            drop(core);
            shared.wake_writer();
            callback(Err(NatsError::RequestTimeout));
        }
    }
}

/// Queues a `PUB`. While disconnected the frame counts against the
/// reconnect buffer.
fn enqueue_publish(core: &mut Core, subject: &str, reply: Option<&str>, payload: Bytes) -> Result<()> {
    core.connection_state().admission()?;
    validate_subject(subject)?;
    if let Some(reply) = reply {
        validate_subject(reply)?;
    }
    if let Some(info) = &core.server_info {
        let max = info.max_payload();
        if payload.len() > max {
            return Err(NatsError::MaxPayloadExceeded {
                size: payload.len(),
                max,
            });
        }
    }

    let size = payload.len() as u64;
    let frame = ClientOp::Pub {
        subject: subject.to_string(),
        reply: reply.map(str::to_string),
        payload,
    }
    .to_bytes();
    if core.transport_live() {
        core.outbound.enqueue(FrameKind::Publish, frame);
    } else {
        core.outbound.enqueue_buffered(frame)?;
    }
    core.stats.out_msgs += 1;
    core.stats.out_bytes += size;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn client() -> NatsClient {
        NatsClient::new(ConnectOptions::default()).unwrap()
    }

    #[test]
    fn test_bad_options_rejected_before_io() {
        let options = ConnectOptions::default().with_nonce_signer(Arc::new(
            |n: &[u8]| -> Result<Vec<u8>> { Ok(n.to_vec()) },
        ));
        assert_eq!(
            NatsClient::new(options).unwrap_err(),
            NatsError::SignerWithoutIdentity
        );
    }

    #[test]
    fn test_publish_buffers_before_connect() {
        let client = client();
        client.publish("foo", "bar").unwrap();
        assert_eq!(client.stats().out_msgs, 1);
        assert!(matches!(
            client.publish("", "x"),
            Err(NatsError::InvalidSubject(_))
        ));
        assert_eq!(client.shared.lock().outbound.pending_frames(), 1);
    }

    #[test]
    fn test_reconnect_buffer_limit() {
        let options = ConnectOptions::default().with_reconnect_buffer_size(16);
        let client = NatsClient::new(options).unwrap();
        assert!(matches!(
            client.publish("foo", vec![0u8; 64]),
            Err(NatsError::ReconnectBufferExceeded { .. })
        ));
    }

    #[test]
    fn test_subscribe_and_unsubscribe_offline() {
        let client = client();
        let sid = client
            .subscribe("foo.*", SubscribeOptions::new().with_max(3), |_| {})
            .unwrap();
        let info = client.subscription(sid).unwrap();
        assert_eq!(info.subject, "foo.*");
        assert_eq!(info.max, Some(3));
        assert_eq!(client.shared.lock().outbound.pending_frames(), 0);

        client.unsubscribe(sid, None);
        assert!(client.subscription(sid).is_none());
        client.unsubscribe(sid, None);
    }

    #[tokio::test]
    async fn test_timeout_fires_and_clears() {
        let client = client();
        let sid = client.subscribe("foo", SubscribeOptions::new(), |_| {}).unwrap();
        let (tx, rx) = oneshot::channel();
        client
            .timeout(sid, Duration::from_millis(20), 1, move || {
                let _ = tx.send(());
            })
            .unwrap();
        assert!(client.has_timeout(sid));
        rx.await.unwrap();
        assert!(!client.has_timeout(sid));
    }

    #[tokio::test]
    async fn test_rearming_timeout_cancels_previous_timer() {
        let client = client();
        let sid = client.subscribe("foo", SubscribeOptions::new(), |_| {}).unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        client
            .timeout(sid, Duration::from_millis(10), 1, move || f.lock().push("first"))
            .unwrap();
        let f = Arc::clone(&fired);
        client
            .timeout(sid, Duration::from_millis(30), 1, move || f.lock().push("second"))
            .unwrap();
        assert_eq!(client.shared.lock().sub_timers.len(), 1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(*fired.lock(), vec!["second"]);
    }

    #[test]
    fn test_timers_outside_runtime_are_rejected() {
        let client = client();
        let sid = client.subscribe("foo", SubscribeOptions::new(), |_| {}).unwrap();
        assert!(matches!(
            client.timeout(sid, Duration::from_millis(10), 1, || {}),
            Err(NatsError::InvalidState(_))
        ));
        assert!(!client.has_timeout(sid));

        let timed = Request::new("svc").with_timeout(Duration::from_millis(10));
        assert!(matches!(
            client.request(timed, |_| {}),
            Err(NatsError::InvalidState(_))
        ));
        assert!(client.request(Request::new("svc"), |_| {}).is_ok());
    }

    #[test]
    fn test_close_fails_pending_requests() {
        for old_style in [false, true] {
            let options = ConnectOptions::default().with_old_request_style(old_style);
            let client = NatsClient::new(options).unwrap();
            let results = Arc::new(Mutex::new(Vec::new()));
            let r = Arc::clone(&results);
            client
                .request(Request::new("svc"), move |result| r.lock().push(result))
                .unwrap();
            client.close();
            assert_eq!(*results.lock(), vec![Err(NatsError::ConnectionClosed)]);
        }
    }

    #[test]
    fn test_close_rejects_new_work() {
        let client = client();
        client.close();
        assert!(client.is_closed());
        assert_eq!(client.publish("foo", "x"), Err(NatsError::ConnectionClosed));
        assert_eq!(
            client.subscribe("foo", SubscribeOptions::new(), |_| {}).unwrap_err(),
            NatsError::ConnectionClosed
        );
        client.close();
    }
}
