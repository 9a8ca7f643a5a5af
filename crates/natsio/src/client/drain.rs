//! Round-trip flush and graceful drain.
//!
//! Both queue a `PING` whose `PONG` completes them. Because the server
//! answers in order, the `PONG` proves every earlier frame was processed
//! and every message it routed to us before that point was delivered.

use super::state::PongAction;
use super::NatsClient;
use crate::callback::Deferred;
use crate::error::{NatsError, Result};
use natsio_protocol::{ClientOp, ConnectionEvent, ConnectionState, SubscriptionId};
use tokio::sync::oneshot;
use tracing::instrument;

impl NatsClient {
    /// Invokes `callback` once the server has answered a `PING` sent after
    /// everything queued so far. While disconnected the `PING` waits in the
    /// reconnect buffer.
    pub fn flush_with(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let mut core = self.shared.lock();
        if core.connection_state().is_closed() {
            drop(core);
            callback(Err(NatsError::ConnectionClosed));
            return;
        }
        core.outbound
            .enqueue_ping(PongAction::Flush(Box::new(callback)));
        drop(core);
        self.shared.wake_writer();
    }

    #[instrument(skip(self))]
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.flush_with(move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| NatsError::ConnectionClosed)?
    }

    /// Stops accepting new work, unsubscribes everything, and closes once
    /// the server confirms that all earlier frames were processed.
    /// `callback` fires exactly once.
    pub fn drain_with(&self, callback: impl FnOnce(Result<()>) + Send + 'static) {
        let mut deferred = Deferred::default();
        let mut core = self.shared.lock();
        let rejected = match core.connection_state() {
            ConnectionState::Closed => Some(NatsError::ConnectionClosed),
            ConnectionState::Draining => Some(NatsError::ConnectionDraining),
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => Some(
                NatsError::InvalidState("cannot drain a connection that is not connected".into()),
            ),
            ConnectionState::Connected => None,
        };
        if let Some(error) = rejected {
            drop(core);
            callback(Err(error));
            return;
        }

        core.state.transition(&ConnectionEvent::Draining);
        deferred.event(ConnectionEvent::Draining);
        let drained = core.registry.drain_all();
        tracing::info!(subscriptions = drained.len(), "draining connection");
        for (sid, timeout) in drained {
            core.clear_sub_timer(timeout);
            core.send_control(&ClientOp::Unsub {
                sid: sid.as_u64(),
                max: None,
            });
        }
        core.outbound
            .enqueue_ping(PongAction::DrainConnection(Box::new(callback)));
        drop(core);

        self.shared.wake_writer();
        deferred.run(&self.shared.callbacks);
    }

    #[instrument(skip(self))]
    pub async fn drain(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.drain_with(move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| NatsError::ConnectionClosed)?
    }

    /// Unsubscribes `sid` and removes it once messages already in flight
    /// have been delivered. Connection state is unchanged.
    pub fn drain_subscription_with(
        &self,
        sid: SubscriptionId,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) {
        let mut core = self.shared.lock();
        let started = core
            .connection_state()
            .admission()
            .and_then(|()| core.registry.drain_one(sid));
        let timeout = match started {
            Ok(timeout) => timeout,
            Err(error) => {
                drop(core);
                callback(Err(error));
                return;
            }
        };
        core.clear_sub_timer(timeout);
        core.send_control(&ClientOp::Unsub {
            sid: sid.as_u64(),
            max: None,
        });
        core.outbound
            .enqueue_ping(PongAction::DrainSubscription(sid, Box::new(callback)));
        drop(core);
        tracing::debug!(sid = %sid, "draining subscription");
        self.shared.wake_writer();
    }

    pub async fn drain_subscription(&self, sid: SubscriptionId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.drain_subscription_with(sid, move |result| {
            let _ = tx.send(result);
        });
        rx.await.map_err(|_| NatsError::ConnectionClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SubscribeOptions;
    use natsio_protocol::ConnectOptions;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<Result<()>>>>, impl FnOnce(Result<()>) + Send + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        (log, move |r| l.lock().push(r))
    }

    #[test]
    fn test_drain_requires_live_connection() {
        let client = NatsClient::new(ConnectOptions::default()).unwrap();
        let (log, cb) = recorder();
        client.drain_with(cb);
        assert!(matches!(log.lock()[0], Err(NatsError::InvalidState(_))));

        client.close();
        let (log, cb) = recorder();
        client.drain_with(cb);
        assert_eq!(*log.lock(), vec![Err(NatsError::ConnectionClosed)]);
    }

    #[test]
    fn test_drain_subscription_errors_go_to_callback() {
        let client = NatsClient::new(ConnectOptions::default()).unwrap();
        let (log, cb) = recorder();
        client.drain_subscription_with(SubscriptionId(42), cb);
        assert_eq!(*log.lock(), vec![Err(NatsError::UnknownSubscription(42))]);

        let sid = client.subscribe("foo", SubscribeOptions::new(), |_| {}).unwrap();
        let (_, cb) = recorder();
        client.drain_subscription_with(sid, cb);
        let (log, cb) = recorder();
        client.drain_subscription_with(sid, cb);
        assert_eq!(*log.lock(), vec![Err(NatsError::SubscriptionDraining(sid.as_u64()))]);
        assert!(client.subscription(sid).unwrap().draining);
    }

    #[test]
    fn test_flush_after_close_fails() {
        let client = NatsClient::new(ConnectOptions::default()).unwrap();
        client.close();
        let (log, cb) = recorder();
        client.flush_with(cb);
        assert_eq!(*log.lock(), vec![Err(NatsError::ConnectionClosed)]);
    }
}
