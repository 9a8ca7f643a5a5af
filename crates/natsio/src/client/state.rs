//! Engine state shared by the public handle and the background tasks.
//!
//! All protocol state lives in one [`Core`] behind a `parking_lot` mutex.
//! Callbacks are never invoked while it is held: mutations collect their
//! effects into a [`Deferred`] that runs after the guard is dropped.

use crate::callback::{CallbackManager, CompletionCallback, Deferred, MessageCallback, ReplyCallback};
use crate::codec::PayloadCodec;
use crate::error::NatsError;
use crate::transport::TlsConfig;
use bytes::{Bytes, BytesMut};
use natsio_protocol::{
    ClientOp, ConnectOptions, ConnectionEvent, ConnectionState, ConnectionStateMachine, FrameKind,
    OutboundBuffer, RequestMux, ServerInfo, ServerPool, SubscriptionId, SubscriptionRegistry,
    ArmedTimeout,
};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};

/// What a `PONG` completes, in `PING` order.
pub(crate) enum PongAction {
    Flush(CompletionCallback),
    Keepalive,
    DrainConnection(CompletionCallback),
    DrainSubscription(SubscriptionId, CompletionCallback),
}

impl PongAction {
    fn fail(self, error: &NatsError, deferred: &mut Deferred) {
        match self {
            Self::Flush(cb) | Self::DrainConnection(cb) | Self::DrainSubscription(_, cb) => {
                let error = error.clone();
                deferred.run_later(move || cb(Err(error)));
            }
            Self::Keepalive => {}
        }
    }
}

/// Message and byte counters for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

pub(crate) struct Core {
    pub(crate) state: ConnectionStateMachine,
    pub(crate) registry: SubscriptionRegistry<MessageCallback>,
    pub(crate) mux: RequestMux<ReplyCallback>,
    pub(crate) outbound: OutboundBuffer<PongAction>,
    pub(crate) pool: ServerPool,
    pub(crate) server_info: Option<ServerInfo>,
    pub(crate) pings_out: u32,
    pub(crate) sub_timers: HashMap<u64, AbortHandle>,
    pub(crate) mux_timers: HashMap<u64, AbortHandle>,
    /// Reply callbacks of dedicated-inbox requests, keyed by inbox sid.
    inbox_requests: HashMap<SubscriptionId, ReplyCallback>,
    pub(crate) stats: Statistics,
    closed_notified: bool,
}

impl Core {
    pub(crate) fn new(options: &ConnectOptions, pool: ServerPool) -> Self {
        Self {
            state: ConnectionStateMachine::new(options.reconnect.clone()),
            registry: SubscriptionRegistry::new(),
            mux: RequestMux::new(),
            outbound: OutboundBuffer::new(options.reconnect_buffer_size),
            pool,
            server_info: None,
            pings_out: 0,
            sub_timers: HashMap::new(),
            mux_timers: HashMap::new(),
            inbox_requests: HashMap::new(),
            stats: Statistics::default(),
            closed_notified: false,
        }
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.state()
    }

    /// A server connection is up and frames can be written to it.
    pub(crate) fn transport_live(&self) -> bool {
        matches!(
            self.state.state(),
            ConnectionState::Connected | ConnectionState::Draining
        )
    }

    /// Queues a SUB/UNSUB frame when a server is attached. While
    /// disconnected the registry is the source of truth and is replayed
    /// on the next connection.
    pub(crate) fn send_control(&mut self, op: &ClientOp) -> bool {
        if !self.transport_live() {
            return false;
        }
        self.outbound.enqueue(FrameKind::Control, op.to_bytes());
        true
    }

    pub(crate) fn clear_sub_timer(&mut self, armed: Option<ArmedTimeout>) {
        if let Some(armed) = armed {
            if let Some(handle) = self.sub_timers.remove(&armed.timer_id) {
                handle.abort();
            }
        }
    }

    pub(crate) fn clear_mux_timer(&mut self, timer_id: Option<u64>) {
        if let Some(handle) = timer_id.and_then(|id| self.mux_timers.remove(&id)) {
            handle.abort();
        }
    }

    /// SUB frames, each followed by `UNSUB sid remaining` when limited,
    /// restoring every live subscription on a new server.
    pub(crate) fn replay_frames(&self) -> Vec<Bytes> {
        self.registry
            .replay()
            .into_iter()
            .map(|entry| {
                let mut buf = BytesMut::new();
                ClientOp::Sub {
                    subject: entry.subject,
                    queue: entry.queue,
                    sid: entry.sid.as_u64(),
                }
                .encode(&mut buf);
                if let Some(remaining) = entry.remaining {
                    ClientOp::Unsub {
                        sid: entry.sid.as_u64(),
                        max: Some(remaining),
                    }
                    .encode(&mut buf);
                }
                buf.freeze()
            })
            .collect()
    }

    /// Remembers a dedicated-inbox request so closing can fail it. Entries
    /// whose subscription already ended are dropped here.
    pub(crate) fn track_inbox_request(&mut self, sid: SubscriptionId, callback: ReplyCallback) {
        let registry = &self.registry;
        self.inbox_requests.retain(|sid, _| registry.contains(*sid));
        self.inbox_requests.insert(sid, callback);
    }

    /// Moves to `Closed` and releases everything. Pending flush, drain and
    /// request callbacks fail with `ConnectionClosed`. Returns false if the
    /// core was already closed.
    pub(crate) fn close(&mut self, deferred: &mut Deferred) -> bool {
        if self.closed_notified {
            return false;
        }
        self.closed_notified = true;
        self.state.transition(&ConnectionEvent::Closed);

        for sub in self.registry.close() {
            self.clear_sub_timer(sub.timeout);
            if let Some(callback) = self.inbox_requests.remove(&sub.sid) {
                deferred.run_later(move || callback(Err(NatsError::ConnectionClosed)));
            }
        }
        self.inbox_requests.clear();
        for (_, handle) in self.sub_timers.drain() {
            handle.abort();
        }
        for entry in self.mux.clear() {
            let callback = entry.callback;
            deferred.run_later(move || callback(Err(NatsError::ConnectionClosed)));
        }
        for (_, handle) in self.mux_timers.drain() {
            handle.abort();
        }
        for action in self.outbound.close() {
            action.fail(&NatsError::ConnectionClosed, deferred);
        }
        deferred.event(ConnectionEvent::Closed);
        tracing::debug!("connection closed");
        true
    }
}

pub(crate) struct Shared {
    pub(crate) options: ConnectOptions,
    pub(crate) core: Mutex<Core>,
    pub(crate) callbacks: CallbackManager,
    pub(crate) codec: Arc<dyn PayloadCodec>,
    pub(crate) tls: RwLock<Option<TlsConfig>>,
    pub(crate) write_ready: Notify,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) driver: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(options: ConnectOptions, pool: ServerPool, codec: Arc<dyn PayloadCodec>) -> Self {
        let core = Core::new(&options, pool);
        let (shutdown, _) = watch::channel(false);
        Self {
            options,
            core: Mutex::new(core),
            callbacks: CallbackManager::new(),
            codec,
            tls: RwLock::new(None),
            write_ready: Notify::new(),
            shutdown,
            driver: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock()
    }

    /// Wakes the writer; a wake-up with nothing pending is harmless.
    pub(crate) fn wake_writer(&self) {
        self.write_ready.notify_one();
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Closes the engine and stops the background tasks. Idempotent.
    pub(crate) fn close(&self) {
        let mut deferred = Deferred::default();
        self.lock().close(&mut deferred);
        self.shutdown.send_replace(true);
        self.wake_writer();
        deferred.run(&self.callbacks);
    }
}
