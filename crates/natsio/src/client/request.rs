//! Request call shapes and handles.
//!
//! A request can be described by the subject alone or by tuples carrying
//! a payload, options and a timeout; all of them normalize to [`Request`].

use super::{enqueue_publish, timer_runtime, NatsClient, TimeoutAction};
use crate::callback::ReplyCallback;
use crate::error::{NatsError, Result};
use bytes::Bytes;
use natsio_protocol::{validate_subject, ClientOp, Message, RequestToken, SubscriptionId, Unsubscribe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::instrument;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Replies to collect before the request completes. `None` means one.
    pub max: Option<u64>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_max(mut self, max: u64) -> Self {
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub subject: String,
    pub payload: Bytes,
    pub options: RequestOptions,
    pub timeout: Option<Duration>,
}

impl Request {
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            payload: Bytes::new(),
            options: RequestOptions::default(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_max(mut self, max: u64) -> Self {
        self.options.max = Some(max);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl From<&str> for Request {
    fn from(subject: &str) -> Self {
        Self::new(subject)
    }
}

impl From<String> for Request {
    fn from(subject: String) -> Self {
        Self::new(subject)
    }
}

impl<S: Into<String>> From<(S, Duration)> for Request {
    fn from((subject, timeout): (S, Duration)) -> Self {
        Self::new(subject).with_timeout(timeout)
    }
}

impl<S: Into<String>, P: Into<Bytes>> From<(S, P, Duration)> for Request {
    fn from((subject, payload, timeout): (S, P, Duration)) -> Self {
        Self::new(subject).with_payload(payload).with_timeout(timeout)
    }
}

impl<S: Into<String>, P: Into<Bytes>> From<(S, P, RequestOptions, Duration)> for Request {
    fn from((subject, payload, options, timeout): (S, P, RequestOptions, Duration)) -> Self {
        Self::new(subject)
            .with_payload(payload)
            .with_options(options)
            .with_timeout(timeout)
    }
}

/// Identifies an in-flight request: a dedicated reply subscription for
/// the legacy style, or a token on the shared inbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestId {
    Subscription(SubscriptionId),
    Muxed(RequestToken),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHandle {
    pub id: RequestId,
    pub max: Option<u64>,
    pub timeout: Option<Duration>,
}

/// What [`cancel_request`](crate::NatsClient::cancel_request) found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledRequest {
    pub max: Option<u64>,
    pub timeout: Option<Duration>,
    /// False when the request had already completed or timed out.
    pub was_pending: bool,
}

impl NatsClient {
    /// Publishes a request and routes replies to `callback`. A timeout is
    /// delivered as `Err(NatsError::RequestTimeout)` on the same callback,
    /// after the request has been cleaned up. Requests with a timeout must
    /// be started inside a tokio runtime.
    pub fn request(
        &self,
        request: impl Into<Request>,
        callback: impl Fn(Result<Message>) + Send + Sync + 'static,
    ) -> Result<RequestHandle> {
        self.start_request(request.into(), Arc::new(callback))
    }

    /// Like [`request`](Self::request) but completes after the first reply.
    pub fn request_one(
        &self,
        request: impl Into<Request>,
        callback: impl Fn(Result<Message>) + Send + Sync + 'static,
    ) -> Result<RequestHandle> {
        let request = request.into().with_max(1);
        self.start_request(request, Arc::new(callback))
    }

    /// Sends a request and waits for its first reply.
    #[instrument(skip(self, payload))]
    pub async fn send_request(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let tx = parking_lot::Mutex::new(Some(tx));
        let request = Request::new(subject)
            .with_payload(payload)
            .with_timeout(timeout);
        self.request_one(request, move |reply| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(reply);
            }
        })?;
        rx.await.map_err(|_| NatsError::ConnectionClosed)?
    }

    /// Stops waiting for replies. Cancelling a request that already
    /// completed is not an error; the result reports `was_pending: false`.
    pub fn cancel_request(&self, handle: &RequestHandle) -> CancelledRequest {
        let mut core = self.shared.lock();
        let cancelled = match &handle.id {
            RequestId::Muxed(token) => match core.mux.cancel(token) {
                Some(entry) => {
                    core.clear_mux_timer(entry.timer_id);
                    CancelledRequest {
                        max: entry.max,
                        timeout: entry.timeout,
                        was_pending: true,
                    }
                }
                None => CancelledRequest {
                    max: handle.max,
                    timeout: handle.timeout,
                    was_pending: false,
                },
            },
            RequestId::Subscription(sid) => {
                let removed = core.registry.remove(*sid);
                let was_pending = removed.is_some();
                if let Some(sub) = removed {
                    core.clear_sub_timer(sub.timeout);
                    core.send_control(&ClientOp::Unsub {
                        sid: sid.as_u64(),
                        max: None,
                    });
                }
                CancelledRequest {
                    max: handle.max,
                    timeout: handle.timeout,
                    was_pending,
                }
            }
        };
        drop(core);
        self.shared.wake_writer();
        cancelled
    }

    fn start_request(&self, request: Request, callback: ReplyCallback) -> Result<RequestHandle> {
        validate_subject(&request.subject)?;
        let handle = if self.shared.options.use_old_request_style {
            self.subscription_request(request, callback)?
        } else {
            self.muxed_request(request, callback)?
        };
        self.shared.wake_writer();
        Ok(handle)
    }

    /// One inbox subscription per request, limited to `max` replies.
    fn subscription_request(&self, request: Request, callback: ReplyCallback) -> Result<RequestHandle> {
        let inbox = self.create_inbox();
        let max = request.options.max.filter(|max| *max > 0).unwrap_or(1);
        let mut core = self.shared.lock();
        core.connection_state().admission()?;

        let on_reply = Arc::clone(&callback);
        let tracked = Arc::clone(&callback);
        let sid = core
            .registry
            .subscribe(&inbox, None, Arc::new(move |msg: Message| on_reply(Ok(msg))))?;
        core.send_control(&ClientOp::Sub {
            subject: inbox.clone(),
            queue: None,
            sid: sid.as_u64(),
        });
        if let Unsubscribe::Deferred { max, .. } = core.registry.unsubscribe(sid, Some(max)) {
            core.send_control(&ClientOp::Unsub {
                sid: sid.as_u64(),
                max: Some(max),
            });
        }

        let armed = match request.timeout {
            Some(after) => {
                self.arm_sub_timeout(&mut core, sid, after, max, TimeoutAction::Request(callback))
            }
            None => Ok(()),
        };
        if let Err(e) = armed.and_then(|()| {
            enqueue_publish(&mut core, &request.subject, Some(&inbox), request.payload)
        }) {
            if let Some(sub) = core.registry.remove(sid) {
                core.clear_sub_timer(sub.timeout);
                core.send_control(&ClientOp::Unsub {
                    sid: sid.as_u64(),
                    max: None,
                });
            }
            return Err(e);
        }
        core.track_inbox_request(sid, tracked);
        tracing::debug!(sid = %sid, subject = %request.subject, "request sent on dedicated inbox");

        Ok(RequestHandle {
            id: RequestId::Subscription(sid),
            max: request.options.max,
            timeout: request.timeout,
        })
    }

    /// Token on the shared inbox; the inbox subscription is created on
    /// first use.
    fn muxed_request(&self, request: Request, callback: ReplyCallback) -> Result<RequestHandle> {
        let runtime = request.timeout.map(|_| timer_runtime()).transpose()?;
        let mut core = self.shared.lock();
        core.connection_state().admission()?;

        if core.mux.inbox_sid().is_none() {
            let subject = format!("{}.*", core.mux.root_or_init(&self.shared.options.inbox_prefix));
            let sid = core.registry.subscribe(&subject, None, Arc::new(|_: Message| {}))?;
            core.mux.set_inbox_sid(sid);
            core.send_control(&ClientOp::Sub {
                subject,
                queue: None,
                sid: sid.as_u64(),
            });
            tracing::debug!(sid = %sid, "created shared request inbox");
        }

        let (token, reply, timer_id) = core
            .mux
            .register(callback, request.options.max, request.timeout);
        if let Err(e) = enqueue_publish(&mut core, &request.subject, Some(&reply), request.payload) {
            core.mux.cancel(&token);
            return Err(e);
        }
        if let (Some(after), Some(timer_id), Some(runtime)) = (request.timeout, timer_id, runtime) {
            self.arm_mux_timeout(&runtime, &mut core, token.clone(), timer_id, after);
        }

        Ok(RequestHandle {
            id: RequestId::Muxed(token),
            max: request.options.max,
            timeout: request.timeout,
        })
    }
}
