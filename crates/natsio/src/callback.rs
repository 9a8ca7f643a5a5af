use crate::error::NatsError;
use natsio_protocol::{ConnectionEvent, Message};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback invoked for every message delivered to a subscription.
pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked for request replies; timeouts arrive as
/// `Err(NatsError::RequestTimeout)` on the same channel.
pub type ReplyCallback = Arc<dyn Fn(Result<Message, NatsError>) + Send + Sync>;

/// One-shot completion for flush and drain.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), NatsError>) + Send>;

pub type EventCallback = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

pub type ErrorCallback = Arc<dyn Fn(&NatsError) + Send + Sync>;

/// Observer lists for connection lifecycle notifications.
#[derive(Default)]
pub struct CallbackManager {
    events: RwLock<Vec<EventCallback>>,
    errors: RwLock<Vec<ErrorCallback>>,
    permission_errors: RwLock<Vec<ErrorCallback>>,
}

impl CallbackManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&self, callback: EventCallback) {
        self.events.write().push(callback);
    }

    pub fn on_error(&self, callback: ErrorCallback) {
        self.errors.write().push(callback);
    }

    pub fn on_permission_error(&self, callback: ErrorCallback) {
        self.permission_errors.write().push(callback);
    }

    pub fn emit_event(&self, event: &ConnectionEvent) {
        let callbacks = self.events.read().clone();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn emit_error(&self, error: &NatsError) {
        let callbacks = self.errors.read().clone();
        if callbacks.is_empty() {
            tracing::warn!(error = %error, "connection error with no error listener");
        }
        for callback in callbacks {
            callback(error);
        }
    }

    pub fn emit_permission_error(&self, error: &NatsError) {
        let callbacks = self.permission_errors.read().clone();
        if callbacks.is_empty() {
            tracing::warn!(error = %error, "permission violation with no listener");
        }
        for callback in callbacks {
            callback(error);
        }
    }
}

/// Work collected while the engine lock is held and run after it is
/// released, in order.
#[derive(Default)]
pub(crate) struct Deferred {
    effects: Vec<Effect>,
}

enum Effect {
    Run(Box<dyn FnOnce() + Send>),
    Event(ConnectionEvent),
    Error(NatsError),
    Permission(NatsError),
}

impl Deferred {
    pub(crate) fn run_later(&mut self, f: impl FnOnce() + Send + 'static) {
        self.effects.push(Effect::Run(Box::new(f)));
    }

    pub(crate) fn event(&mut self, event: ConnectionEvent) {
        self.effects.push(Effect::Event(event));
    }

    pub(crate) fn error(&mut self, error: NatsError) {
        self.effects.push(Effect::Error(error));
    }

    pub(crate) fn permission_error(&mut self, error: NatsError) {
        self.effects.push(Effect::Permission(error));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub(crate) fn run(self, callbacks: &CallbackManager) {
        for effect in self.effects {
            match effect {
                Effect::Run(f) => f(),
                Effect::Event(event) => callbacks.emit_event(&event),
                Effect::Error(error) => callbacks.emit_error(&error),
                Effect::Permission(error) => callbacks.emit_permission_error(&error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_deferred_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let callbacks = CallbackManager::new();
        let l = Arc::clone(&log);
        callbacks.on_event(Arc::new(move |event| l.lock().push(format!("{event:?}"))));
        let l = Arc::clone(&log);
        callbacks.on_error(Arc::new(move |error| l.lock().push(error.to_string())));

        let mut deferred = Deferred::default();
        let l = Arc::clone(&log);
        deferred.run_later(move || l.lock().push("first".into()));
        deferred.event(ConnectionEvent::Closed);
        deferred.error(NatsError::StaleConnection);
        assert!(!deferred.is_empty());
        deferred.run(&callbacks);

        assert_eq!(
            *log.lock(),
            vec!["first".to_string(), "Closed".to_string(), "Stale connection".to_string()]
        );
    }

    #[test]
    fn test_permission_errors_have_their_own_channel() {
        let callbacks = CallbackManager::new();
        let seen = Arc::new(Mutex::new(0));
        let s = Arc::clone(&seen);
        callbacks.on_permission_error(Arc::new(move |_| *s.lock() += 1));
        callbacks.on_error(Arc::new(|_| panic!("not a fatal error")));
        callbacks.emit_permission_error(&NatsError::PermissionViolation("denied".into()));
        assert_eq!(*seen.lock(), 1);
    }
}
