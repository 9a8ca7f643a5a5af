use crate::error::{NatsError, Result};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Draining,
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        matches!(self, Self::Draining)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether new publish, subscribe and request calls are accepted.
    pub fn admission(&self) -> Result<()> {
        match self {
            Self::Closed => Err(NatsError::ConnectionClosed),
            Self::Draining => Err(NatsError::ConnectionDraining),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientInitiated,
    ServerClosed,
    NetworkError(String),
    ProtocolError(String),
    StaleConnection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { server: String },
    Disconnected { reason: DisconnectReason },
    Reconnecting { attempt: u32 },
    Reconnected { server: String },
    ServersDiscovered { servers: Vec<String> },
    Draining,
    Closed,
}

pub type DelayHandler = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

#[derive(Clone)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Attempts per server before it leaves the pool. `None` is unbounded.
    pub max_attempts: Option<u32>,
    pub wait: Duration,
    pub jitter: Duration,
    pub jitter_tls: Duration,
    /// Replaces `wait` plus jitter entirely when set.
    pub delay_handler: Option<DelayHandler>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(10),
            wait: Duration::from_millis(2000),
            jitter: Duration::from_millis(100),
            jitter_tls: Duration::from_millis(1000),
            delay_handler: None,
        }
    }
}

impl fmt::Debug for ReconnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectConfig")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("wait", &self.wait)
            .field("jitter", &self.jitter)
            .field("jitter_tls", &self.jitter_tls)
            .field("delay_handler", &self.delay_handler.is_some())
            .finish()
    }
}

impl ReconnectConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, secure: bool, attempt: u32) -> Duration {
        if let Some(handler) = &self.delay_handler {
            return handler(attempt);
        }
        let jitter = if secure { self.jitter_tls } else { self.jitter };
        self.wait + random_jitter(jitter)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    reconnect_config: ReconnectConfig,
}

impl ConnectionStateMachine {
    #[must_use]
    pub fn new(reconnect_config: ReconnectConfig) -> Self {
        Self {
            state: ConnectionState::Connecting,
            reconnect_config,
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect_config
    }

    /// Applies a lifecycle event. `Closed` is terminal, and `Draining` is
    /// only entered from `Connected`.
    pub fn transition(&mut self, event: &ConnectionEvent) -> ConnectionState {
        if self.state.is_closed() {
            return self.state;
        }
        match event {
            ConnectionEvent::Connected { .. } | ConnectionEvent::Reconnected { .. } => {
                self.state = ConnectionState::Connected;
            }
            ConnectionEvent::Disconnected { reason } => {
                self.state = match (self.state, reason) {
                    (_, DisconnectReason::ClientInitiated) | (ConnectionState::Draining, _) => {
                        ConnectionState::Closed
                    }
                    _ if self.reconnect_config.enabled => {
                        ConnectionState::Reconnecting { attempt: 0 }
                    }
                    _ => ConnectionState::Closed,
                };
            }
            ConnectionEvent::Reconnecting { attempt } => {
                self.state = ConnectionState::Reconnecting { attempt: *attempt };
            }
            ConnectionEvent::Draining => {
                if self.state.is_connected() {
                    self.state = ConnectionState::Draining;
                }
            }
            ConnectionEvent::Closed => {
                self.state = ConnectionState::Closed;
            }
            ConnectionEvent::ServersDiscovered { .. } => {}
        }
        self.state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }
}
