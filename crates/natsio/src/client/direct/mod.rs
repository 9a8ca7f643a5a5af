//! Connection driver: server rotation, handshake, per-connection tasks,
//! and the reconnect loop.
//!
//! One driver task runs per client. For each live connection it spawns a
//! writer and a keepalive task and runs the reader inline, so inbound
//! frames are handled strictly in arrival order.

mod handlers;
mod handshake;
mod keepalive;
mod reader;
mod writer;

use crate::auth_handlers::resolve_authenticator;
use crate::callback::Deferred;
use crate::client::state::Shared;
use crate::error::{NatsError, Result};
use handshake::{establish, Established};
use keepalive::keepalive_task;
use natsio_protocol::{Authenticator, ConnectionEvent, DisconnectReason, Server};
use reader::read_loop;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use writer::writer_task;

/// Why a live connection ended.
#[derive(Debug)]
pub(super) enum SessionEnd {
    /// The client closed or finished draining.
    Shutdown,
    ServerClosed,
    Io(String),
    Stale,
    /// Unrecoverable server or protocol error; the client closes.
    Fatal(NatsError),
}

impl SessionEnd {
    fn reason(&self) -> DisconnectReason {
        match self {
            Self::Shutdown => DisconnectReason::ClientInitiated,
            Self::ServerClosed => DisconnectReason::ServerClosed,
            Self::Io(e) => DisconnectReason::NetworkError(e.clone()),
            Self::Stale => DisconnectReason::StaleConnection,
            Self::Fatal(e) => DisconnectReason::ProtocolError(e.to_string()),
        }
    }
}

/// The most recent failure, and whether listeners already saw it.
struct LastError {
    error: NatsError,
    reported: bool,
}

struct Driver {
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    ready: Option<oneshot::Sender<Result<()>>>,
    connected_once: bool,
    /// Attempts made before the first successful connection.
    initial_attempts: usize,
    initial_refused: usize,
    initial_servers: usize,
    attempt: u32,
    last_error: Option<LastError>,
}

/// Runs the connection until the client closes. `ready` receives the
/// outcome of the initial connect.
pub(crate) async fn run(shared: Arc<Shared>, ready: oneshot::Sender<Result<()>>) {
    let auth = match resolve_authenticator(&shared.options).await {
        Ok(auth) => auth,
        Err(e) => {
            tracing::error!(error = %e, "failed to resolve credentials");
            let _ = ready.send(Err(e));
            shared.close();
            return;
        }
    };
    let initial_servers = shared.lock().pool.len();
    let mut driver = Driver {
        shutdown: shared.shutdown.subscribe(),
        shared,
        ready: Some(ready),
        connected_once: false,
        initial_attempts: 0,
        initial_refused: 0,
        initial_servers,
        attempt: 0,
        last_error: None,
    };
    driver.run(auth.as_ref()).await;
}

impl Driver {
    fn first_pass_done(&self) -> bool {
        self.initial_attempts >= self.initial_servers
    }

    async fn run(&mut self, auth: &dyn Authenticator) {
        loop {
            if self.shared.is_shutdown() {
                return;
            }

            let reconnecting = self.connected_once || self.first_pass_done();
            if reconnecting && !self.shared.options.reconnect.enabled {
                self.give_up();
                return;
            }

            let Some((server, wait)) = self.select_server(reconnecting) else {
                self.give_up();
                return;
            };
            if !wait.is_zero() {
                tracing::debug!(server = %server.url, wait = ?wait, "waiting before reconnect attempt");
                if !self.sleep(wait).await {
                    return;
                }
            }

            let mut shutdown = self.shutdown.clone();
            let attempt = tokio::select! {
                result = establish(&self.shared, &server, auth) => result,
                _ = shutdown.wait_for(|closed| *closed) => return,
            };

            match attempt {
                Ok(established) => {
                    let end = self.run_session(established, &server).await;
                    if !self.after_session(end) {
                        return;
                    }
                }
                Err(failure) => {
                    tracing::warn!(server = %server.url, opened = failure.opened, error = %failure.error, "connection attempt failed");
                    if !self.connected_once && !self.first_pass_done() {
                        self.initial_attempts += 1;
                        if !failure.opened {
                            self.initial_refused += 1;
                        }
                    }
                    let reported = failure.opened;
                    if reported {
                        self.shared.callbacks.emit_error(&failure.error);
                    }
                    let rejected = failure.opened && failure.error.rejects_handshake();
                    self.last_error = Some(LastError {
                        error: failure.error,
                        reported,
                    });
                    if rejected {
                        tracing::error!(server = %server.url, "server rejected the handshake");
                        self.give_up();
                        return;
                    }

                    let all_refused = self.initial_refused == self.initial_servers;
                    if !self.connected_once
                        && self.first_pass_done()
                        && all_refused
                        && !self.shared.options.wait_on_first_connect
                    {
                        tracing::error!("no server accepted the initial connection");
                        self.give_up();
                        return;
                    }
                }
            }
        }
    }

    /// Picks the next server and how long to wait before dialing it.
    fn select_server(&mut self, reconnecting: bool) -> Option<(Server, Duration)> {
        let mut deferred = Deferred::default();
        let selected = {
            let mut core = self.shared.lock();
            let config = core.state.reconnect_config().clone();
            let server = core.pool.next_server(config.max_attempts)?;
            let wait = match server.last_attempt {
                Some(last) => config
                    .delay(server.is_tls(), self.attempt)
                    .saturating_sub(last.elapsed()),
                None => Duration::ZERO,
            };
            core.pool.mark_attempt(reconnecting);
            if self.connected_once {
                self.attempt += 1;
                let event = ConnectionEvent::Reconnecting {
                    attempt: self.attempt,
                };
                core.state.transition(&event);
                deferred.event(event);
            }
            Some((server, wait))
        };
        deferred.run(&self.shared.callbacks);
        selected
    }

    /// Sleeps unless the client shuts down first. Returns false on shutdown.
    async fn sleep(&mut self, wait: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(wait) => true,
            _ = self.shutdown.wait_for(|closed| *closed) => false,
        }
    }

    async fn run_session(&mut self, established: Established, server: &Server) -> SessionEnd {
        let Established {
            transport,
            info,
            leftover,
        } = established;
        let reconnected = self.connected_once;
        let url = server.url.to_string();

        let mut deferred = Deferred::default();
        {
            let mut core = self.shared.lock();
            if core.connection_state().is_closed() {
                return SessionEnd::Shutdown;
            }
            core.pool.mark_connected();
            let discovered = core.pool.add_discovered(&info.connect_urls);
            if !discovered.is_empty() {
                deferred.event(ConnectionEvent::ServersDiscovered {
                    servers: discovered,
                });
            }
            core.server_info = Some(info);
            core.pings_out = 0;
            let replay = core.replay_frames();
            tracing::debug!(subscriptions = replay.len(), "restoring subscriptions");
            core.outbound.rebuild_for_reconnect(replay);

            let event = if reconnected {
                core.stats.reconnects += 1;
                ConnectionEvent::Reconnected { server: url.clone() }
            } else {
                ConnectionEvent::Connected { server: url.clone() }
            };
            core.state.transition(&event);
            deferred.event(event);
        }
        tracing::info!(server = %url, reconnected, "connected");

        self.connected_once = true;
        self.attempt = 0;
        self.last_error = None;
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
        deferred.run(&self.shared.callbacks);

        let (read_half, write_half) = tokio::io::split(transport);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(
            Arc::clone(&self.shared),
            write_half,
            signal_tx.clone(),
        ));
        let keepalive = tokio::spawn(keepalive_task(Arc::clone(&self.shared), signal_tx));
        self.shared.wake_writer();

        let end = read_loop(&self.shared, read_half, leftover, &mut signal_rx).await;

        keepalive.abort();
        if matches!(end, SessionEnd::Shutdown) {
            // let the writer flush what the shutdown left queued
            self.shared.wake_writer();
            let _ = writer.await;
        } else {
            writer.abort();
        }
        end
    }

    /// Handles the end of a session. Returns whether to keep rotating.
    fn after_session(&mut self, end: SessionEnd) -> bool {
        tracing::info!(reason = ?end, "disconnected");
        if let SessionEnd::Fatal(error) = &end {
            self.shared.callbacks.emit_error(error);
        }

        let reason = end.reason();
        let state = {
            let mut core = self.shared.lock();
            core.state.transition(&ConnectionEvent::Disconnected {
                reason: reason.clone(),
            })
        };
        self.shared
            .callbacks
            .emit_event(&ConnectionEvent::Disconnected { reason });

        if matches!(end, SessionEnd::Shutdown | SessionEnd::Fatal(_)) || state.is_closed() {
            self.shared.close();
            return false;
        }
        true
    }

    /// Closes after the rotation is exhausted or the initial connect
    /// failed. The final error is surfaced exactly once.
    fn give_up(&mut self) {
        let last = self.last_error.take().unwrap_or(LastError {
            error: NatsError::NoServersAvailable,
            reported: false,
        });
        tracing::error!(error = %last.error, "giving up on connecting");
        match self.ready.take() {
            Some(ready) => {
                let _ = ready.send(Err(last.error));
            }
            None if !last.reported => self.shared.callbacks.emit_error(&last.error),
            None => {}
        }
        self.shared.close();
    }
}
