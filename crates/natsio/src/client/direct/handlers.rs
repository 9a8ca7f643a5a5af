//! Per-frame handling for an established connection.

use super::SessionEnd;
use crate::callback::Deferred;
use crate::client::state::{Core, PongAction, Shared};
use crate::error::NatsError;
use bytes::Bytes;
use natsio_protocol::frame::PONG_FRAME;
use natsio_protocol::{ConnectionEvent, FrameKind, Message, ServerInfo, ServerOp, SubscriptionId};

/// Applies one server frame. Returns why the session must end, if it must.
pub(super) fn handle_op(shared: &Shared, op: ServerOp) -> Option<SessionEnd> {
    match op {
        ServerOp::Msg(message) => {
            deliver_message(shared, message);
            None
        }
        ServerOp::Ping => {
            shared
                .lock()
                .outbound
                .enqueue(FrameKind::Control, Bytes::from_static(PONG_FRAME));
            shared.wake_writer();
            None
        }
        ServerOp::Pong => {
            handle_pong(shared);
            None
        }
        ServerOp::Ok => None,
        ServerOp::Info(info) => {
            handle_info(shared, *info);
            None
        }
        ServerOp::Err(text) => handle_server_error(shared, &text),
    }
}

fn deliver_message(shared: &Shared, message: Message) {
    let sid = SubscriptionId(message.sid);
    let mut core = shared.lock();
    core.stats.in_msgs += 1;
    core.stats.in_bytes += message.payload.len() as u64;

    if core.mux.is_inbox(sid) {
        core.registry.deliver(sid);
        let Some(delivery) = core.mux.resolve(&message.subject) else {
            tracing::trace!(subject = %message.subject, "dropping reply for unknown request");
            return;
        };
        if delivery.completed {
            core.clear_mux_timer(delivery.timer_id);
        }
        drop(core);
        (delivery.callback)(Ok(message));
        return;
    }

    let Some(delivery) = core.registry.deliver(sid) else {
        tracing::trace!(sid = message.sid, "dropping message for unknown subscription");
        return;
    };
    core.clear_sub_timer(delivery.cleared_timeout);
    if delivery.removed {
        tracing::debug!(sid = message.sid, "subscription reached its message limit");
    }
    drop(core);
    (delivery.callback)(message);
}

fn handle_pong(shared: &Shared) {
    let mut deferred = Deferred::default();
    let close = {
        let mut core = shared.lock();
        core.pings_out = 0;
        match core.outbound.on_pong() {
            Some(action) => complete(&mut core, action, &mut deferred),
            None => {
                tracing::trace!("unsolicited PONG");
                false
            }
        }
    };
    if close {
        shared.shutdown.send_replace(true);
        shared.wake_writer();
    }
    deferred.run(&shared.callbacks);
}

/// Completes the waiter of a returned `PING`. Returns true when the
/// connection must now shut down.
fn complete(core: &mut Core, action: PongAction, deferred: &mut Deferred) -> bool {
    match action {
        PongAction::Keepalive => false,
        PongAction::Flush(cb) => {
            deferred.run_later(move || cb(Ok(())));
            false
        }
        PongAction::DrainSubscription(sid, cb) => {
            if let Some(sub) = core.registry.remove(sid) {
                core.clear_sub_timer(sub.timeout);
            }
            tracing::debug!(sid = %sid, "subscription drained");
            deferred.run_later(move || cb(Ok(())));
            false
        }
        PongAction::DrainConnection(cb) => {
            tracing::debug!("connection drained");
            core.close(deferred);
            deferred.run_later(move || cb(Ok(())));
            true
        }
    }
}

fn handle_info(shared: &Shared, info: ServerInfo) {
    let added = {
        let mut core = shared.lock();
        let added = core.pool.add_discovered(&info.connect_urls);
        core.server_info = Some(info);
        added
    };
    if !added.is_empty() {
        tracing::info!(servers = ?added, "discovered cluster servers");
        shared
            .callbacks
            .emit_event(&ConnectionEvent::ServersDiscovered { servers: added });
    }
}

fn handle_server_error(shared: &Shared, text: &str) -> Option<SessionEnd> {
    let error = NatsError::from_server_error(text);
    if error.is_permission() {
        tracing::warn!(error = %error, "permission violation");
        shared.callbacks.emit_permission_error(&error);
        return None;
    }
    if error.triggers_reconnect() {
        tracing::warn!(error = %error, "server reported a stale connection");
        return Some(SessionEnd::Stale);
    }
    tracing::error!(error = %error, "server error");
    Some(SessionEnd::Fatal(error))
}
