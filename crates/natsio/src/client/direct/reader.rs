//! Inbound frame loop.

use super::handlers::handle_op;
use super::SessionEnd;
use crate::client::state::Shared;
use bytes::BytesMut;
use natsio_protocol::{decode_server_op, YieldBudget};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 32 * 1024;

/// Reads and dispatches frames in arrival order until the session ends.
/// Yields to the scheduler whenever the configured budget is spent.
pub(super) async fn read_loop<R>(
    shared: &Shared,
    mut reader: R,
    mut buf: BytesMut,
    signals: &mut mpsc::UnboundedReceiver<SessionEnd>,
) -> SessionEnd
where
    R: AsyncRead + Unpin,
{
    let mut shutdown = shared.shutdown.subscribe();
    let mut budget = YieldBudget::new(shared.options.yield_policy);

    loop {
        loop {
            match decode_server_op(&mut buf) {
                Ok(Some(op)) => {
                    tracing::trace!(op = ?op, "received frame");
                    if let Some(end) = handle_op(shared, op) {
                        return end;
                    }
                    if budget.record_frame() {
                        tokio::task::yield_now().await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "failed to decode server frame");
                    return SessionEnd::Fatal(e);
                }
            }
        }

        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return SessionEnd::Shutdown,
            Some(end) = signals.recv() => return end,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => return SessionEnd::ServerClosed,
                // waiting on the socket already let other tasks run
                Ok(_) => budget.reset(),
                Err(e) => return SessionEnd::Io(e.to_string()),
            },
        }
    }
}
