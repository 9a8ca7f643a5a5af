use super::SessionEnd;
use crate::client::state::Shared;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Upper bound on one coalesced write.
const MAX_WRITE_BYTES: usize = 64 * 1024;

/// Drains the outbound queue into the socket. Frames are taken under the
/// engine lock and written without it.
pub(super) async fn writer_task<W>(
    shared: Arc<Shared>,
    mut writer: W,
    signals: mpsc::UnboundedSender<SessionEnd>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let chunk = shared.lock().outbound.take_writable(MAX_WRITE_BYTES);
        let Some(chunk) = chunk else {
            if shared.is_shutdown() {
                let _ = writer.shutdown().await;
                return;
            }
            shared.write_ready.notified().await;
            continue;
        };

        let result = async {
            writer.write_all(&chunk).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, bytes = chunk.len(), "write failed");
            let _ = signals.send(SessionEnd::Io(e.to_string()));
            return;
        }
        tracing::trace!(bytes = chunk.len(), "wrote frames");
    }
}
