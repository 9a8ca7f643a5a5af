use crate::error::{NatsError, Result};
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens a TCP connection with `TCP_NODELAY` set, bounded by `timeout`.
pub async fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| NatsError::Timeout)??;
    stream.set_nodelay(true)?;
    tracing::debug!(host, port, "TCP connection established");
    Ok(stream)
}
