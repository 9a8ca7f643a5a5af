//! Opening a server connection: TCP, `INFO`, optional TLS upgrade,
//! `CONNECT`, and the `PING`/`PONG` round trip that confirms it.

use crate::client::state::Shared;
use crate::error::{NatsError, Result};
use crate::transport::{connect_tcp, TlsConfig, Transport};
use bytes::BytesMut;
use natsio_protocol::handshake::{build_connect, check_server_info};
use natsio_protocol::{decode_server_op, Authenticator, ClientOp, Server, ServerInfo, ServerOp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// A connection that completed the handshake.
pub(super) struct Established {
    pub(super) transport: Transport,
    pub(super) info: ServerInfo,
    /// Bytes read past the handshake `PONG`.
    pub(super) leftover: BytesMut,
}

#[derive(Debug)]
pub(super) struct AttemptError {
    /// The TCP connection was accepted; the failure came later.
    pub(super) opened: bool,
    pub(super) error: NatsError,
}

impl AttemptError {
    fn refused(error: NatsError) -> Self {
        Self {
            opened: false,
            error,
        }
    }

    fn opened(error: NatsError) -> Self {
        Self {
            opened: true,
            error,
        }
    }
}

pub(super) async fn establish(
    shared: &Shared,
    server: &Server,
    auth: &dyn Authenticator,
) -> std::result::Result<Established, AttemptError> {
    let options = &shared.options;
    let timeout = options.connect_timeout;

    let mut tcp = connect_tcp(server.host(), server.port(), timeout)
        .await
        .map_err(AttemptError::refused)?;

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let info = match tokio::time::timeout(timeout, read_op(&mut tcp, &mut buf)).await {
        Ok(Ok(ServerOp::Info(info))) => *info,
        Ok(Ok(other)) => {
            return Err(AttemptError::opened(NatsError::ProtocolError(format!(
                "expected INFO, got {other:?}"
            ))))
        }
        Ok(Err(e)) => return Err(AttemptError::opened(e)),
        Err(_) => return Err(AttemptError::opened(NatsError::Timeout)),
    };
    tracing::debug!(
        server = %server.url,
        server_id = %info.server_id,
        proto = info.proto,
        tls_required = info.tls_required,
        "received server info"
    );

    let tls_config = shared.tls.read().clone();
    let tls_requested = options.tls_required || server.is_tls() || tls_config.is_some();
    let upgrade = check_server_info(&info, tls_requested, options.no_echo, auth)
        .map_err(AttemptError::opened)?;

    let mut transport = if upgrade {
        let config = tls_config.unwrap_or_else(TlsConfig::new);
        let stream = config
            .upgrade(tcp, server.host())
            .await
            .map_err(AttemptError::opened)?;
        tracing::debug!(server = %server.url, "upgraded connection to TLS");
        Transport::Tls(Box::new(stream))
    } else {
        Transport::Tcp(tcp)
    };

    let connect = build_connect(options, &info, auth, server, upgrade).map_err(AttemptError::opened)?;
    let mut frames = BytesMut::new();
    ClientOp::Connect(Box::new(connect)).encode(&mut frames);
    ClientOp::Ping.encode(&mut frames);

    let confirm = async {
        transport.write_all(&frames).await?;
        transport.flush().await?;
        await_pong(&mut transport, &mut buf).await
    };
    match tokio::time::timeout(timeout, confirm).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(AttemptError::opened(e)),
        Err(_) => return Err(AttemptError::opened(NatsError::Timeout)),
    }

    Ok(Established {
        transport,
        info,
        leftover: buf,
    })
}

/// Waits for the `PONG` answering the handshake `PING`. `-ERR` here
/// means the server rejected `CONNECT`.
async fn await_pong<S>(stream: &mut S, buf: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match read_op(stream, buf).await? {
            ServerOp::Pong => return Ok(()),
            ServerOp::Err(text) => return Err(NatsError::from_server_error(&text)),
            ServerOp::Ping => {
                stream.write_all(natsio_protocol::frame::PONG_FRAME).await?;
            }
            ServerOp::Ok | ServerOp::Info(_) => {}
            ServerOp::Msg(msg) => {
                tracing::warn!(subject = %msg.subject, "message received before handshake completed");
            }
        }
    }
}

async fn read_op<S>(stream: &mut S, buf: &mut BytesMut) -> Result<ServerOp>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(op) = decode_server_op(buf)? {
            return Ok(op);
        }
        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            return Err(NatsError::Io("connection closed during handshake".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_read_op_across_chunks() {
        let (mut client, mut server) = duplex(64);
        tokio::spawn(async move {
            server.write_all(b"INFO {\"server_id\":\"a\",").await.unwrap();
            server.write_all(b"\"proto\":1}\r\nPONG\r\n").await.unwrap();
        });
        let mut buf = BytesMut::new();
        let op = read_op(&mut client, &mut buf).await.unwrap();
        assert!(matches!(op, ServerOp::Info(info) if info.server_id == "a"));
        assert_eq!(read_op(&mut client, &mut buf).await.unwrap(), ServerOp::Pong);
    }

    #[tokio::test]
    async fn test_await_pong_maps_server_error() {
        let (mut client, mut server) = duplex(256);
        tokio::spawn(async move {
            server
                .write_all(b"-ERR 'Authorization Violation'\r\n")
                .await
                .unwrap();
        });
        let mut buf = BytesMut::new();
        let err = await_pong(&mut client, &mut buf).await.unwrap_err();
        assert!(matches!(err, NatsError::AuthorizationViolation(_)));
    }

    #[tokio::test]
    async fn test_await_pong_keeps_trailing_bytes() {
        let (mut client, mut server) = duplex(256);
        tokio::spawn(async move {
            server.write_all(b"+OK\r\nPONG\r\nPING\r\n").await.unwrap();
        });
        let mut buf = BytesMut::new();
        await_pong(&mut client, &mut buf).await.unwrap();
        assert_eq!(&buf[..], b"PING\r\n");
    }
}
