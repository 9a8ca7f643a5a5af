//! Incremental decoding of protocol frames from a byte buffer.
//!
//! Decoders consume a complete frame from the front of the buffer and
//! return `Ok(None)` without consuming anything when more bytes are needed.

use crate::error::{NatsError, Result};
use crate::frame::{ClientOp, ServerOp};
use crate::info::{ConnectInfo, ServerInfo};
use crate::message::Message;
use bytes::{Buf, BytesMut};

pub const MAX_CONTROL_LINE: usize = 4096;

/// Largest payload size accepted in a MSG or PUB control line. Servers cap
/// `max_payload` at 64 MiB.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Locates the control line at the front of `buf`, or errors when it grows
/// past `MAX_CONTROL_LINE` without a terminator.
fn control_line(buf: &BytesMut) -> Result<Option<(usize, String)>> {
    match find_crlf(buf) {
        Some(end) => {
            let line = std::str::from_utf8(&buf[..end])
                .map_err(|_| NatsError::ProtocolError("control line is not valid UTF-8".into()))?;
            Ok(Some((end, line.to_string())))
        }
        None if buf.len() > MAX_CONTROL_LINE => Err(NatsError::ProtocolError(format!(
            "control line exceeds {MAX_CONTROL_LINE} bytes"
        ))),
        None => Ok(None),
    }
}

fn split_op(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.find([' ', '\t']) {
        Some(idx) => (&line[..idx], line[idx..].trim()),
        None => (line, ""),
    }
}

fn parse_u64(value: &str, what: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| NatsError::ProtocolError(format!("invalid {what}: {value:?}")))
}

fn parse_size(value: &str) -> Result<usize> {
    let size = value
        .parse::<usize>()
        .map_err(|_| NatsError::ProtocolError(format!("invalid payload size: {value:?}")))?;
    if size > MAX_FRAME_PAYLOAD {
        return Err(NatsError::ProtocolError(format!(
            "payload size {size} exceeds {MAX_FRAME_PAYLOAD} bytes"
        )));
    }
    Ok(size)
}

/// Takes `len` payload bytes plus trailing CRLF after a control line of
/// `line_end` bytes. Returns `None` if the buffer is still short.
fn take_payload(buf: &mut BytesMut, line_end: usize, len: usize) -> Result<Option<bytes::Bytes>> {
    let header = line_end + 2;
    let total = header
        .checked_add(len)
        .and_then(|n| n.checked_add(2))
        .ok_or_else(|| NatsError::ProtocolError(format!("payload size {len} overflows")))?;
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header + len..total] != b"\r\n" {
        return Err(NatsError::ProtocolError(
            "payload not terminated by CRLF".into(),
        ));
    }
    buf.advance(header);
    let payload = buf.split_to(len).freeze();
    buf.advance(2);
    Ok(Some(payload))
}

/// Decodes one server operation from the front of `buf`.
pub fn decode_server_op(buf: &mut BytesMut) -> Result<Option<ServerOp>> {
    let Some((end, line)) = control_line(buf)? else {
        return Ok(None);
    };
    let (op, args) = split_op(&line);

    if op.eq_ignore_ascii_case("MSG") {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, sid, reply, size) = match parts.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply, size] => (*subject, *sid, Some(*reply), *size),
            _ => {
                return Err(NatsError::ProtocolError(format!(
                    "malformed MSG arguments: {args:?}"
                )))
            }
        };
        let sid = parse_u64(sid, "sid")?;
        let len = parse_size(size)?;
        let Some(payload) = take_payload(buf, end, len)? else {
            return Ok(None);
        };
        return Ok(Some(ServerOp::Msg(Message {
            subject: subject.to_string(),
            sid,
            reply: reply.map(str::to_string),
            payload,
        })));
    }

    let op = if op.eq_ignore_ascii_case("PING") {
        ServerOp::Ping
    } else if op.eq_ignore_ascii_case("PONG") {
        ServerOp::Pong
    } else if op.eq_ignore_ascii_case("+OK") {
        ServerOp::Ok
    } else if op.eq_ignore_ascii_case("-ERR") {
        ServerOp::Err(args.trim_matches('\'').to_string())
    } else if op.eq_ignore_ascii_case("INFO") {
        let info: ServerInfo = serde_json::from_str(args)
            .map_err(|e| NatsError::ProtocolError(format!("invalid INFO: {e}")))?;
        ServerOp::Info(Box::new(info))
    } else {
        return Err(NatsError::ProtocolError(format!(
            "unknown server operation: {op:?}"
        )));
    };
    buf.advance(end + 2);
    Ok(Some(op))
}

/// Decodes one client operation from the front of `buf`. Used by servers
/// speaking the protocol, including the in-process test server.
pub fn decode_client_op(buf: &mut BytesMut) -> Result<Option<ClientOp>> {
    let Some((end, line)) = control_line(buf)? else {
        return Ok(None);
    };
    let (op, args) = split_op(&line);

    if op.eq_ignore_ascii_case("PUB") {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, reply, size) = match parts.as_slice() {
            [subject, size] => (*subject, None, *size),
            [subject, reply, size] => (*subject, Some(*reply), *size),
            _ => {
                return Err(NatsError::ProtocolError(format!(
                    "malformed PUB arguments: {args:?}"
                )))
            }
        };
        let len = parse_size(size)?;
        let Some(payload) = take_payload(buf, end, len)? else {
            return Ok(None);
        };
        return Ok(Some(ClientOp::Pub {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        }));
    }

    let op = if op.eq_ignore_ascii_case("SUB") {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        match parts.as_slice() {
            [subject, sid] => ClientOp::Sub {
                subject: (*subject).to_string(),
                queue: None,
                sid: parse_u64(sid, "sid")?,
            },
            [subject, queue, sid] => ClientOp::Sub {
                subject: (*subject).to_string(),
                queue: Some((*queue).to_string()),
                sid: parse_u64(sid, "sid")?,
            },
            _ => {
                return Err(NatsError::ProtocolError(format!(
                    "malformed SUB arguments: {args:?}"
                )))
            }
        }
    } else if op.eq_ignore_ascii_case("UNSUB") {
        let parts: Vec<&str> = args.split_ascii_whitespace().collect();
        match parts.as_slice() {
            [sid] => ClientOp::Unsub {
                sid: parse_u64(sid, "sid")?,
                max: None,
            },
            [sid, max] => ClientOp::Unsub {
                sid: parse_u64(sid, "sid")?,
                max: Some(parse_u64(max, "max")?),
            },
            _ => {
                return Err(NatsError::ProtocolError(format!(
                    "malformed UNSUB arguments: {args:?}"
                )))
            }
        }
    } else if op.eq_ignore_ascii_case("PING") {
        ClientOp::Ping
    } else if op.eq_ignore_ascii_case("PONG") {
        ClientOp::Pong
    } else if op.eq_ignore_ascii_case("CONNECT") {
        let info: ConnectInfo = serde_json::from_str(args)
            .map_err(|e| NatsError::ProtocolError(format!("invalid CONNECT: {e}")))?;
        ClientOp::Connect(Box::new(info))
    } else {
        return Err(NatsError::ProtocolError(format!(
            "unknown client operation: {op:?}"
        )));
    };
    buf.advance(end + 2);
    Ok(Some(op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn buf(data: &[u8]) -> BytesMut {
        BytesMut::from(data)
    }

    #[test]
    fn test_decode_info() {
        let mut b = buf(b"INFO {\"server_id\":\"TEST\",\"proto\":1,\"connect_urls\":[\"a:1\"]}\r\n");
        let op = decode_server_op(&mut b).unwrap().unwrap();
        let ServerOp::Info(info) = op else {
            panic!("expected INFO");
        };
        assert_eq!(info.server_id, "TEST");
        assert_eq!(info.connect_urls, vec!["a:1".to_string()]);
        assert!(b.is_empty());
    }

    #[test]
    fn test_decode_msg_with_and_without_reply() {
        let mut b = buf(b"MSG foo 1 5\r\nhello\r\nMSG foo.bar 2 _INBOX.x 2\r\nhi\r\n");
        let first = decode_server_op(&mut b).unwrap().unwrap();
        assert_eq!(
            first,
            ServerOp::Msg(Message::new("foo", 1, Bytes::from_static(b"hello")))
        );
        let second = decode_server_op(&mut b).unwrap().unwrap();
        assert_eq!(
            second,
            ServerOp::Msg(
                Message::new("foo.bar", 2, Bytes::from_static(b"hi")).with_reply("_INBOX.x")
            )
        );
        assert!(b.is_empty());
    }

    #[test]
    fn test_partial_msg_is_not_consumed() {
        let mut b = buf(b"MSG foo 1 10\r\nhel");
        assert!(decode_server_op(&mut b).unwrap().is_none());
        assert_eq!(b.len(), 17);
        b.extend_from_slice(b"lo worl");
        assert!(decode_server_op(&mut b).unwrap().is_none());
        b.extend_from_slice(b"\r\n");
        let op = decode_server_op(&mut b).unwrap().unwrap();
        let ServerOp::Msg(msg) = op else {
            panic!("expected MSG");
        };
        assert_eq!(&msg.payload[..], b"hello worl");
    }

    #[test]
    fn test_payload_may_contain_crlf() {
        let mut b = buf(b"MSG foo 1 4\r\na\r\nb\r\n");
        let ServerOp::Msg(msg) = decode_server_op(&mut b).unwrap().unwrap() else {
            panic!("expected MSG");
        };
        assert_eq!(&msg.payload[..], b"a\r\nb");
    }

    #[test]
    fn test_decode_control_ops() {
        let mut b = buf(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Authorization Violation'\r\n");
        assert_eq!(decode_server_op(&mut b).unwrap(), Some(ServerOp::Ping));
        assert_eq!(decode_server_op(&mut b).unwrap(), Some(ServerOp::Pong));
        assert_eq!(decode_server_op(&mut b).unwrap(), Some(ServerOp::Ok));
        assert_eq!(
            decode_server_op(&mut b).unwrap(),
            Some(ServerOp::Err("Authorization Violation".into()))
        );
        assert_eq!(decode_server_op(&mut b).unwrap(), None);
    }

    #[test]
    fn test_lowercase_ops_accepted() {
        let mut b = buf(b"ping\r\nmsg foo 1 0\r\n\r\n");
        assert_eq!(decode_server_op(&mut b).unwrap(), Some(ServerOp::Ping));
        assert!(matches!(
            decode_server_op(&mut b).unwrap(),
            Some(ServerOp::Msg(_))
        ));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode_server_op(&mut buf(b"BOGUS\r\n")).is_err());
        assert!(decode_server_op(&mut buf(b"MSG foo\r\n")).is_err());
        assert!(decode_server_op(&mut buf(b"MSG foo x 1\r\na\r\n")).is_err());
        assert!(decode_server_op(&mut buf(b"MSG foo 1 1\r\nabXX")).is_err());
        let long = vec![b'A'; MAX_CONTROL_LINE + 1];
        assert!(decode_server_op(&mut buf(&long)).is_err());
    }

    #[test]
    fn test_oversized_payload_length_rejected() {
        let mut b = buf(b"MSG foo 1 18446744073709551615\r\nabc\r\n");
        assert!(matches!(
            decode_server_op(&mut b),
            Err(NatsError::ProtocolError(_))
        ));
        let line = format!("MSG foo 1 {}\r\n", MAX_FRAME_PAYLOAD + 1);
        assert!(matches!(
            decode_server_op(&mut buf(line.as_bytes())),
            Err(NatsError::ProtocolError(_))
        ));
        assert!(matches!(
            decode_client_op(&mut buf(b"PUB foo 99999999999999999999\r\n")),
            Err(NatsError::ProtocolError(_))
        ));
        let mut partial = buf(format!("MSG foo 1 {MAX_FRAME_PAYLOAD}\r\nab").as_bytes());
        assert!(decode_server_op(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_decode_client_ops() {
        let mut b = buf(
            b"CONNECT {\"verbose\":false,\"echo\":false}\r\nSUB foo q 1\r\nUNSUB 1 5\r\nPUB foo bar 3\r\nabc\r\nPING\r\n",
        );
        let ClientOp::Connect(connect) = decode_client_op(&mut b).unwrap().unwrap() else {
            panic!("expected CONNECT");
        };
        assert_eq!(connect.echo, Some(false));
        assert_eq!(
            decode_client_op(&mut b).unwrap(),
            Some(ClientOp::Sub {
                subject: "foo".into(),
                queue: Some("q".into()),
                sid: 1
            })
        );
        assert_eq!(
            decode_client_op(&mut b).unwrap(),
            Some(ClientOp::Unsub { sid: 1, max: Some(5) })
        );
        assert_eq!(
            decode_client_op(&mut b).unwrap(),
            Some(ClientOp::Pub {
                subject: "foo".into(),
                reply: Some("bar".into()),
                payload: Bytes::from_static(b"abc")
            })
        );
        assert_eq!(decode_client_op(&mut b).unwrap(), Some(ClientOp::Ping));
        assert!(b.is_empty());
    }

    proptest! {
        #[test]
        fn prop_pub_frames_survive_arbitrary_split(
            payload in prop::collection::vec(any::<u8>(), 0..256),
            split in 0usize..300
        ) {
            let op = ClientOp::Pub {
                subject: "foo.bar".into(),
                reply: Some("_INBOX.1".into()),
                payload: Bytes::from(payload),
            };
            let encoded = op.to_bytes();
            let split = split.min(encoded.len());

            let mut b = BytesMut::from(&encoded[..split]);
            let early = decode_client_op(&mut b).unwrap();
            if split < encoded.len() {
                prop_assert!(early.is_none());
                b.extend_from_slice(&encoded[split..]);
                prop_assert_eq!(decode_client_op(&mut b).unwrap(), Some(op));
            } else {
                prop_assert_eq!(early, Some(op));
            }
            prop_assert!(b.is_empty());
        }
    }
}
