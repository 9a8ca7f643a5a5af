//! Protocol operations exchanged between client and server.
//!
//! All frames are ASCII control lines terminated by CRLF. `PUB` and `MSG`
//! carry a payload of the advertised length followed by another CRLF.

use crate::info::{ConnectInfo, ServerInfo};
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};

pub const CRLF: &[u8] = b"\r\n";
pub const PING_FRAME: &[u8] = b"PING\r\n";
pub const PONG_FRAME: &[u8] = b"PONG\r\n";

/// Operations sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg(Message),
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Operations sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(Box<ConnectInfo>),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

impl ClientOp {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Connect(info) => {
                buf.put_slice(b"CONNECT ");
                // ConnectInfo holds only strings, bools and integers
                let json = serde_json::to_vec(info.as_ref()).unwrap_or_else(|_| b"{}".to_vec());
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            Self::Pub {
                subject,
                reply,
                payload,
            } => {
                buf.reserve(subject.len() + payload.len() + 32);
                buf.put_slice(b"PUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(reply) = reply {
                    buf.put_u8(b' ');
                    buf.put_slice(reply.as_bytes());
                }
                buf.put_u8(b' ');
                buf.put_slice(payload.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(payload);
                buf.put_slice(CRLF);
            }
            Self::Sub {
                subject,
                queue,
                sid,
            } => {
                buf.put_slice(b"SUB ");
                buf.put_slice(subject.as_bytes());
                if let Some(queue) = queue {
                    buf.put_u8(b' ');
                    buf.put_slice(queue.as_bytes());
                }
                buf.put_u8(b' ');
                buf.put_slice(sid.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            Self::Unsub { sid, max } => {
                buf.put_slice(b"UNSUB ");
                buf.put_slice(sid.to_string().as_bytes());
                if let Some(max) = max {
                    buf.put_u8(b' ');
                    buf.put_slice(max.to_string().as_bytes());
                }
                buf.put_slice(CRLF);
            }
            Self::Ping => buf.put_slice(PING_FRAME),
            Self::Pong => buf.put_slice(PONG_FRAME),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl ServerOp {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Info(info) => {
                buf.put_slice(b"INFO ");
                let json = serde_json::to_vec(info.as_ref()).unwrap_or_else(|_| b"{}".to_vec());
                buf.put_slice(&json);
                buf.put_slice(CRLF);
            }
            Self::Msg(msg) => {
                buf.reserve(msg.subject.len() + msg.payload.len() + 48);
                buf.put_slice(b"MSG ");
                buf.put_slice(msg.subject.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(msg.sid.to_string().as_bytes());
                if let Some(reply) = &msg.reply {
                    buf.put_u8(b' ');
                    buf.put_slice(reply.as_bytes());
                }
                buf.put_u8(b' ');
                buf.put_slice(msg.payload.len().to_string().as_bytes());
                buf.put_slice(CRLF);
                buf.put_slice(&msg.payload);
                buf.put_slice(CRLF);
            }
            Self::Ping => buf.put_slice(PING_FRAME),
            Self::Pong => buf.put_slice(PONG_FRAME),
            Self::Ok => buf.put_slice(b"+OK\r\n"),
            Self::Err(text) => {
                buf.put_slice(b"-ERR '");
                buf.put_slice(text.as_bytes());
                buf.put_slice(b"'\r\n");
            }
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pub() {
        let op = ClientOp::Pub {
            subject: "foo".into(),
            reply: None,
            payload: Bytes::from_static(b"hello"),
        };
        assert_eq!(&op.to_bytes()[..], b"PUB foo 5\r\nhello\r\n");

        let op = ClientOp::Pub {
            subject: "foo".into(),
            reply: Some("_INBOX.x".into()),
            payload: Bytes::new(),
        };
        assert_eq!(&op.to_bytes()[..], b"PUB foo _INBOX.x 0\r\n\r\n");
    }

    #[test]
    fn test_encode_sub_and_unsub() {
        let op = ClientOp::Sub {
            subject: "foo.*".into(),
            queue: Some("workers".into()),
            sid: 7,
        };
        assert_eq!(&op.to_bytes()[..], b"SUB foo.* workers 7\r\n");

        let op = ClientOp::Unsub { sid: 7, max: Some(10) };
        assert_eq!(&op.to_bytes()[..], b"UNSUB 7 10\r\n");

        let op = ClientOp::Unsub { sid: 7, max: None };
        assert_eq!(&op.to_bytes()[..], b"UNSUB 7\r\n");
    }

    #[test]
    fn test_encode_connect_is_json_line() {
        let op = ClientOp::Connect(Box::new(ConnectInfo {
            verbose: false,
            pedantic: true,
            protocol: 1,
            lang: "rust".into(),
            ..Default::default()
        }));
        let bytes = op.to_bytes();
        assert!(bytes.starts_with(b"CONNECT {"));
        assert!(bytes.ends_with(b"}\r\n"));
        let json: serde_json::Value =
            serde_json::from_slice(&bytes[8..bytes.len() - 2]).unwrap();
        assert_eq!(json["pedantic"], true);
    }

    #[test]
    fn test_encode_server_msg_with_reply() {
        let msg = Message::new("foo", 3, Bytes::from_static(b"hi")).with_reply("bar");
        assert_eq!(
            &ServerOp::Msg(msg).to_bytes()[..],
            b"MSG foo 3 bar 2\r\nhi\r\n"
        );
    }

    #[test]
    fn test_encode_err_is_quoted() {
        assert_eq!(
            &ServerOp::Err("Stale Connection".into()).to_bytes()[..],
            b"-ERR 'Stale Connection'\r\n"
        );
    }
}
