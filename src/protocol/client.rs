//! Client Protocol Codec
//!
//! Line-oriented text protocol spoken with clients. Every control line ends in
//! CRLF; `PUB` and `MSG` are followed by a payload of the announced size and
//! another CRLF.
//!
//! Client -> server: `CONNECT`, `PING`, `PONG`, `SUB`, `UNSUB`, `PUB`
//! Server -> client: `INFO`, `MSG`, `PING`, `PONG`, `+OK`, `-ERR`

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::ProtocolError;

/// Longest control line accepted, terminator excluded
pub const MAX_CONTROL_LINE: usize = 4096;

pub const PING: &[u8] = b"PING\r\n";
pub const PONG: &[u8] = b"PONG\r\n";
pub const OK: &[u8] = b"+OK\r\n";

/// Options a client announces with `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Acknowledge every operation with `+OK`
    pub verbose: bool,
    /// Extra subject checking (accepted for compatibility)
    pub pedantic: bool,
    /// Deliver the client's own publishes back to its subscriptions
    pub echo: bool,
    /// Client name for introspection
    pub name: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            echo: true,
            name: None,
        }
    }
}

/// Information sent to a client right after it connects
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub proto: u8,
    pub client_id: u64,
}

/// A parsed client operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp {
    Connect(ConnectOptions),
    Ping,
    Pong,
    Sub {
        subject: String,
        queue: Option<String>,
        sid: String,
    },
    Unsub {
        sid: String,
    },
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
}

/// `PUB` control line parsed, waiting for its payload
#[derive(Debug)]
struct PendingPub {
    subject: String,
    reply: Option<String>,
    size: usize,
}

/// Incremental decoder for client operations
#[derive(Debug)]
pub struct ClientDecoder {
    max_payload: usize,
    pending: Option<PendingPub>,
}

impl ClientDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: None,
        }
    }

    /// Decode one operation from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ClientOp>, ProtocolError> {
        loop {
            if let Some(pending) = self.pending.take() {
                // Payload plus its CRLF
                if buf.len() < pending.size + 2 {
                    buf.reserve(pending.size + 2 - buf.len());
                    self.pending = Some(pending);
                    return Ok(None);
                }
                if &buf[pending.size..pending.size + 2] != b"\r\n" {
                    return Err(ProtocolError::MissingPayloadTerminator);
                }
                let payload = buf.split_to(pending.size).freeze();
                let _ = buf.split_to(2);
                return Ok(Some(ClientOp::Pub {
                    subject: pending.subject,
                    reply: pending.reply,
                    payload,
                }));
            }

            let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
                // Allow for a CR still waiting for its LF
                if buf.len() > MAX_CONTROL_LINE + 1 {
                    return Err(ProtocolError::ControlLineTooLong);
                }
                return Ok(None);
            };
            let line_len = if pos > 0 && buf[pos - 1] == b'\r' {
                pos - 1
            } else {
                pos
            };
            if line_len > MAX_CONTROL_LINE {
                return Err(ProtocolError::ControlLineTooLong);
            }

            let line = buf.split_to(pos + 1);
            let line = std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidUtf8)?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }

            match self.parse_control_line(line)? {
                Some(op) => return Ok(Some(op)),
                // PUB header parsed; loop around for the payload
                None => continue,
            }
        }
    }

    fn parse_control_line(&mut self, line: &str) -> Result<Option<ClientOp>, ProtocolError> {
        let line = line.trim_start();
        let (op, rest) = match line.find(char::is_whitespace) {
            Some(idx) => (&line[..idx], line[idx..].trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_ascii_whitespace().collect();

        if op.eq_ignore_ascii_case("PUB") {
            let (subject, reply, size) = match args.as_slice() {
                [subject, size] => (*subject, None, *size),
                [subject, reply, size] => (*subject, Some(reply.to_string()), *size),
                _ => return Err(ProtocolError::InvalidArguments("PUB <subject> [reply] <size>")),
            };
            let size: usize = size.parse().map_err(|_| ProtocolError::InvalidPayloadSize)?;
            if size > self.max_payload {
                return Err(ProtocolError::PayloadTooLarge {
                    size,
                    max: self.max_payload,
                });
            }
            self.pending = Some(PendingPub {
                subject: subject.to_string(),
                reply,
                size,
            });
            Ok(None)
        } else if op.eq_ignore_ascii_case("SUB") {
            match args.as_slice() {
                [subject, sid] => Ok(Some(ClientOp::Sub {
                    subject: subject.to_string(),
                    queue: None,
                    sid: sid.to_string(),
                })),
                [subject, queue, sid] => Ok(Some(ClientOp::Sub {
                    subject: subject.to_string(),
                    queue: Some(queue.to_string()),
                    sid: sid.to_string(),
                })),
                _ => Err(ProtocolError::InvalidArguments("SUB <subject> [queue] <sid>")),
            }
        } else if op.eq_ignore_ascii_case("UNSUB") {
            match args.as_slice() {
                [sid] => Ok(Some(ClientOp::Unsub {
                    sid: sid.to_string(),
                })),
                _ => Err(ProtocolError::InvalidArguments("UNSUB <sid>")),
            }
        } else if op.eq_ignore_ascii_case("PING") {
            Ok(Some(ClientOp::Ping))
        } else if op.eq_ignore_ascii_case("PONG") {
            Ok(Some(ClientOp::Pong))
        } else if op.eq_ignore_ascii_case("CONNECT") {
            let opts = if rest.is_empty() {
                ConnectOptions::default()
            } else {
                serde_json::from_str(rest)
                    .map_err(|_| ProtocolError::InvalidArguments("CONNECT {json}"))?
            };
            Ok(Some(ClientOp::Connect(opts)))
        } else {
            Err(ProtocolError::UnknownOperation(op.to_string()))
        }
    }
}

/// Append `INFO {json}`
pub fn encode_info(buf: &mut BytesMut, info: &ServerInfo) {
    buf.extend_from_slice(b"INFO ");
    // Serializing a struct of plain strings and integers cannot fail
    if let Ok(json) = serde_json::to_vec(info) {
        buf.extend_from_slice(&json);
    } else {
        buf.extend_from_slice(b"{}");
    }
    buf.extend_from_slice(b"\r\n");
}

/// Append `MSG <subject> <sid> [reply] <size>` and the payload
pub fn encode_msg(
    buf: &mut BytesMut,
    subject: &str,
    sid: &str,
    reply: Option<&str>,
    payload: &[u8],
) {
    buf.reserve(subject.len() + sid.len() + payload.len() + 32);
    buf.extend_from_slice(b"MSG ");
    buf.extend_from_slice(subject.as_bytes());
    buf.put_u8(b' ');
    buf.extend_from_slice(sid.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply {
        buf.extend_from_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
}

/// Append `-ERR '<message>'`
pub fn encode_err(buf: &mut BytesMut, message: &str) {
    buf.extend_from_slice(b"-ERR '");
    buf.extend_from_slice(message.as_bytes());
    buf.extend_from_slice(b"'\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<ClientOp> {
        let mut decoder = ClientDecoder::new(1024);
        let mut buf = BytesMut::from(input.as_bytes());
        let mut ops = Vec::new();
        while let Some(op) = decoder.decode(&mut buf).unwrap() {
            ops.push(op);
        }
        ops
    }

    #[test]
    fn test_sub_with_and_without_queue() {
        let ops = decode_all("SUB foo.bar 1\r\nsub foo.* workers 2\r\n");
        assert_eq!(
            ops,
            vec![
                ClientOp::Sub {
                    subject: "foo.bar".into(),
                    queue: None,
                    sid: "1".into()
                },
                ClientOp::Sub {
                    subject: "foo.*".into(),
                    queue: Some("workers".into()),
                    sid: "2".into()
                },
            ]
        );
    }

    #[test]
    fn test_pub_waits_for_payload() {
        let mut decoder = ClientDecoder::new(1024);
        let mut buf = BytesMut::from(&b"PUB foo reply.to 5\r\nhel"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"lo\r\nPING\r\n");
        assert_eq!(
            decoder.decode(&mut buf).unwrap(),
            Some(ClientOp::Pub {
                subject: "foo".into(),
                reply: Some("reply.to".into()),
                payload: Bytes::from_static(b"hello"),
            })
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(ClientOp::Ping));
    }

    #[test]
    fn test_pub_empty_payload() {
        let ops = decode_all("PUB foo 0\r\n\r\n");
        assert_eq!(
            ops,
            vec![ClientOp::Pub {
                subject: "foo".into(),
                reply: None,
                payload: Bytes::new(),
            }]
        );
    }

    #[test]
    fn test_pub_payload_too_large() {
        let mut decoder = ClientDecoder::new(4);
        let mut buf = BytesMut::from(&b"PUB foo 5\r\nhello\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::PayloadTooLarge { size: 5, max: 4 })
        );
    }

    #[test]
    fn test_pub_missing_terminator() {
        let mut decoder = ClientDecoder::new(1024);
        let mut buf = BytesMut::from(&b"PUB foo 2\r\nabcd"[..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MissingPayloadTerminator)
        );
    }

    #[test]
    fn test_connect_options() {
        let ops = decode_all("CONNECT {\"verbose\":true,\"echo\":false,\"name\":\"app\"}\r\n");
        match &ops[0] {
            ClientOp::Connect(opts) => {
                assert!(opts.verbose);
                assert!(!opts.echo);
                assert_eq!(opts.name.as_deref(), Some("app"));
            }
            other => panic!("Expected CONNECT, got {:?}", other),
        }
    }

    #[test]
    fn test_control_line_too_long_with_terminator() {
        let mut decoder = ClientDecoder::new(1024);
        let line = format!("PUB {} 0\r\n\r\n", "a".repeat(MAX_CONTROL_LINE));
        let mut buf = BytesMut::from(line.as_bytes());
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::ControlLineTooLong)
        );
    }

    #[test]
    fn test_control_line_at_limit() {
        // "PUB " + subject + " 0" is exactly the limit
        let subject = "a".repeat(MAX_CONTROL_LINE - 6);
        let ops = decode_all(&format!("PUB {} 0\r\n\r\n", subject));
        assert_eq!(
            ops,
            vec![ClientOp::Pub {
                subject,
                reply: None,
                payload: Bytes::new(),
            }]
        );
    }

    #[test]
    fn test_control_line_too_long_without_terminator() {
        let mut decoder = ClientDecoder::new(1024);
        let mut buf = BytesMut::from("a".repeat(MAX_CONTROL_LINE + 2).as_bytes());
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::ControlLineTooLong)
        );
    }

    #[test]
    fn test_unknown_operation() {
        let mut decoder = ClientDecoder::new(1024);
        let mut buf = BytesMut::from(&b"FOO bar\r\n"[..]);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::UnknownOperation("FOO".into()))
        );
    }

    #[test]
    fn test_encode_msg() {
        let mut buf = BytesMut::new();
        encode_msg(&mut buf, "foo.bar", "7", None, b"hi");
        assert_eq!(&buf[..], b"MSG foo.bar 7 2\r\nhi\r\n");

        buf.clear();
        encode_msg(&mut buf, "foo", "1", Some("inbox"), b"");
        assert_eq!(&buf[..], b"MSG foo 1 inbox 0\r\n\r\n");
    }

    #[test]
    fn test_encode_err() {
        let mut buf = BytesMut::new();
        encode_err(&mut buf, "Invalid Subject");
        assert_eq!(&buf[..], b"-ERR 'Invalid Subject'\r\n");
    }
}
