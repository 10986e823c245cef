//! The client side of the NATS text protocol, without any IO.
//!
//! [`NatsBinding`] is a state machine over a byte buffer. The event loop
//! feeds it raw bytes ([`NatsBinding::receive`]), drains decoded server ops
//! ([`NatsBinding::poll_op`]), queues client ops ([`NatsBinding::send`]) and
//! writes out whatever [`NatsBinding::poll_transmits`] hands back.
//!
//! The binding answers `INFO` with `CONNECT` and `PING` with `PONG` on its
//! own, and stages application ops until the handshake completed.
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use std::collections::VecDeque;
use std::fmt::Display;

// A NATS server refuses payloads beyond its advertised max_payload
// (1 MiB by default). Anything larger in a MSG header means the stream is
// corrupt.
const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

// An op line that never terminates means the peer is not speaking NATS.
const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, PartialEq)]
pub enum ProtocolError {
    UnknownOp(String),

    BadMessageHeader(String),

    /// A MSG header claims a payload size no sane server produces.
    PayloadTooLarge(usize),

    LineTooLong(usize),
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::UnknownOp(verb) => &format!("unknown protocol op {verb:?}"),
            Self::BadMessageHeader(reason) => &format!("bad MSG header: {reason}"),
            Self::PayloadTooLarge(size) => {
                &format!("MSG header claims a {size} byte payload, limit is {MAX_PAYLOAD}")
            }
            Self::LineTooLong(size) => {
                &format!("op line exceeds {MAX_LINE} bytes ({size} buffered)")
            }
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for ProtocolError {}

/// An op sent by the server.
#[derive(Debug, PartialEq)]
pub enum ServerOp {
    /// The connection banner; its JSON body is passed along unparsed.
    Info(String),

    /// One delivered message.
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Bytes,
    },

    Ping,
    Pong,
    Ok,
    Err(String),
}

/// An op the client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect,
    Sub { subject: String, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

impl ClientOp {
    fn into_bytes(self) -> Bytes {
        match self {
            ClientOp::Connect => Bytes::from(format!(
                "CONNECT {{\"verbose\":false,\"pedantic\":false,\"lang\":\"rust\",\"name\":\"sterne\",\"version\":{:?}}}\r\n",
                env!("CARGO_PKG_VERSION")
            )),
            ClientOp::Sub { subject, sid } => Bytes::from(format!("SUB {subject} {sid}\r\n")),
            ClientOp::Unsub { sid } => Bytes::from(format!("UNSUB {sid}\r\n")),
            ClientOp::Ping => Bytes::from_static(b"PING\r\n"),
            ClientOp::Pong => Bytes::from_static(b"PONG\r\n"),
        }
    }
}

#[derive(Default, Debug)]
enum State {
    // Waiting for the next `<op ...>\r\n` line.
    #[default]
    OpLine,

    // A MSG header was read; `needed` payload bytes plus CRLF follow.
    Payload {
        subject: String,
        sid: u64,
        reply: Option<String>,
        needed: usize,
    },
}

#[derive(Debug, PartialEq)]
enum Handshake {
    // No INFO seen yet; application ops are staged.
    AwaitingInfo,
    Connected,
}

/// Sans-io state machine for one NATS client connection.
pub struct NatsBinding {
    buffer: BytesMut,
    state: State,
    handshake: Handshake,
    transmits: VecDeque<Bytes>,
    staged: Vec<ClientOp>,
}

impl Default for NatsBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl NatsBinding {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: State::default(),
            handshake: Handshake::AwaitingInfo,
            transmits: VecDeque::new(),
            staged: Vec::new(),
        }
    }

    /// Feed bytes read from the socket into the binding.
    pub fn receive(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Queue an op for transmission. Until the handshake completed, ops
    /// other than the handshake's own are held back.
    pub fn send(&mut self, op: ClientOp) {
        match self.handshake {
            Handshake::Connected => self.transmits.push_back(op.into_bytes()),
            Handshake::AwaitingInfo => self.staged.push(op),
        }
    }

    /// The next chunk of bytes that must go out to the server, in order.
    pub fn poll_transmits(&mut self) -> Option<Bytes> {
        self.transmits.pop_front()
    }

    /// Try decoding the next server op from the buffered bytes.
    ///
    /// `Ok(None)` means more bytes are needed. A protocol error is
    /// unrecoverable; the connection must be closed.
    pub fn poll_op(&mut self) -> Result<Option<ServerOp>, ProtocolError> {
        loop {
            match std::mem::take(&mut self.state) {
                State::OpLine => {
                    let Some(position) = find_crlf(&self.buffer) else {
                        if self.buffer.len() > MAX_LINE {
                            return Err(ProtocolError::LineTooLong(self.buffer.len()));
                        }
                        return Ok(None);
                    };

                    let line = self.buffer.split_to(position + 2);
                    let line = String::from_utf8_lossy(&line[..position]).into_owned();
                    trace!("--> {line}");

                    match self.parse_line(&line)? {
                        Parsed::Op(op) => return Ok(Some(op)),
                        // Keep looping: the payload may already be buffered.
                        Parsed::PayloadFollows => continue,
                        Parsed::Nothing => continue,
                    }
                }
                State::Payload {
                    subject,
                    sid,
                    reply,
                    needed,
                } => {
                    if self.buffer.len() < needed + 2 {
                        self.state = State::Payload {
                            subject,
                            sid,
                            reply,
                            needed,
                        };
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(needed).freeze();
                    let terminator = self.buffer.split_to(2);
                    if &terminator[..] != b"\r\n" {
                        return Err(ProtocolError::BadMessageHeader(
                            "payload is not terminated by CRLF".to_string(),
                        ));
                    }

                    return Ok(Some(ServerOp::Msg {
                        subject,
                        sid,
                        reply,
                        payload,
                    }));
                }
            }
        }
    }

    fn parse_line(&mut self, line: &str) -> Result<Parsed, ProtocolError> {
        let mut parts = line.split_ascii_whitespace();
        let Some(verb) = parts.next() else {
            // Stray empty line; some servers emit them around PING.
            return Ok(Parsed::Nothing);
        };

        match verb.to_ascii_uppercase().as_str() {
            "INFO" => {
                let body = line[verb.len()..].trim().to_string();
                if self.handshake == Handshake::AwaitingInfo {
                    self.handshake = Handshake::Connected;
                    self.transmits.push_back(ClientOp::Connect.into_bytes());
                    for op in std::mem::take(&mut self.staged) {
                        self.transmits.push_back(op.into_bytes());
                    }
                    debug!("Handshake complete, released {} staged op(s)", self.transmits.len() - 1);
                }
                Ok(Parsed::Op(ServerOp::Info(body)))
            }
            "MSG" => {
                let header: Vec<&str> = parts.collect();
                let (subject, sid, reply, size) = match header[..] {
                    [subject, sid, size] => (subject, sid, None, size),
                    [subject, sid, reply, size] => (subject, sid, Some(reply), size),
                    _ => {
                        return Err(ProtocolError::BadMessageHeader(format!(
                            "expected 3 or 4 fields, got {}",
                            header.len()
                        )))
                    }
                };

                let sid = sid.parse::<u64>().map_err(|_| {
                    ProtocolError::BadMessageHeader(format!("{sid:?} is not a valid sid"))
                })?;
                let needed = size.parse::<usize>().map_err(|_| {
                    ProtocolError::BadMessageHeader(format!("{size:?} is not a valid size"))
                })?;
                if needed > MAX_PAYLOAD {
                    return Err(ProtocolError::PayloadTooLarge(needed));
                }

                self.state = State::Payload {
                    subject: subject.to_string(),
                    sid,
                    reply: reply.map(str::to_string),
                    needed,
                };
                Ok(Parsed::PayloadFollows)
            }
            "PING" => {
                self.transmits.push_back(ClientOp::Pong.into_bytes());
                Ok(Parsed::Op(ServerOp::Ping))
            }
            "PONG" => Ok(Parsed::Op(ServerOp::Pong)),
            "+OK" => Ok(Parsed::Op(ServerOp::Ok)),
            "-ERR" => {
                let message = line[verb.len()..].trim().trim_matches('\'').to_string();
                Ok(Parsed::Op(ServerOp::Err(message)))
            }
            _ => Err(ProtocolError::UnknownOp(verb.to_string())),
        }
    }
}

enum Parsed {
    Op(ServerOp),
    PayloadFollows,
    Nothing,
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|window| window == b"\r\n")
}
