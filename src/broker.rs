//! The capability surface a broker client must offer to run a pipeline.
//!
//! A pipeline does not care how frames reach it. It needs to connect to one
//! endpoint, register interest in subjects, and flush — the rest is
//! delivery through a channel. The [`crate::aio`] module provides a real
//! implementation over a socket; tests plug in an in-memory one.
use async_channel::Sender;
use bytes::Bytes;
use std::fmt::Display;
use std::future::Future;

/// One frame delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The subject the frame was published on.
    pub subject: String,

    /// The raw payload bytes.
    pub payload: Bytes,
}

/// A failure inside the broker client.
#[derive(Debug)]
pub struct BrokerError(String);

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(value: std::io::Error) -> Self {
        Self(value.to_string())
    }
}

/// Opens connections to a broker endpoint.
pub trait Connector {
    type Connection: Connection;

    /// Connect to `server`, a `nats://host:port` endpoint.
    fn connect(
        &mut self,
        server: &str,
    ) -> impl Future<Output = Result<Self::Connection, BrokerError>> + Send;
}

/// One established broker connection.
pub trait Connection {
    /// Register interest in `subject`. Every frame arriving on it is
    /// delivered into `sink`.
    fn subscribe(
        &mut self,
        subject: &str,
        sink: Sender<Message>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Wait until all pending registrations reached the broker.
    fn flush(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
