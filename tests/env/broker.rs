//! An in-memory broker for tests.
//!
//! It records which server was connected, which subjects were subscribed
//! and how often the connection was flushed, and lets a test publish frames
//! straight into the registered sinks.
use async_channel::Sender;
use bytes::Bytes;
use sterne::{BrokerError, Connection, Connector, Message};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct State {
    servers: Vec<String>,
    subscriptions: Vec<(String, Sender<Message>)>,
    flushes: usize,
    refuse_connections: bool,
}

#[derive(Clone, Default)]
pub struct Broker {
    state: Arc<Mutex<State>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that fails every connection attempt.
    pub fn refusing_connections() -> Self {
        let broker = Self::default();
        broker.state.lock().unwrap().refuse_connections = true;
        broker
    }

    /// Deliver one frame to every sink subscribed to `subject`.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) {
        let sinks: Vec<Sender<Message>> = {
            let state = self.state.lock().unwrap();
            state
                .subscriptions
                .iter()
                .filter(|(registered, _)| registered == subject)
                .map(|(_, sink)| sink.clone())
                .collect()
        };

        let payload = payload.into();
        for sink in sinks {
            let _ = sink
                .send(Message {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                })
                .await;
        }
    }

    /// Drop every registered sink, as a lost connection would.
    pub fn close(&self) {
        self.state.lock().unwrap().subscriptions.clear();
    }

    pub fn servers(&self) -> Vec<String> {
        self.state.lock().unwrap().servers.clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .subscriptions
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().unwrap().flushes
    }
}

impl Connector for Broker {
    type Connection = Broker;

    async fn connect(&mut self, server: &str) -> Result<Broker, BrokerError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_connections {
            return Err(BrokerError::new(format!("connection to {server} refused")));
        }
        state.servers.push(server.to_string());
        Ok(self.clone())
    }
}

impl Connection for Broker {
    async fn subscribe(&mut self, subject: &str, sink: Sender<Message>) -> Result<(), BrokerError> {
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .push((subject.to_string(), sink));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BrokerError> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }
}
