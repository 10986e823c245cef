//! A pipeline binds subjects to a handler over one broker connection.
//!
//! Frames flow decode → coerce → (join) → validate → handle. A pipeline
//! never dies from a single bad message: decode failures, join-key
//! failures and validator rejections are logged and dropped, handler
//! failures are logged and swallowed. Only configuration errors and the
//! loss of the broker connection terminate [`Pipeline::run`].
use crate::broker::{BrokerError, Connection, Connector, Message};
use crate::defragment::JoinDefragmenter;
use crate::payload::{self, Payload};
use crate::topic::{Topic, TopicError};
use async_lock::Mutex;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

// TODO: Make the delivery buffer configurable per subscription.
const DELIVERY_BUFFER: usize = 100;

/// A registration was rejected before any broker interaction.
#[derive(Debug, PartialEq)]
pub enum BindingError {
    /// No source at all was declared.
    NoSources,

    /// More than one subject is declared but no join key was given.
    KeyRequired,

    /// Positional topics and named sources were mixed in one subscription.
    AmbiguousSubscription,

    BadTopic(TopicError),
}

impl Display for BindingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NoSources => "at least one source must be provided",
            Self::KeyRequired => {
                "a join key is required when more than one subject is declared"
            }
            Self::AmbiguousSubscription => {
                "use either positional topics or named sources, not both"
            }
            Self::BadTopic(error) => &format!("invalid topic: {error}"),
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for BindingError {}

impl From<TopicError> for BindingError {
    fn from(value: TopicError) -> Self {
        Self::BadTopic(value)
    }
}

/// Why a pipeline (or the subscriber driving it) stopped.
#[derive(Debug)]
pub enum RunError {
    /// `Subscriber::run` was called before any subscription was registered.
    NoPipeline,

    /// More than one pipeline is registered. Scheduling several pipelines
    /// is not implemented yet.
    MultiplePipelines,

    /// The topics of the pipeline span more than one broker endpoint (or
    /// none at all).
    MultipleEndpoints(Vec<String>),

    /// The broker connection could not be established.
    Connect(BrokerError),

    /// A subscription or flush failed after connecting.
    Broker(BrokerError),

    /// The broker connection closed while the pipeline was running.
    ConnectionClosed,
}

impl Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::NoPipeline => "at least one pipeline must be registered before running",
            Self::MultiplePipelines => {
                "running more than one pipeline at a time is not implemented yet"
            }
            Self::MultipleEndpoints(servers) => &format!(
                "pipeline topics must resolve to exactly one broker endpoint, got {}: {servers:?}",
                servers.len()
            ),
            Self::Connect(error) => &format!("failed to connect to the broker: {error}"),
            Self::Broker(error) => &format!("broker operation failed: {error}"),
            Self::ConnectionClosed => "the broker connection closed",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for RunError {}

/// A validator rejected a payload.
///
/// Returning this from a validator is the sanctioned way to refuse a
/// message; the pipeline logs the rejection and moves on.
#[derive(Debug)]
pub struct SchemaError(String);

impl SchemaError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SchemaError {}

impl From<&str> for SchemaError {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SchemaError {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Failures a handler hands back; they are logged and swallowed.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

struct Source {
    name: String,
    topics: Vec<Topic>,
}

/// Binds N named sources to one broker connection and pumps their frames
/// through validator and handler.
///
/// With a single source, frames pass straight through; with several, the
/// join defragmenter assembles them per correlation key. The defragmenter
/// is the only shared state and sits behind a mutex held across `push`
/// only.
pub struct Pipeline<V, H> {
    sources: Vec<Source>,
    validator: V,
    handler: H,
    join: Option<Mutex<JoinDefragmenter>>,
}

impl<V, H> Pipeline<V, H> {
    /// Construct a pipeline over named sources, in declaration order.
    ///
    /// A join key is required as soon as there is more than one source;
    /// with a single source it is accepted and unused.
    pub fn new(
        sources: Vec<(String, Vec<Topic>)>,
        validator: V,
        handler: H,
        key: Option<&str>,
    ) -> Result<Self, BindingError> {
        if sources.is_empty() {
            return Err(BindingError::NoSources);
        }

        let join = if sources.len() > 1 {
            let key = key.ok_or(BindingError::KeyRequired)?;
            let names = sources.iter().map(|(name, _)| name.clone());
            let join = JoinDefragmenter::new(names, key).map_err(|_| BindingError::NoSources)?;
            Some(Mutex::new(join))
        } else {
            None
        };

        let sources = sources
            .into_iter()
            .map(|(name, topics)| Source { name, topics })
            .collect();

        Ok(Self {
            sources,
            validator,
            handler,
            join,
        })
    }

    /// Replace the TTL of incomplete joins. `None` or a zero duration
    /// disables eviction. Has no effect on a single-source pipeline, which
    /// holds no join state.
    pub fn max_age(mut self, max_age: Option<Duration>) -> Self {
        if let Some(join) = self.join.take() {
            self.join = Some(Mutex::new(join.into_inner().max_age(max_age)));
        }
        self
    }

    /// Connect, subscribe every topic of every source, and pump messages
    /// until the connection closes or the future is cancelled.
    ///
    /// All topics must resolve to the same broker endpoint; anything else
    /// fails with [`RunError::MultipleEndpoints`] before a connection is
    /// attempted.
    pub async fn run<C, T, Fut>(mut self, mut connector: C) -> Result<(), RunError>
    where
        C: Connector,
        V: FnMut(Payload) -> Result<T, SchemaError>,
        H: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        let servers: BTreeSet<String> = self
            .sources
            .iter()
            .flat_map(|source| source.topics.iter())
            .map(Topic::server)
            .collect();
        if servers.len() != 1 {
            return Err(RunError::MultipleEndpoints(servers.into_iter().collect()));
        }
        let Some(server) = servers.into_iter().next() else {
            return Err(RunError::MultipleEndpoints(Vec::new()));
        };

        info!("Connecting to {server}");
        let mut connection = connector.connect(&server).await.map_err(RunError::Connect)?;

        let mut streams = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            let (sink, deliveries) = async_channel::bounded(DELIVERY_BUFFER);
            for topic in &source.topics {
                debug!(
                    "Subscribing source {:?} to subject {:?}",
                    source.name,
                    topic.subject()
                );
                connection
                    .subscribe(topic.subject(), sink.clone())
                    .await
                    .map_err(RunError::Broker)?;
            }
            streams.push(deliveries.map(move |message| (index, message)).boxed());
        }
        connection.flush().await.map_err(RunError::Broker)?;

        info!("Running {} source(s) against {server}", self.sources.len());
        let mut inbox = stream::select_all(streams);
        while let Some((index, message)) = inbox.next().await {
            self.handle(index, message).await;
        }

        Err(RunError::ConnectionClosed)
    }

    // Process one delivered frame. Never fails: every per-message error is
    // logged and the frame dropped.
    async fn handle<T, Fut>(&mut self, index: usize, message: Message)
    where
        V: FnMut(Payload) -> Result<T, SchemaError>,
        H: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        let payload = match payload::from_bytes(&message.payload) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(
                    "Dropping frame from source {:?} on subject {:?} ({} bytes): {error}",
                    self.sources[index].name,
                    message.subject,
                    message.payload.len()
                );
                return;
            }
        };

        let completed = match &self.join {
            // Single source: no buffering, the payload goes straight out.
            None => vec![payload],
            Some(join) => {
                // Only `push` runs under the lock. The validator and the
                // handler never execute while it is held.
                let pushed = {
                    let mut join = join.lock().await;
                    join.push(&self.sources[index].name, payload, Instant::now())
                };
                match pushed {
                    Ok(completed) => completed,
                    Err(error) => {
                        warn!(
                            "Dropping frame from source {:?} on subject {:?} ({} bytes): {error}",
                            self.sources[index].name,
                            message.subject,
                            message.payload.len()
                        );
                        return;
                    }
                }
            }
        };

        for merged in completed {
            self.deliver(index, &message.subject, merged).await;
        }
    }

    async fn deliver<T, Fut>(&mut self, index: usize, subject: &str, payload: Payload)
    where
        V: FnMut(Payload) -> Result<T, SchemaError>,
        H: FnMut(T) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>>,
    {
        let value = match (self.validator)(payload) {
            Ok(value) => value,
            Err(error) => {
                warn!(
                    "Dropping payload from source {:?} on subject {subject:?}: {error}",
                    self.sources[index].name
                );
                return;
            }
        };

        if let Err(error) = (self.handler)(value).await {
            error!(
                "Handler failed for payload from source {:?} on subject {subject:?}: {error}",
                self.sources[index].name
            );
        }
    }
}
