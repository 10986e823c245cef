//! The user-facing registration surface.
//!
//! A [`Subscriber`] collects subscriptions and runs them. Each subscription
//! is declared with a [`Binding`] (what to listen to), a validator (how to
//! narrow a raw payload to a typed value) and a handler (what to do with
//! it):
//!
//! ```no_run
//! # #[cfg(feature = "net")]
//! # {
//! use sterne::{Binding, Subscriber};
//! use sterne::aio::NetConnector;
//!
//! let mut subscriber = Subscriber::new();
//! subscriber
//!     .subscribe(
//!         Binding::builder()
//!             .source("raw", ["nats://localhost:4222/nova.raw"])
//!             .source("enriched", ["nats://localhost:4222/nova.enriched"])
//!             .key("msg_uuid")
//!             .build(),
//!         |payload| Ok(payload),
//!         |payload| async move {
//!             println!("joined: {payload:?}");
//!             Ok(())
//!         },
//!     )
//!     .unwrap();
//!
//! smol::block_on(subscriber.run(NetConnector::new())).unwrap();
//! # }
//! ```
use crate::broker::Connector;
use crate::payload::Payload;
use crate::pipeline::{BindingError, HandlerError, Pipeline, RunError, SchemaError};
use crate::topic::Topic;
use log::info;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

// The name a plain list of topics is registered under.
const POSITIONAL_SOURCE: &str = "source";

/// What one subscription listens to: either a plain list of topics or
/// several named sources joined on a key.
pub struct Binding {
    topics: Vec<String>,
    sources: Vec<(String, Vec<String>)>,
    key: Option<String>,
    max_age: Option<Option<Duration>>,
}

impl Binding {
    pub fn builder() -> Builder {
        Builder::default()
    }
}

/// Builder for a [`Binding`].
///
/// Declare either topics or named sources; declaring both is rejected at
/// [`Subscriber::subscribe`]. Topics are given as `nats://host[:port]/subject`
/// strings and validated at registration.
#[derive(Default)]
pub struct Builder {
    topics: Vec<String>,
    sources: Vec<(String, Vec<String>)>,
    key: Option<String>,
    max_age: Option<Option<Duration>>,
}

impl Builder {
    /// Listen to one more topic, without a join.
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Declare a named source contributing one fragment to the join.
    /// Sources merge in declaration order; the last one wins on conflicts.
    pub fn source(
        mut self,
        name: impl Into<String>,
        topics: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.sources
            .push((name.into(), topics.into_iter().map(Into::into).collect()));
        self
    }

    /// The payload field whose value correlates fragments.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Override the TTL of incomplete joins (default 60 seconds). `None`
    /// disables eviction.
    pub fn max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn build(self) -> Binding {
        Binding {
            topics: self.topics,
            sources: self.sources,
            key: self.key,
            max_age: self.max_age,
        }
    }
}

type BoxedRun<C> =
    Box<dyn FnOnce(C) -> Pin<Box<dyn Future<Output = Result<(), RunError>> + Send>> + Send>;

/// Collects subscriptions and runs them against a broker.
///
/// One pipeline per subscriber for now; registering more is accepted but
/// [`Subscriber::run`] refuses to schedule them.
pub struct Subscriber<C: Connector> {
    pipelines: Vec<BoxedRun<C>>,
}

impl<C> Subscriber<C>
where
    C: Connector + Send + 'static,
    C::Connection: Send,
{
    pub fn new() -> Self {
        info!("Initialized new subscriber.");
        Self {
            pipelines: Vec::new(),
        }
    }

    /// Register a subscription: validate the binding, construct its
    /// pipeline, and store it for [`Subscriber::run`].
    ///
    /// Fails if the binding mixes positional topics with named sources,
    /// declares nothing, declares more than one subject without a key, or
    /// carries a topic that does not parse.
    pub fn subscribe<V, T, H, Fut>(
        &mut self,
        binding: Binding,
        validator: V,
        handler: H,
    ) -> Result<&mut Self, BindingError>
    where
        V: FnMut(Payload) -> Result<T, SchemaError> + Send + 'static,
        H: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
        T: Send + 'static,
    {
        if !binding.topics.is_empty() && !binding.sources.is_empty() {
            return Err(BindingError::AmbiguousSubscription);
        }

        let mut sources: Vec<(String, Vec<Topic>)> = Vec::new();
        if binding.sources.is_empty() {
            if binding.topics.is_empty() {
                return Err(BindingError::NoSources);
            }
            sources.push((POSITIONAL_SOURCE.to_string(), parse(&binding.topics)?));
        } else {
            for (name, topics) in &binding.sources {
                sources.push((name.clone(), parse(topics)?));
            }
        }

        let subjects: usize = sources.iter().map(|(_, topics)| topics.len()).sum();
        if subjects > 1 && binding.key.is_none() {
            return Err(BindingError::KeyRequired);
        }

        info!(
            "Subscribing handler to {:?}",
            sources
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>()
        );

        let pipeline = Pipeline::new(sources, validator, handler, binding.key.as_deref())?;
        let pipeline = match binding.max_age {
            Some(max_age) => pipeline.max_age(max_age),
            None => pipeline,
        };

        let run: BoxedRun<C> = Box::new(move |connector| Box::pin(pipeline.run(connector)));
        self.pipelines.push(run);
        Ok(self)
    }

    /// Run the registered pipeline until the broker connection closes or
    /// the future is cancelled.
    ///
    /// Exactly one pipeline must be registered; none at all is
    /// [`RunError::NoPipeline`], several are [`RunError::MultiplePipelines`].
    pub async fn run(mut self, connector: C) -> Result<(), RunError> {
        if self.pipelines.len() > 1 {
            return Err(RunError::MultiplePipelines);
        }
        let Some(pipeline) = self.pipelines.pop() else {
            return Err(RunError::NoPipeline);
        };

        info!("Running 1 pipeline...");
        pipeline(connector).await
    }
}

impl<C> Default for Subscriber<C>
where
    C: Connector + Send + 'static,
    C::Connection: Send,
{
    fn default() -> Self {
        Self::new()
    }
}

fn parse(topics: &[String]) -> Result<Vec<Topic>, BindingError> {
    topics
        .iter()
        .map(|topic| Ok(Topic::parse(topic)?))
        .collect()
}
