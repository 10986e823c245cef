#![doc = include_str!("../README.md")]
#[doc(inline)]
pub use crate::decode::DecodingError;
#[doc(inline)]
pub use crate::defragment::{JoinDefragmenter, JoinError, JoinKey, DEFAULT_MAX_AGE};
#[doc(inline)]
pub use crate::payload::{coerce_mapping, CoercionError, Payload, PayloadError};
#[doc(inline)]
pub use crate::topic::{Topic, TopicError, DEFAULT_PORT};
#[doc(inline)]
pub use crate::value::Value;

pub mod decode;
mod defragment;
pub mod encode;
pub mod payload;
mod topic;
mod value;
pub mod wire;

#[cfg(feature = "async")]
pub mod aio;
#[cfg(feature = "async")]
mod broker;
#[cfg(feature = "async")]
mod pipeline;
#[cfg(feature = "async")]
mod subscriber;

#[cfg(feature = "async")]
pub use crate::broker::{BrokerError, Connection, Connector, Message};
#[cfg(feature = "async")]
pub use crate::pipeline::{BindingError, HandlerError, Pipeline, RunError, SchemaError};
#[cfg(feature = "async")]
pub use crate::subscriber::{Binding, Builder, Subscriber};

/// Parse and validate a topic reference.
///
/// It is analogous to:
///
/// ```
/// use sterne::Topic;
///
/// let topic = Topic::parse("nats://localhost:4222/nova.parsed").unwrap();
/// assert_eq!(topic.subject(), "nova.parsed");
/// ```
pub fn topic(value: &str) -> Result<Topic, TopicError> {
    Topic::parse(value)
}
