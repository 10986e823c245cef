//! Validated references to one broker subject.
//!
//! A topic compresses the broker endpoint and the subject into a single
//! URL-like value, `nats://host[:port]/subject`. Subscription registration
//! then works on a plain list of opaque topics, and a pipeline checks its
//! single-broker invariant with a set-cardinality test over [`Topic::server`].
use std::fmt::Display;
use std::str::FromStr;

/// The port used when a topic does not name one.
pub const DEFAULT_PORT: u16 = 4222;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TopicError {
    /// The value carries no `scheme://` separator at all.
    MissingScheme,

    /// Only the `nats` scheme is supported.
    UnsupportedScheme(String),

    MissingHost,

    InvalidPort(String),

    /// The path is empty, so there is no subject to subscribe to.
    MissingSubject,
}

impl Display for TopicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::MissingScheme => "topic is missing a scheme, expected nats://host/subject",
            Self::UnsupportedScheme(scheme) => {
                &format!("scheme {scheme:?} is not supported, expected \"nats\"")
            }
            Self::MissingHost => "topic host is required",
            Self::InvalidPort(port) => &format!("{port:?} is not a valid port"),
            Self::MissingSubject => "topic path/subject is required",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for TopicError {}

/// A validated topic: scheme, host, port and subject.
///
/// # Example
///
/// ```
/// use sterne::Topic;
///
/// let topic = Topic::parse("nats://localhost/nova.parsed").unwrap();
/// assert_eq!(topic.server(), "nats://localhost:4222");
/// assert_eq!(topic.subject(), "nova.parsed");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    host: String,
    port: u16,
    subject: String,
}

impl Topic {
    /// Parse and validate a topic reference.
    pub fn parse(value: &str) -> Result<Topic, TopicError> {
        let (scheme, rest) = value.split_once("://").ok_or(TopicError::MissingScheme)?;
        if scheme != "nats" {
            return Err(TopicError::UnsupportedScheme(scheme.to_string()));
        }

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| TopicError::InvalidPort(port.to_string()))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(TopicError::MissingHost);
        }

        let subject = path.trim_start_matches('/');
        if subject.is_empty() {
            return Err(TopicError::MissingSubject);
        }

        Ok(Topic {
            host: host.to_string(),
            port,
            subject: subject.to_string(),
        })
    }

    /// The broker endpoint this topic resolves to, `nats://host:port`.
    pub fn server(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    /// The subject name, the path with its leading slash removed.
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Topic::parse(value)
    }
}

impl TryFrom<&str> for Topic {
    type Error = TopicError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Topic::parse(value)
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "nats://{}:{}/{}", self.host, self.port, self.subject)
    }
}
