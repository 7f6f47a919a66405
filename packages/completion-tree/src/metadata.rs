//! Identity and location metadata attached to root nodes.
//!
//! Children share their root's metadata; nothing here is mutated after the
//! root is created.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace used when an identifier string carries none.
pub const DEFAULT_NAMESPACE: &str = "core";

/// A `namespace:name` pair identifying the component that started the work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentIdentifier {
    pub namespace: String,
    pub name: String,
}

impl ComponentIdentifier {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `"http:listener"` style identifiers.
    ///
    /// Only the first `:` splits; an identifier with no namespace falls back
    /// to [`DEFAULT_NAMESPACE`].
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((namespace, name)) if !namespace.is_empty() => Self::new(namespace, name),
            Some((_, name)) => Self::new(DEFAULT_NAMESPACE, name),
            None => Self::new(DEFAULT_NAMESPACE, raw),
        }
    }
}

impl fmt::Display for ComponentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

/// Where a root node originated: the component plus its path in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLocation {
    pub identifier: ComponentIdentifier,
    /// Slash-separated location path, e.g. `"orders/source"`.
    pub path: String,
}

impl ComponentLocation {
    pub fn new(identifier: ComponentIdentifier, path: impl Into<String>) -> Self {
        Self {
            identifier,
            path: path.into(),
        }
    }

    /// Shorthand for `ComponentLocation::new(ComponentIdentifier::parse(id), path)`.
    pub fn parse(identifier: &str, path: impl Into<String>) -> Self {
        Self::new(ComponentIdentifier::parse(identifier), path)
    }
}

/// Metadata supplied when a root node is created.
///
/// # Example
///
/// ```ignore
/// use completion_tree::{ComponentLocation, RootMetadata};
///
/// let metadata = RootMetadata::new("orders")
///     .with_server_id("node-1")
///     .with_correlation_id("req-42")
///     .with_location(ComponentLocation::parse("http:listener", "orders/source"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMetadata {
    /// Caller-supplied correlation id. When absent the root id is used.
    pub correlation_id: Option<String>,
    /// Identifies the process/host that created the root.
    pub server_id: String,
    /// Name of the pipeline or flow that owns the work.
    pub owner: String,
    pub location: Option<ComponentLocation>,
    pub created_at: DateTime<Utc>,
}

impl RootMetadata {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            server_id: crate::config::DEFAULT_SERVER_ID.to_string(),
            owner: owner.into(),
            location: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_location(mut self, location: ComponentLocation) -> Self {
        self.location = Some(location);
        self
    }
}

impl Default for RootMetadata {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_OWNER)
    }
}
