//! Error types for kgraph.

use std::fmt;

use thiserror::Error;

/// Top-level result type for kgraph operations.
pub type Result<T> = std::result::Result<T, KgError>;

/// The kind of stored item an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Entity,
    Relation,
    Namespace,
    Index,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Entity => "entity",
            Self::Relation => "relation",
            Self::Namespace => "namespace",
            Self::Index => "index",
        };
        f.write_str(name)
    }
}

/// Top-level error type for kgraph.
#[derive(Debug, Error)]
pub enum KgError {
    #[error("invalid '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: ItemKind, id: String },

    #[error("{kind} '{id}' already exists")]
    Conflict { kind: ItemKind, id: String },

    #[error("{resource} exhausted{hint}", hint = capacity_hint(.capacity))]
    ResourceExhausted {
        resource: String,
        capacity: Option<usize>,
    },

    #[error("failed to provision namespace '{namespace}': {message}")]
    Provisioning { namespace: String, message: String },

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} failed for tenant '{tenant}': {source}")]
    Context {
        operation: String,
        tenant: String,
        source: Box<KgError>,
    },
}

fn capacity_hint(capacity: &Option<usize>) -> String {
    match capacity {
        Some(cap) => format!(" (capacity {cap})"),
        None => String::new(),
    }
}

/// Coarse classification of a [`KgError`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    ResourceExhausted,
    Provisioning,
    Transient,
    Internal,
}

impl KgError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn entity_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ItemKind::Entity,
            id: id.into(),
        }
    }

    pub fn relation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ItemKind::Relation,
            id: id.into(),
        }
    }

    pub fn conflict(kind: ItemKind, id: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            id: id.into(),
        }
    }

    /// Classify this error, looking through any context wrappers.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Provisioning { .. } => ErrorKind::Provisioning,
            Self::TransientBackend(_) => ErrorKind::Transient,
            Self::Backend(_) | Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
            Self::Context { source, .. } => source.kind(),
        }
    }

    /// The innermost error, without operation/tenant wrappers.
    #[must_use]
    pub fn root(&self) -> &KgError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether a caller may retry the call with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted | ErrorKind::Transient
        )
    }

    /// Attach the operation name and tenant. Already-wrapped errors are kept as is.
    #[must_use]
    pub fn with_context(self, operation: &str, tenant: &str) -> Self {
        match self {
            wrapped @ Self::Context { .. } => wrapped,
            other => Self::Context {
                operation: operation.to_string(),
                tenant: tenant.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<serde_json::Error> for KgError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_display_human_readable_messages() {
        let err = KgError::entity_not_found("alice");
        assert_eq!(err.to_string(), "entity 'alice' not found");

        let err = KgError::ResourceExhausted {
            resource: "in-memory node store".to_string(),
            capacity: Some(10),
        };
        assert!(err.to_string().contains("capacity 10"));
    }

    #[test]
    fn context_preserves_kind_and_names_operation() {
        let err = KgError::entity_not_found("alice").with_context("get_entity", "globex");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let msg = err.to_string();
        assert!(msg.contains("get_entity"));
        assert!(msg.contains("globex"));
        assert!(msg.contains("alice"));
    }

    #[test]
    fn context_is_not_nested_twice() {
        let err = KgError::validation("id", "empty")
            .with_context("add_entity", "acme")
            .with_context("import", "acme");
        match err {
            KgError::Context { operation, .. } => assert_eq!(operation, "add_entity"),
            other => panic!("expected context, got {other:?}"),
        }
    }

    #[test]
    fn only_capacity_and_transient_errors_are_retryable() {
        assert!(KgError::TransientBackend("busy".into()).is_retryable());
        assert!(KgError::ResourceExhausted {
            resource: "pool".into(),
            capacity: None
        }
        .is_retryable());
        assert!(!KgError::validation("depth", "too deep").is_retryable());
        assert!(!KgError::conflict(ItemKind::Entity, "x").is_retryable());
    }
}
