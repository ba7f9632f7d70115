use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Keyspace,
    Table,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Keyspace => write!(f, "keyspace"),
            ResourceType::Table => write!(f, "table"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrataErrorCode {
    Io,
    Corruption,
    Timeout,
    RateLimited,
    Durability,
    StaleWrite,
    Internal,
    Unavailable,
    InvalidConfig,
    KeyspaceNotFound,
    TableNotFound,
    KeyspaceAlreadyExists,
    TableAlreadyExists,
}

impl StrataErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            StrataErrorCode::Io => "io",
            StrataErrorCode::Corruption => "corruption",
            StrataErrorCode::Timeout => "timeout",
            StrataErrorCode::RateLimited => "rate_limited",
            StrataErrorCode::Durability => "durability",
            StrataErrorCode::StaleWrite => "stale_write",
            StrataErrorCode::Internal => "internal",
            StrataErrorCode::Unavailable => "unavailable",
            StrataErrorCode::InvalidConfig => "invalid_config",
            StrataErrorCode::KeyspaceNotFound => "keyspace_not_found",
            StrataErrorCode::TableNotFound => "table_not_found",
            StrataErrorCode::KeyspaceAlreadyExists => "keyspace_already_exists",
            StrataErrorCode::TableAlreadyExists => "table_already_exists",
        }
    }
}

/// Unified error type for the engine.
///
/// `Timeout` and `RateLimited` are transient, caller-actionable failures and
/// are never retried internally. `Internal` marks invariant violations
/// (programming defects), kept distinct so callers never treat them as
/// retryable.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("timeout")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("could not write mutation {keyspace}.{table} ({key}) to commit log: {source}")]
    Durability {
        keyspace: String,
        table: String,
        key: String,
        source: Box<StrataError>,
    },
    /// A write raced a truncate and was intentionally dropped. Recovered
    /// silently inside the engine; surfaced only through stats.
    #[error("write reordered with truncate")]
    StaleWrite,
    #[error("internal error: {message}")]
    Internal { message: String },
    #[error("resource unavailable: {message}")]
    Unavailable { message: String },
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
}

impl StrataError {
    pub fn internal(message: impl Into<String>) -> Self {
        StrataError::Internal {
            message: message.into(),
        }
    }

    pub fn code(&self) -> StrataErrorCode {
        match self {
            StrataError::Io(_) => StrataErrorCode::Io,
            StrataError::Corruption(_) => StrataErrorCode::Corruption,
            StrataError::Timeout => StrataErrorCode::Timeout,
            StrataError::RateLimited => StrataErrorCode::RateLimited,
            StrataError::Durability { .. } => StrataErrorCode::Durability,
            StrataError::StaleWrite => StrataErrorCode::StaleWrite,
            StrataError::Internal { .. } => StrataErrorCode::Internal,
            StrataError::Unavailable { .. } => StrataErrorCode::Unavailable,
            StrataError::InvalidConfig { .. } => StrataErrorCode::InvalidConfig,
            StrataError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Keyspace => StrataErrorCode::KeyspaceNotFound,
                ResourceType::Table => StrataErrorCode::TableNotFound,
            },
            StrataError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Keyspace => StrataErrorCode::KeyspaceAlreadyExists,
                ResourceType::Table => StrataErrorCode::TableAlreadyExists,
            },
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True for deadline expiry, including one buried under durability context.
    pub fn is_timeout(&self) -> bool {
        match self {
            StrataError::Timeout => true,
            StrataError::Durability { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ResourceType, StrataError, StrataErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(StrataErrorCode::TableNotFound.as_str(), "table_not_found");
        assert_eq!(StrataErrorCode::RateLimited.as_str(), "rate_limited");
        assert_eq!(StrataErrorCode::Internal.as_str(), "internal");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = StrataError::NotFound {
            resource_type: ResourceType::Table,
            resource_id: "ks.users".into(),
        };
        assert_eq!(err.code(), StrataErrorCode::TableNotFound);
        assert_eq!(err.code_str(), "table_not_found");
    }

    #[test]
    fn timeout_detected_through_durability_context() {
        let err = StrataError::Durability {
            keyspace: "ks".into(),
            table: "t".into(),
            key: "0x01".into(),
            source: Box::new(StrataError::Timeout),
        };
        assert!(err.is_timeout());
        assert_eq!(err.code(), StrataErrorCode::Durability);
    }
}
