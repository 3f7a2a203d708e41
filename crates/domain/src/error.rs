use std::fmt;

/// Uniqueness constraints a storage adapter can report as violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    /// `(turn_id, sequence)` on messages.
    TurnSequence,
    /// Primary key (`id`) of any record.
    PrimaryKey,
    /// Conditional turn update: stored status differed from the expected one.
    TurnStatus,
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TurnSequence => f.write_str("message(turn_id, sequence)"),
            Self::PrimaryKey => f.write_str("primary key"),
            Self::TurnStatus => f.write_str("turn(status) precondition"),
        }
    }
}

/// Failure reported by a storage adapter.
///
/// Conflicts are structured so callers never have to match on
/// driver-specific error text.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("unique constraint violated: {constraint}")]
    Conflict { constraint: Constraint },

    #[error("{table} {id} not found")]
    NotFound { table: &'static str, id: String },

    #[error("{0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_sequence_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                constraint: Constraint::TurnSequence
            }
        )
    }

    pub fn is_status_conflict(&self) -> bool {
        matches!(
            self,
            Self::Conflict {
                constraint: Constraint::TurnStatus
            }
        )
    }
}

/// Shared error type used across all conversation-state crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("turn {turn_id}: transition {from} -> {to} not allowed")]
    InvalidTransition {
        turn_id: String,
        from: String,
        to: String,
    },

    #[error("storage: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: StorageError,
    },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("summarizer: {0}")]
    Summarizer(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Wrap a storage failure with a human-readable description of the
    /// record being written.
    pub fn storage(context: impl Into<String>, source: StorageError) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn is_sequence_conflict(&self) -> bool {
        matches!(self, Self::Storage { source, .. } if source.is_sequence_conflict())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_conflict_is_detected_through_wrapper() {
        let err = Error::storage(
            "inserting message m1",
            StorageError::Conflict {
                constraint: Constraint::TurnSequence,
            },
        );
        assert!(err.is_sequence_conflict());
        assert!(err.to_string().contains("message(turn_id, sequence)"));
    }

    #[test]
    fn primary_key_conflict_is_not_a_sequence_conflict() {
        let err = StorageError::Conflict {
            constraint: Constraint::PrimaryKey,
        };
        assert!(!err.is_sequence_conflict());
    }
}
