use std::fmt;

use thiserror::Error;

/// Which external collaborator raised a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorKind {
    Tokenizer,
    Embedder,
    Storage,
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tokenizer => "tokenizer",
            Self::Embedder => "embedder",
            Self::Storage => "storage backend",
        };
        f.write_str(name)
    }
}

/// Coarse grouping used by a transport layer to pick a client-facing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadInput,
    Unavailable,
    Internal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cannot index an empty chunk sequence")]
    EmptyInput,

    #[error("Vector index is empty: call index before search")]
    NotIndexed,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("{kind} failed: {source}")]
    Collaborator {
        kind: CollaboratorKind,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn tokenizer(source: anyhow::Error) -> Self {
        Self::Collaborator { kind: CollaboratorKind::Tokenizer, source }
    }

    pub fn embedder(source: anyhow::Error) -> Self {
        Self::Collaborator { kind: CollaboratorKind::Embedder, source }
    }

    pub fn storage(source: anyhow::Error) -> Self {
        Self::Collaborator { kind: CollaboratorKind::Storage, source }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidConfig(_) | Self::InvalidInput(_) | Self::EmptyInput | Self::NotIndexed => {
                ErrorClass::BadInput
            }
            Self::Collaborator { .. } => ErrorClass::Unavailable,
            Self::DimensionMismatch { .. } => ErrorClass::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
