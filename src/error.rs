use thiserror::Error;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("schema mismatch for `{entity}`: expected {expected} properties, found {found}")]
    SchemaMismatch {
        entity: String,
        expected: usize,
        found: usize,
    },

    #[error("store mutation failed while upserting {step}: {message}")]
    StoreMutation { step: &'static str, message: String },

    #[error("graph store error: {0}")]
    Store(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("index persistence failed: {0}")]
    IndexPersist(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Format(_) => "FORMAT_ERROR",
            Self::Schema(_) => "SCHEMA_ERROR",
            Self::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Self::StoreMutation { .. } => "STORE_MUTATION_FAILURE",
            Self::Store(_) | Self::Sqlite(_) => "STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::IndexPersist(_) => "INDEX_PERSIST_FAILED",
            Self::Embedding(_) => "EMBEDDING_FAILED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Errors raised while turning a line into a `Table`. These only
    /// invalidate the current node.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::Format(_) | Self::Schema(_)
        )
    }
}
