// 🚨 Error taxonomy for graph build, traversal and benchmarking
//
// Build-time record problems are counted, not raised (see BuildStats).
// Everything here reaches the caller with enough detail to tell
// "no result" apart from "failed to compute".

use crate::entities::NodeKey;
use crate::records::MalformedReason;
use crate::traversal::QueryClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GraphError {
    /// A single input record is unusable (skipped and counted by the builder)
    #[error("malformed record: {0}")]
    MalformedRecord(MalformedReason),

    /// The backend cannot run this traversal class (natively or emulated)
    #[error("{class} is not supported on backend {backend}")]
    CapabilityUnsupported { backend: String, class: QueryClass },

    /// Traversal exceeded its deadline; partial work was discarded
    #[error("{class} timed out after {limit_ms} ms, partial results discarded")]
    TraversalTimeout { class: QueryClass, limit_ms: u128 },

    /// Build exceeded its deadline; the previous graph is left in place
    #[error("graph build timed out after {limit_ms} ms")]
    BuildTimeout { limit_ms: u128 },

    /// Connection or health failure
    #[error("backend {backend} unavailable: {cause}")]
    BackendUnavailable { backend: String, cause: String },

    /// Traversal attempted during an exclusive rebuild window
    #[error("graph rebuild in progress on backend {backend}")]
    RebuildInProgress { backend: String },

    #[error("no input records supplied")]
    EmptyInput,

    #[error("no valid records in input ({malformed} malformed)")]
    NoValidRecords { malformed: u64 },

    #[error("node not found: {0}")]
    NodeNotFound(NodeKey),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("surrogate id collision between {first} and {second}")]
    IdCollision { first: NodeKey, second: NodeKey },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GraphError {
    /// Stable tag stored in benchmark run records
    pub fn error_kind(&self) -> &'static str {
        match self {
            GraphError::MalformedRecord(_) => "MalformedRecord",
            GraphError::CapabilityUnsupported { .. } => "CapabilityUnsupported",
            GraphError::TraversalTimeout { .. } => "TraversalTimeout",
            GraphError::BuildTimeout { .. } => "BuildTimeout",
            GraphError::BackendUnavailable { .. } => "BackendUnavailable",
            GraphError::RebuildInProgress { .. } => "RebuildInProgress",
            GraphError::EmptyInput => "EmptyInput",
            GraphError::NoValidRecords { .. } => "NoValidRecords",
            GraphError::NodeNotFound(_) => "NodeNotFound",
            GraphError::InvalidParameter(_) => "InvalidParameter",
            GraphError::IdCollision { .. } => "IdCollision",
            GraphError::Sqlite(_) => "Sqlite",
            GraphError::Io(_) => "Io",
            GraphError::Json(_) => "Json",
        }
    }

    /// True when the remaining measurements of this backend are pointless
    pub fn is_backend_fatal(&self) -> bool {
        matches!(self, GraphError::BackendUnavailable { .. })
    }

    pub fn unavailable(backend: &str, cause: impl ToString) -> Self {
        GraphError::BackendUnavailable {
            backend: backend.to_string(),
            cause: cause.to_string(),
        }
    }
}

pub type GraphResult<T> = Result<T, GraphError>;
