//! Error types for query assembly.

use thiserror::Error;

/// Errors that can occur while assembling query text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// A parameter declaration did not contain a recognizable name.
    #[error("could not parse a parameter name from declaration: {declaration}")]
    MalformedDeclaration {
        /// The offending declaration text.
        declaration: String,
    },
}

/// Result type for query assembly operations.
pub type QueryResult<T> = std::result::Result<T, QueryError>;
