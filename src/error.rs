//! Error taxonomy for the retrieval core.
//!
//! Per the error handling design: almost every internal failure degrades to
//! a fallback and never reaches the caller. Only the two variants here are
//! allowed to surface as an `Err` from the orchestrator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("retrieval unavailable: all of vector, text, and cluster search failed")]
    RetrievalUnavailable,
}

pub type CoreResult<T> = Result<T, CoreError>;
