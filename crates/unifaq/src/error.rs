use thiserror::Error;

/// Failure classes the router branches on. Messages are safe to show to
/// callers; driver/provider details are logged via `tracing`, never
/// embedded here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("question classification failed")]
    Classification(#[source] anyhow::Error),

    #[error("could not generate a valid SQL statement")]
    SqlGeneration { reason: String },

    #[error("SQL execution was rejected by the database")]
    SqlExecution(#[source] anyhow::Error),

    #[error("query returned no rows")]
    EmptyResult,

    #[error("vector retrieval failed")]
    Retrieval(#[source] anyhow::Error),

    #[error("answer generation failed")]
    Generation(#[source] anyhow::Error),

    #[error("request was cancelled")]
    Cancelled,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
