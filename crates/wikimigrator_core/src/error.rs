use thiserror::Error;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("invalid page identifier: {0:?}")]
    InvalidIdentifier(String),

    /// A remote service answered with a structured error payload.
    #[error("{service} call {operation} failed with code {code}: {message}")]
    Remote {
        service: &'static str,
        operation: String,
        code: i64,
        message: String,
    },

    #[error("{service} request {operation} failed with HTTP {status}: {body}")]
    Http {
        service: &'static str,
        operation: String,
        status: u16,
        body: String,
    },

    #[error("[{0}] must be configured for this command")]
    MissingConfig(&'static str),
}
