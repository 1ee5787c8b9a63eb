use std::io;

use thiserror::Error;

/// Standard error type for the Etude engine.
///
/// Operations return one of these kinds instead of panicking; request-path
/// code never unwraps. Parse failures map to a 4xx when response headers
/// have not been written yet, otherwise the connection is closed.
#[derive(Debug, Error)]
pub enum WebError {
    #[error("bad arguments: {0}")]
    BadArgs(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("out of memory: {0}")]
    Memory(String),

    #[error("cannot connect: {0}")]
    CantConnect(String),

    #[error("cannot read: {0}")]
    CantRead(String),

    #[error("cannot write: {0}")]
    CantWrite(String),

    #[error("cannot complete: {0}")]
    CantComplete(String),

    #[error("timeout")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),
}

impl WebError {
    /// Get the HTTP status this error maps to when it surfaces before
    /// response headers have been written.
    pub fn status_code(&self) -> u16 {
        match self {
            WebError::BadArgs(_) => 400,
            WebError::BadState(_) => 500,
            WebError::Memory(_) => 413,
            WebError::CantConnect(_) => 503,
            WebError::CantRead(_) => 400,
            WebError::CantWrite(_) => 500,
            WebError::CantComplete(_) => 500,
            WebError::Timeout => 408,
            WebError::NotFound(_) => 404,
        }
    }

    /// True for errors that must tear the connection down instead of
    /// producing an HTTP response (transport-level failures).
    pub fn is_net_error(&self) -> bool {
        matches!(
            self,
            WebError::CantConnect(_) | WebError::CantRead(_) | WebError::CantWrite(_)
        )
    }

    /// Classify an I/O error from a socket read.
    pub fn read_io(err: io::Error) -> Self {
        WebError::CantRead(err.to_string())
    }

    /// Classify an I/O error from a socket write.
    pub fn write_io(err: io::Error) -> Self {
        WebError::CantWrite(err.to_string())
    }
}

pub type WebResult<T> = Result<T, WebError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(WebError::BadArgs("x".into()).status_code(), 400);
        assert_eq!(WebError::NotFound("x".into()).status_code(), 404);
        assert_eq!(WebError::Timeout.status_code(), 408);
        assert_eq!(WebError::Memory("body".into()).status_code(), 413);
    }

    #[test]
    fn test_net_errors_close_connection() {
        assert!(WebError::CantRead("eof".into()).is_net_error());
        assert!(!WebError::BadArgs("header".into()).is_net_error());
        assert!(!WebError::Timeout.is_net_error());
    }
}
