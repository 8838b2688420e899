use thiserror::Error;
use tdist_protocol::{AddressError, ErrorCode};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Protocol error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Error::Aborted(_) => ErrorCode::Aborted,
            Error::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            Error::Cancelled(_) => ErrorCode::Cancelled,
            Error::Unavailable(_) => ErrorCode::Unavailable,
            Error::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            Error::Internal(_) | Error::Io(_) => ErrorCode::Internal,
        }
    }

    /// Message sent over the wire; I/O details stay on the server.
    pub fn message(&self) -> String {
        match self {
            Error::InvalidArgument(m)
            | Error::NotFound(m)
            | Error::FailedPrecondition(m)
            | Error::Aborted(m)
            | Error::DeadlineExceeded(m)
            | Error::Cancelled(m)
            | Error::Unavailable(m)
            | Error::ResourceExhausted(m)
            | Error::Internal(m) => m.clone(),
            Error::Io(_) => "internal I/O error".to_string(),
        }
    }

    /// Rebuild an error received from a server.
    pub fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::InvalidArgument => Error::InvalidArgument(message),
            ErrorCode::NotFound => Error::NotFound(message),
            ErrorCode::FailedPrecondition => Error::FailedPrecondition(message),
            ErrorCode::Aborted => Error::Aborted(message),
            ErrorCode::DeadlineExceeded => Error::DeadlineExceeded(message),
            ErrorCode::Cancelled => Error::Cancelled(message),
            ErrorCode::Unavailable => Error::Unavailable(message),
            ErrorCode::ResourceExhausted => Error::ResourceExhausted(message),
            ErrorCode::Internal => Error::Internal(message),
        }
    }
}

impl From<AddressError> for Error {
    fn from(err: AddressError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("malformed payload: {err}"))
    }
}
