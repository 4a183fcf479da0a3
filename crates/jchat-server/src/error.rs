use jchat_shared::StatusCode;
use jchat_store::StoreError;
use thiserror::Error;

/// Failures that stop the server from starting or keep the loop from running.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Why a single request was refused.
///
/// Each variant maps to either an error status (401/402/403) or a
/// `Return: wrong` answer with a reason code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Unsupported request: {0}")]
    Unsupported(StatusCode),

    #[error("No such user: {0}")]
    NoSuchUser(String),

    #[error("Not signed in on this connection: {0}")]
    NotSignedIn(String),

    #[error("Rejected: {0}")]
    Wrong(&'static str),
}

impl RequestError {
    /// Error status for this refusal, or `None` when it is answered with the
    /// request's own result status and `Return: wrong`.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::MissingHeader(_)
            | RequestError::InvalidName(_)
            | RequestError::Unsupported(_) => Some(StatusCode::MALFORMED),
            RequestError::NoSuchUser(_) => Some(StatusCode::NOT_FOUND),
            RequestError::NotSignedIn(_) => Some(StatusCode::NOT_AUTHENTICATED),
            RequestError::Wrong(_) => None,
        }
    }
}
