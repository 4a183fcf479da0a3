use thiserror::Error;

/// Failures while turning inbound bytes into a [`crate::protocol::Message`].
///
/// Fatal errors leave the byte stream in a state the decoder cannot
/// resynchronise from; the connection has to be dropped. Everything else is
/// answered with a `401` and the decoder starts over at the next initial line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed initial line: {0:?}")]
    MalformedInitialLine(String),

    #[error("Unknown method: {0:?}")]
    UnknownMethod(String),

    #[error("Invalid status code: {0:?}")]
    InvalidStatus(String),

    #[error("Malformed header line: {0:?}")]
    MalformedHeader(String),

    #[error("Invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("Line exceeds {max} bytes without a terminator")]
    LineTooLong { max: usize },

    #[error("Body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::LineTooLong { .. } | ProtocolError::BodyTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(ProtocolError::LineTooLong { max: 8 }.is_fatal());
        assert!(ProtocolError::BodyTooLarge { size: 9, max: 8 }.is_fatal());
        assert!(!ProtocolError::MalformedHeader("x".into()).is_fatal());
        assert!(!ProtocolError::UnknownMethod("GET".into()).is_fatal());
    }
}
