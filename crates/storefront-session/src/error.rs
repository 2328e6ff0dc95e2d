use thiserror::Error;

/// Coarse classification callers branch on instead of matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retrying later may succeed; credentials are untouched.
    Transient,
    /// Retrying the same call cannot succeed.
    Terminal,
    /// The caller supplied bad input.
    Validation,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Invalid refresh response: {0}")]
    InvalidRefreshResponse(String),

    #[error("Refresh token rejected - session has ended")]
    RefreshRejected,

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Token expired after replay")]
    TokenExpired,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl SessionError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        SessionError::Http {
            status,
            body: Self::truncate_body(body),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::TransientNetwork(_)
            | SessionError::Connection(_)
            | SessionError::Storage(_) => ErrorKind::Transient,
            SessionError::Http { status, .. } if *status == 429 || *status >= 500 => {
                ErrorKind::Transient
            }
            SessionError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Terminal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(err: reqwest::Error) -> Self {
        SessionError::TransientNetwork(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SessionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SessionError::Connection(err.to_string())
    }
}
