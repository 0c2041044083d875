// Error handling module
// Defines the client error taxonomy and user-facing messages

use thiserror::Error;

/// Message used when the server supplied none and the caller gave no fallback
const GENERIC_FAILURE: &str = "Request failed";

/// Errors surfaced by the request pipeline and session operations
#[derive(Error, Debug)]
pub enum ClientError {
    /// Rejected locally before any network call
    #[error("{0}")]
    Validation(String),

    /// Non-2xx response from the API
    /// `message` is the server-supplied `message` field, if any
    #[error("{}", .message.as_deref().unwrap_or(GENERIC_FAILURE))]
    Http { status: u16, message: Option<String> },

    /// Refresh failed or the replayed request was rejected again;
    /// the local session has already been dropped
    #[error("{0}")]
    SessionExpired(String),

    /// Network unreachable, timeout, or a broken connection
    #[error("{message}")]
    Transport {
        message: String,
        #[source]
        source: reqwest::Error,
    },

    /// 2xx response whose body does not match the API envelope
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Local failure (credential storage, request construction)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Replace a missing server message with an operation-specific one
    ///
    /// Server-supplied messages always win; transport failures are reported
    /// with the fallback since their low-level text means nothing to users.
    pub fn or_fallback(self, fallback: &str) -> Self {
        match self {
            ClientError::Http {
                status,
                message: None,
            } => ClientError::Http {
                status,
                message: Some(fallback.to_string()),
            },
            ClientError::Transport { source, .. } => ClientError::Transport {
                message: fallback.to_string(),
                source,
            },
            other => other,
        }
    }

    /// HTTP status of the failed response, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// Whether this failure already forced a local sign-out
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ClientError::SessionExpired(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Transport {
            message: e.to_string(),
            source: e,
        }
    }
}

/// Pull the `message` field out of an error response body
///
/// Returns `None` for non-JSON bodies and blank messages.
pub fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("message")
        .and_then(|m| m.as_str())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
