//! Error types for GitHub API communication.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A failed call to the GitHub API.
///
/// Non-2xx responses carry the status code; transport failures (DNS,
/// TLS, connection reset) have no code.
#[derive(Debug, Clone)]
pub struct ApiFailure {
    pub code: Option<u16>,
    pub url: String,
    pub text: String,
    pub json: Option<Value>,
}

impl ApiFailure {
    pub fn from_response(code: u16, url: impl Into<String>, text: String) -> Self {
        let json = serde_json::from_str::<Value>(&text)
            .ok()
            .filter(|v| v.is_object());
        Self {
            code: Some(code),
            url: url.into(),
            text,
            json,
        }
    }

    pub fn transport(url: impl Into<String>, err: &reqwest::Error) -> Self {
        Self {
            code: None,
            url: url.into(),
            text: err.to_string(),
            json: None,
        }
    }

    /// The `message` field GitHub puts in error bodies, if any.
    pub fn message(&self) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|j| j.get("message"))
            .and_then(Value::as_str)
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "GitHub API error {} for {}", code, self.url)?,
            None => write!(f, "GitHub API unreachable at {}", self.url)?,
        }
        if let Some(message) = self.message() {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiFailure {}

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error(transparent)]
    Api(#[from] ApiFailure),

    /// The installation token could not be refreshed.
    #[error("Failed to refresh installation token: {0}")]
    Authentication(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GitHubError {
    pub fn as_api_failure(&self) -> Option<&ApiFailure> {
        match self {
            GitHubError::Api(failure) => Some(failure),
            _ => None,
        }
    }
}

pub type Result<T, E = GitHubError> = std::result::Result<T, E>;
