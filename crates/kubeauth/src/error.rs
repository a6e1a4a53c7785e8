//! The closed error taxonomy of the authentication layer, plus the mapping
//! from transport-level outcomes onto it.

use std::time::Duration;

use reqwest::{Response, StatusCode};

/// Every [`Error::CredentialRefresh`] message starts with this text.
pub const OIDC_REFRESH_ERROR_PREFIX: &str = "Unable to refresh OIDC token.";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown context, cluster or user, or an unusable configuration.
    #[error("configuration error: {0}")]
    Configuration(#[from] kubeauth_config::Error),

    /// Malformed or mismatched certificate/key material, or an unreadable
    /// credential file.
    #[error("credential error: {0}")]
    Credential(String),

    #[error("exec plugin error: {0}")]
    ExecPlugin(#[from] ExecPluginError),

    #[error("Unable to refresh OIDC token. {0}")]
    CredentialRefresh(String),

    /// The server rejected the credential.
    #[error("unauthorized: server responded with status {status_code}")]
    Unauthorized { status_code: u16 },

    /// A request path that does not form a URL under the server address.
    #[error("invalid request URL {url}: {source}")]
    InvalidRequestUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Connection, TLS handshake, or HTTP protocol failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failures of an external credential plugin.
#[derive(Debug, thiserror::Error)]
pub enum ExecPluginError {
    #[error("failed to start `{command}`: {source}{hint}")]
    Spawn {
        command: String,
        hint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code}: {stderr}")]
    Exit {
        command: String,
        code: String,
        stderr: String,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` wrote more than {limit} bytes to stdout")]
    OutputTooLarge { command: String, limit: usize },

    #[error("io error while running `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ExecCredential output: {0}")]
    InvalidOutput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn credential(message: impl Into<String>) -> Self {
        Self::Credential(message.into())
    }

    pub(crate) fn refresh(reason: impl Into<String>) -> Self {
        Self::CredentialRefresh(reason.into())
    }

    /// Translate a response status into a taxonomy member, if it is one.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        (status == StatusCode::UNAUTHORIZED).then_some(Self::Unauthorized {
            status_code: status.as_u16(),
        })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// HTTP status carried by the error, when the server produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Unauthorized { status_code } => Some(*status_code),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Pass a response through unless its status maps onto an [`Error`].
pub fn check_response(response: Response) -> Result<Response> {
    match Error::from_status(response.status()) {
        Some(err) => Err(err),
        None => Ok(response),
    }
}
