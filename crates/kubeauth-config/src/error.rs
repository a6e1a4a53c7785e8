use std::path::PathBuf;

/// Errors raised while loading or resolving a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no kubeconfig found (set KUBECONFIG or create ~/.kube/config)")]
    NoConfigFile,

    #[error("could not resolve home directory")]
    MissingHomeDir,

    #[error("no context selected and current-context is not set")]
    NoCurrentContext,

    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("cluster '{cluster}' referenced by context '{context}' not found")]
    ClusterNotFound { context: String, cluster: String },

    #[error("user '{user}' referenced by context '{context}' not found")]
    UserNotFound { context: String, user: String },

    #[error("cluster '{0}' has no server")]
    MissingServer(String),

    #[error("invalid url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid base64 in {field}: {source}")]
    InvalidBase64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("user '{0}' sets only one of client certificate and client key")]
    IncompleteClientCertificate(String),

    #[error("user '{user}' exec config is missing `{field}`")]
    IncompleteExec { user: String, field: &'static str },

    #[error("user '{user}' uses unsupported auth provider '{provider}'")]
    UnsupportedAuthProvider { user: String, provider: String },
}

pub type Result<T> = std::result::Result<T, Error>;
