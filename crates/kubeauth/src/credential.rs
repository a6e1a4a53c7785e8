//! Credential providers: one per authentication mechanism.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use kubeauth_config::{AuthConfig, Configuration, ExecConfig, TokenSource};
use tracing::debug;

use crate::error::{Error, Result};
use crate::exec::{DEFAULT_EXEC_TIMEOUT, ExecMaterial, ExecPluginRunner};
use crate::oidc::OidcProvider;
use crate::tls::ClientIdentity;
use crate::token::{TokenCache, TokenState};

/// What a request carries to prove who it is.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    None,
    /// Complete `Authorization` header value, scheme included.
    Authorization(String),
    /// Presented during the TLS handshake.
    ClientCertificate(Arc<ClientIdentity>),
}

impl Credential {
    pub fn basic(username: &str, password: &str) -> Self {
        let encoded = STANDARD.encode(format!("{username}:{password}"));
        Self::Authorization(format!("Basic {encoded}"))
    }

    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self::Authorization(format!("Bearer {}", token.as_ref()))
    }

    pub fn authorization(&self) -> Option<&str> {
        match self {
            Self::Authorization(value) => Some(value),
            _ => None,
        }
    }

    pub fn identity(&self) -> Option<&Arc<ClientIdentity>> {
        match self {
            Self::ClientCertificate(identity) => Some(identity),
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Authorization(value) => {
                let scheme = value.split_once(' ').map_or("", |(scheme, _)| scheme);
                write!(f, "Authorization({scheme} <redacted>)")
            }
            Self::ClientCertificate(identity) => {
                f.debug_tuple("ClientCertificate").field(identity).finish()
            }
        }
    }
}

/// Produces the [`Credential`] for each request.
///
/// Anonymous, basic, static token and client certificate providers are
/// fixed at construction. Exec and OIDC providers cache their credential
/// and refresh it once it expires.
pub enum CredentialProvider {
    Anonymous,
    Basic { username: String, password: String },
    StaticToken { token: String },
    ClientCertificate(Arc<ClientIdentity>),
    Exec(ExecProvider),
    Oidc(OidcProvider),
}

impl CredentialProvider {
    /// Build the provider for the configuration's auth mechanism.
    ///
    /// Files (token file, certificate and key) are read here. Exec plugins
    /// are not run until the first [`resolve`](Self::resolve).
    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let provider = match config.auth() {
            AuthConfig::Anonymous => Self::Anonymous,
            AuthConfig::Basic { username, password } => Self::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            AuthConfig::Token(TokenSource::Inline(token)) => Self::StaticToken {
                token: token.clone(),
            },
            AuthConfig::Token(TokenSource::File(path)) => {
                let token = std::fs::read_to_string(path).map_err(|err| {
                    Error::credential(format!(
                        "failed to read token file {}: {err}",
                        path.display()
                    ))
                })?;
                let token = token.trim();
                if token.is_empty() {
                    return Err(Error::credential(format!(
                        "token file {} is empty",
                        path.display()
                    )));
                }
                Self::StaticToken {
                    token: token.to_string(),
                }
            }
            AuthConfig::ClientCertificate { certificate, key } => {
                let identity = ClientIdentity::from_sources(certificate, key)?;
                Self::ClientCertificate(Arc::new(identity))
            }
            AuthConfig::Exec(exec) => {
                let timeout = config.timeout().unwrap_or(DEFAULT_EXEC_TIMEOUT);
                Self::Exec(ExecProvider::new(
                    exec.clone(),
                    ExecPluginRunner::process(timeout),
                ))
            }
            AuthConfig::Oidc(oidc) => Self::Oidc(OidcProvider::new(oidc.clone(), config.timeout())?),
        };
        debug!(auth = provider.kind(), "credential provider ready");
        Ok(provider)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Basic { .. } => "basic",
            Self::StaticToken { .. } => "token",
            Self::ClientCertificate(_) => "client_certificate",
            Self::Exec(_) => "exec",
            Self::Oidc(_) => "oidc",
        }
    }

    /// The credential to attach to the next request.
    pub async fn resolve(&self) -> Result<Credential> {
        match self {
            Self::Anonymous => Ok(Credential::None),
            Self::Basic { username, password } => Ok(Credential::basic(username, password)),
            Self::StaticToken { token } => Ok(Credential::bearer(token)),
            Self::ClientCertificate(identity) => {
                Ok(Credential::ClientCertificate(Arc::clone(identity)))
            }
            Self::Exec(provider) => provider.resolve().await,
            Self::Oidc(provider) => provider.resolve().await,
        }
    }

    /// Drop cached state so the next [`resolve`](Self::resolve) fetches a
    /// fresh credential. No-op for providers without state.
    pub fn invalidate(&self) {
        match self {
            Self::Exec(provider) => provider.cache.invalidate(),
            Self::Oidc(provider) => provider.invalidate(),
            _ => {}
        }
    }

    /// The cached credential of a stateful provider.
    pub fn token_state(&self) -> Option<TokenState> {
        match self {
            Self::Exec(provider) => provider.cache.snapshot(),
            Self::Oidc(provider) => provider.token_state(),
            _ => None,
        }
    }

    /// The identity known before any request is made.
    pub fn static_identity(&self) -> Option<&Arc<ClientIdentity>> {
        match self {
            Self::ClientCertificate(identity) => Some(identity),
            _ => None,
        }
    }
}

impl fmt::Debug for CredentialProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialProvider::{}", self.kind())
    }
}

/// Credentials obtained by running an external plugin, cached until the
/// expiry the plugin reported.
pub struct ExecProvider {
    config: ExecConfig,
    runner: ExecPluginRunner,
    cache: TokenCache,
}

impl ExecProvider {
    pub fn new(config: ExecConfig, runner: ExecPluginRunner) -> Self {
        Self {
            config,
            runner,
            cache: TokenCache::empty(),
        }
    }

    pub async fn resolve(&self) -> Result<Credential> {
        self.cache
            .get_or_refresh(|| async {
                let output = self.runner.run(&self.config).await?;
                let credential = match output.material {
                    ExecMaterial::Token(token) => Credential::bearer(token),
                    ExecMaterial::Certificate {
                        certificate_pem,
                        key_pem,
                    } => {
                        let identity =
                            ClientIdentity::from_pem(certificate_pem.as_bytes(), key_pem.as_bytes())?;
                        Credential::ClientCertificate(Arc::new(identity))
                    }
                };
                Ok::<_, Error>(TokenState::new(credential, output.expires_at))
            })
            .await
    }
}
