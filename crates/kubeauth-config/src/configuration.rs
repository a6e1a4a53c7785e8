//! The normalized, immutable connection configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

const DEFAULT_NAMESPACE: &str = "default";

/// Bytes that are either embedded in the configuration or read from a file
/// when the credential is first loaded.
#[derive(Clone, PartialEq, Eq)]
pub enum DataSource {
    Inline(Vec<u8>),
    File(PathBuf),
}

impl DataSource {
    pub fn load(&self) -> std::io::Result<Vec<u8>> {
        match self {
            DataSource::Inline(bytes) => Ok(bytes.clone()),
            DataSource::File(path) => std::fs::read(path),
        }
    }

    /// Short description for logs and error messages; never the data itself.
    pub fn describe(&self) -> String {
        match self {
            DataSource::Inline(bytes) => format!("inline data ({} bytes)", bytes.len()),
            DataSource::File(path) => path.display().to_string(),
        }
    }
}

impl fmt::Debug for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Trust settings for the API server connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM bundle of trusted authorities. `None` means the platform store.
    pub certificate_authority: Option<DataSource>,
    /// Skip server certificate verification. Development use only.
    pub insecure_skip_tls_verify: bool,
}

/// Where a static bearer token comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum TokenSource {
    Inline(String),
    File(PathBuf),
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::Inline(_) => f.write_str("Inline(<redacted>)"),
            TokenSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// External credential plugin invocation settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ExecConfig {
    pub api_version: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub install_hint: Option<String>,
}

impl fmt::Debug for ExecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_names: Vec<&str> = self.env.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ExecConfig")
            .field("api_version", &self.api_version)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &env_names)
            .finish_non_exhaustive()
    }
}

/// OpenID Connect refreshable ID token settings.
#[derive(Clone, PartialEq, Eq)]
pub struct OidcConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub issuer_url: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Authorities trusted when talking to the identity provider.
    pub idp_certificate_authority: Option<DataSource>,
}

impl fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcConfig")
            .field("client_id", &self.client_id)
            .field("issuer_url", &self.issuer_url)
            .field("has_id_token", &self.id_token.is_some())
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// The single credential mechanism active for a configuration.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum AuthConfig {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
    Token(TokenSource),
    ClientCertificate {
        certificate: DataSource,
        key: DataSource,
    },
    Exec(ExecConfig),
    Oidc(OidcConfig),
}

impl AuthConfig {
    /// Stable mechanism identifier (e.g. `"basic"` or `"exec"`).
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::Anonymous => "anonymous",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Token(_) => "token",
            AuthConfig::ClientCertificate { .. } => "client_certificate",
            AuthConfig::Exec(_) => "exec",
            AuthConfig::Oidc(_) => "oidc",
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Anonymous => f.write_str("Anonymous"),
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            AuthConfig::Token(source) => f.debug_tuple("Token").field(source).finish(),
            AuthConfig::ClientCertificate { certificate, key } => f
                .debug_struct("ClientCertificate")
                .field("certificate", certificate)
                .field("key", key)
                .finish(),
            AuthConfig::Exec(exec) => f.debug_tuple("Exec").field(exec).finish(),
            AuthConfig::Oidc(oidc) => f.debug_tuple("Oidc").field(oidc).finish(),
        }
    }
}

/// Everything needed to open an authenticated connection to one cluster.
///
/// Built either by [`ConfigResolver`](crate::ConfigResolver) from a
/// kubeconfig or with [`Configuration::builder`]. There are no setters; a
/// different connection needs a different `Configuration`.
#[derive(Debug, Clone)]
pub struct Configuration {
    host: Url,
    tls: TlsConfig,
    auth: AuthConfig,
    namespace: String,
    timeout: Option<Duration>,
    proxy_url: Option<Url>,
    context: Option<String>,
}

impl Configuration {
    pub fn builder(host: impl Into<String>) -> ConfigurationBuilder {
        ConfigurationBuilder::new(host)
    }

    pub fn host(&self) -> &Url {
        &self.host
    }

    pub fn tls(&self) -> &TlsConfig {
        &self.tls
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Per-request timeout, also applied to exec plugin invocations.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn proxy_url(&self) -> Option<&Url> {
        self.proxy_url.as_ref()
    }

    /// Name of the kubeconfig context this was resolved from, if any.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

/// Builder for an explicit [`Configuration`]. Each credential setter
/// replaces the previous one.
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    host: String,
    tls: TlsConfig,
    auth: AuthConfig,
    namespace: Option<String>,
    timeout: Option<Duration>,
    proxy_url: Option<String>,
    context: Option<String>,
}

impl ConfigurationBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            tls: TlsConfig::default(),
            auth: AuthConfig::Anonymous,
            namespace: None,
            timeout: None,
            proxy_url: None,
            context: None,
        }
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn basic_auth(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth(AuthConfig::Basic {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn bearer_token(self, token: impl Into<String>) -> Self {
        self.auth(AuthConfig::Token(TokenSource::Inline(token.into())))
    }

    pub fn client_certificate(self, certificate: DataSource, key: DataSource) -> Self {
        self.auth(AuthConfig::ClientCertificate { certificate, key })
    }

    pub fn exec(self, exec: ExecConfig) -> Self {
        self.auth(AuthConfig::Exec(exec))
    }

    pub fn oidc(self, oidc: OidcConfig) -> Self {
        self.auth(AuthConfig::Oidc(oidc))
    }

    pub fn certificate_authority(mut self, authority: DataSource) -> Self {
        self.tls.certificate_authority = Some(authority);
        self
    }

    pub fn insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        self.tls.insecure_skip_tls_verify = insecure;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy_url(mut self, proxy_url: impl Into<String>) -> Self {
        self.proxy_url = Some(proxy_url.into());
        self
    }

    pub(crate) fn context_name(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn build(self) -> Result<Configuration> {
        let host = parse_url(&self.host)?;
        let proxy_url = self.proxy_url.as_deref().map(parse_url).transpose()?;

        Ok(Configuration {
            host,
            tls: self.tls,
            auth: self.auth,
            namespace: self
                .namespace
                .filter(|namespace| !namespace.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            timeout: self.timeout,
            proxy_url,
            context: self.context,
        })
    }
}

fn parse_url(value: &str) -> Result<Url> {
    Url::parse(value).map_err(|source| Error::InvalidUrl {
        url: value.to_string(),
        source,
    })
}
