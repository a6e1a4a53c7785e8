//! Resolution of a kubeconfig context into a [`Configuration`].

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info};

use crate::configuration::{
    AuthConfig, Configuration, DataSource, ExecConfig, OidcConfig, TokenSource,
};
use crate::error::{Error, Result};
use crate::kubeconfig::{AuthProviderSpec, Cluster, ExecSpec, Kubeconfig, User};

/// Selects one context from a [`Kubeconfig`] and flattens its cluster and
/// user into a [`Configuration`].
///
/// Resolution is purely in-memory: no files are read and no plugins are
/// run. File-backed material is loaded later, when the credential provider
/// and transport are built.
pub struct ConfigResolver<'a> {
    kubeconfig: &'a Kubeconfig,
    context: Option<String>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(kubeconfig: &'a Kubeconfig) -> Self {
        Self {
            kubeconfig,
            context: None,
        }
    }

    /// Use the named context instead of `current-context`.
    pub fn context(mut self, name: impl Into<String>) -> Self {
        self.context = Some(name.into());
        self
    }

    pub fn resolve(&self) -> Result<Configuration> {
        let context_name = self
            .context
            .as_deref()
            .or(self.kubeconfig.current_context.as_deref())
            .filter(|name| !name.is_empty())
            .ok_or(Error::NoCurrentContext)?;

        let context = self
            .kubeconfig
            .context(context_name)
            .ok_or_else(|| Error::ContextNotFound(context_name.to_string()))?;
        let cluster =
            self.kubeconfig
                .cluster(&context.cluster)
                .ok_or_else(|| Error::ClusterNotFound {
                    context: context_name.to_string(),
                    cluster: context.cluster.clone(),
                })?;
        let user = if context.user.is_empty() {
            None
        } else {
            let user = self
                .kubeconfig
                .user(&context.user)
                .ok_or_else(|| Error::UserNotFound {
                    context: context_name.to_string(),
                    user: context.user.clone(),
                })?;
            Some(user)
        };

        let server = cluster
            .server
            .as_deref()
            .filter(|server| !server.is_empty())
            .ok_or_else(|| Error::MissingServer(context.cluster.clone()))?;

        let auth = match user {
            Some(user) => select_auth(&context.user, user)?,
            None => AuthConfig::Anonymous,
        };
        info!(
            context = context_name,
            cluster = %context.cluster,
            user = %context.user,
            auth = auth.kind(),
            "resolved kubeconfig context"
        );

        let mut builder = Configuration::builder(server)
            .context_name(context_name)
            .auth(auth)
            .insecure_skip_tls_verify(cluster.insecure_skip_tls_verify);
        if let Some(authority) = certificate_authority(cluster)? {
            builder = builder.certificate_authority(authority);
        }
        if let Some(namespace) = &context.namespace {
            builder = builder.namespace(namespace.clone());
        }
        if let Some(proxy_url) = cluster.proxy_url.as_deref().filter(|url| !url.is_empty()) {
            builder = builder.proxy_url(proxy_url);
        }
        builder.build()
    }
}

impl Configuration {
    /// Resolve the named context (or `current-context`) of `kubeconfig`.
    pub fn from_kubeconfig(kubeconfig: &Kubeconfig, context: Option<&str>) -> Result<Self> {
        let mut resolver = ConfigResolver::new(kubeconfig);
        if let Some(context) = context {
            resolver = resolver.context(context);
        }
        resolver.resolve()
    }

    /// Resolve `current-context` of the default kubeconfig
    /// (`KUBECONFIG` or `~/.kube/config`).
    pub fn infer() -> Result<Self> {
        Self::from_kubeconfig(&Kubeconfig::load_default()?, None)
    }
}

fn certificate_authority(cluster: &Cluster) -> Result<Option<DataSource>> {
    data_or_file(
        cluster.certificate_authority_data.as_deref(),
        cluster.certificate_authority.as_deref(),
        "certificate-authority-data",
    )
}

/// Inline base64 data wins over a file path, as with `kubectl`.
fn data_or_file(
    data: Option<&str>,
    path: Option<&str>,
    field: &'static str,
) -> Result<Option<DataSource>> {
    if let Some(data) = data.filter(|data| !data.is_empty()) {
        return decode_base64(data, field).map(|bytes| Some(DataSource::Inline(bytes)));
    }
    Ok(path
        .filter(|path| !path.is_empty())
        .map(|path| DataSource::File(PathBuf::from(path))))
}

fn decode_base64(data: &str, field: &'static str) -> Result<Vec<u8>> {
    let compact: String = data.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|source| Error::InvalidBase64 { field, source })
}

/// Pick the single active mechanism. Precedence: exec, auth-provider,
/// token, basic, client certificate, anonymous.
fn select_auth(name: &str, user: &User) -> Result<AuthConfig> {
    let declared = declared_mechanisms(user);

    let selected = if let Some(exec) = &user.exec {
        AuthConfig::Exec(exec_config(name, exec)?)
    } else if let Some(provider) = &user.auth_provider {
        AuthConfig::Oidc(oidc_config(name, provider)?)
    } else if let Some(token) = user.token.as_deref().filter(|token| !token.is_empty()) {
        AuthConfig::Token(TokenSource::Inline(token.to_string()))
    } else if let Some(path) = user.token_file.as_deref().filter(|path| !path.is_empty()) {
        AuthConfig::Token(TokenSource::File(PathBuf::from(path)))
    } else if let (Some(username), Some(password)) = (&user.username, &user.password) {
        AuthConfig::Basic {
            username: username.clone(),
            password: password.clone(),
        }
    } else {
        let certificate = data_or_file(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            "client-certificate-data",
        )?;
        let key = data_or_file(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            "client-key-data",
        )?;
        match (certificate, key) {
            (Some(certificate), Some(key)) => AuthConfig::ClientCertificate { certificate, key },
            (None, None) => AuthConfig::Anonymous,
            _ => return Err(Error::IncompleteClientCertificate(name.to_string())),
        }
    };

    if declared.len() > 1 {
        debug!(
            user = name,
            selected = selected.kind(),
            declared = ?declared,
            "user declares several credential mechanisms; only one is used"
        );
    }
    Ok(selected)
}

fn declared_mechanisms(user: &User) -> Vec<&'static str> {
    let mut declared = Vec::new();
    if user.exec.is_some() {
        declared.push("exec");
    }
    if user.auth_provider.is_some() {
        declared.push("auth_provider");
    }
    if user.token.as_deref().is_some_and(|token| !token.is_empty()) || user.token_file.is_some() {
        declared.push("token");
    }
    if user.username.is_some() && user.password.is_some() {
        declared.push("basic");
    }
    if user.client_certificate.is_some() || user.client_certificate_data.is_some() {
        declared.push("client_certificate");
    }
    declared
}

fn exec_config(user: &str, exec: &ExecSpec) -> Result<ExecConfig> {
    let command = exec
        .command
        .clone()
        .filter(|command| !command.is_empty())
        .ok_or_else(|| Error::IncompleteExec {
            user: user.to_string(),
            field: "command",
        })?;
    let api_version = exec
        .api_version
        .clone()
        .filter(|version| !version.is_empty())
        .ok_or_else(|| Error::IncompleteExec {
            user: user.to_string(),
            field: "apiVersion",
        })?;

    Ok(ExecConfig {
        api_version,
        command,
        args: exec.args.clone(),
        env: exec
            .env
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect(),
        install_hint: exec.install_hint.clone(),
    })
}

fn oidc_config(user: &str, provider: &AuthProviderSpec) -> Result<OidcConfig> {
    if provider.name != "oidc" {
        return Err(Error::UnsupportedAuthProvider {
            user: user.to_string(),
            provider: provider.name.clone(),
        });
    }

    let get = |key: &str| {
        provider
            .config
            .get(key)
            .filter(|value| !value.is_empty())
            .cloned()
    };
    let idp_certificate_authority = data_or_file(
        provider
            .config
            .get("idp-certificate-authority-data")
            .map(String::as_str),
        provider
            .config
            .get("idp-certificate-authority")
            .map(String::as_str),
        "idp-certificate-authority-data",
    )?;

    Ok(OidcConfig {
        client_id: get("client-id").unwrap_or_default(),
        client_secret: get("client-secret"),
        issuer_url: get("idp-issuer-url"),
        id_token: get("id-token"),
        refresh_token: get("refresh-token"),
        idp_certificate_authority,
    })
}
