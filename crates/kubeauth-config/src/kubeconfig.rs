//! Types representing the on-disk kubeconfig format.
//!
//! These structs map 1:1 to the YAML documents written by `kubectl config`.
//! Unknown keys (`preferences`, `extensions`, ...) are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable holding a path list of kubeconfig files.
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

/// A parsed kubeconfig document (or the merge of several).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: Vec<NamedCluster>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub users: Vec<NamedUser>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: Vec<NamedContext>,

    /// Context used when the caller does not name one.
    #[serde(default)]
    pub current_context: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

/// Endpoint and TLS settings for one API server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    #[serde(default)]
    pub server: Option<String>,

    /// Path to a PEM bundle of trusted authorities.
    #[serde(default)]
    pub certificate_authority: Option<String>,

    /// Base64-encoded PEM bundle of trusted authorities.
    #[serde(default)]
    pub certificate_authority_data: Option<String>,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    #[serde(default)]
    pub proxy_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

/// Credential fields for one user. Several mechanisms may be declared; the
/// resolver activates exactly one of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default, rename = "tokenFile")]
    pub token_file: Option<String>,

    #[serde(default)]
    pub client_certificate: Option<String>,

    #[serde(default)]
    pub client_key: Option<String>,

    #[serde(default)]
    pub client_certificate_data: Option<String>,

    #[serde(default)]
    pub client_key_data: Option<String>,

    #[serde(default)]
    pub exec: Option<ExecSpec>,

    #[serde(default)]
    pub auth_provider: Option<AuthProviderSpec>,
}

/// `users[].user.exec` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSpec {
    #[serde(default)]
    pub api_version: Option<String>,

    #[serde(default)]
    pub command: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub args: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Vec<ExecEnvVar>,

    #[serde(default)]
    pub install_hint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecEnvVar {
    pub name: String,
    pub value: String,
}

/// `users[].user.auth-provider` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthProviderSpec {
    pub name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

/// Binds a cluster to a user by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    #[serde(default)]
    pub cluster: String,
    /// Empty for a context without credentials.
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub namespace: Option<String>,
}

impl Kubeconfig {
    /// Parse a kubeconfig document. Relative paths are left untouched.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Read a kubeconfig file, resolving relative paths against the file's
    /// directory.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text)?;
        if let Some(dir) = path.parent() {
            config.absolutize_paths(dir);
        }
        debug!(path = %path.display(), "loaded kubeconfig");
        Ok(config)
    }

    /// Load the kubeconfig the way `kubectl` does: every file listed in
    /// `KUBECONFIG` merged in order, or `~/.kube/config` when unset.
    pub fn load_default() -> Result<Self> {
        if let Some(paths) = std::env::var_os(KUBECONFIG_ENV) {
            let mut merged: Option<Kubeconfig> = None;
            for path in std::env::split_paths(&paths) {
                if path.as_os_str().is_empty() {
                    continue;
                }
                if !path.exists() {
                    debug!(path = %path.display(), "skipping missing kubeconfig");
                    continue;
                }
                let config = Self::read(&path)?;
                merged = Some(match merged {
                    Some(merged) => merged.merge(config),
                    None => config,
                });
            }
            return merged.ok_or(Error::NoConfigFile);
        }

        let path = default_path()?;
        if !path.exists() {
            return Err(Error::NoConfigFile);
        }
        Self::read(path)
    }

    /// Merge `other` into `self`. Entries already present by name win, as
    /// does an already-set `current-context`.
    pub fn merge(mut self, other: Kubeconfig) -> Self {
        for cluster in other.clusters {
            if self.cluster(&cluster.name).is_none() {
                self.clusters.push(cluster);
            }
        }
        for user in other.users {
            if self.user(&user.name).is_none() {
                self.users.push(user);
            }
        }
        for context in other.contexts {
            if self.context(&context.name).is_none() {
                self.contexts.push(context);
            }
        }
        if self
            .current_context
            .as_deref()
            .is_none_or(|name| name.is_empty())
        {
            self.current_context = other.current_context;
        }
        self
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.cluster)
    }

    pub fn user(&self, name: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.user)
    }

    pub fn context(&self, name: &str) -> Option<&Context> {
        self.contexts
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| &entry.context)
    }

    fn absolutize_paths(&mut self, dir: &Path) {
        for entry in &mut self.clusters {
            absolutize(&mut entry.cluster.certificate_authority, dir);
        }
        for entry in &mut self.users {
            let user = &mut entry.user;
            absolutize(&mut user.token_file, dir);
            absolutize(&mut user.client_certificate, dir);
            absolutize(&mut user.client_key, dir);
            if let Some(provider) = &mut user.auth_provider
                && let Some(ca) = provider.config.get_mut("idp-certificate-authority")
            {
                *ca = join_relative(ca, dir);
            }
            // Bare command names are looked up on PATH; only relative paths
            // such as `./bin/helper` are anchored to the file.
            if let Some(command) = user.exec.as_mut().and_then(|exec| exec.command.as_mut())
                && command.contains(std::path::is_separator)
            {
                *command = join_relative(command, dir);
            }
        }
    }
}

/// `$HOME/.kube/config`.
pub fn default_path() -> Result<PathBuf> {
    let dirs = BaseDirs::new().ok_or(Error::MissingHomeDir)?;
    Ok(dirs.home_dir().join(".kube").join("config"))
}

fn absolutize(value: &mut Option<String>, dir: &Path) {
    if let Some(path) = value {
        *path = join_relative(path, dir);
    }
}

fn join_relative(path: &str, dir: &Path) -> String {
    if path.is_empty() || Path::new(path).is_absolute() {
        return path.to_string();
    }
    dir.join(path).to_string_lossy().into_owned()
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
