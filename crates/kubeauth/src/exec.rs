//! External credential plugins: run a command, read one `ExecCredential`
//! JSON object from its stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kubeauth_config::ExecConfig;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ExecPluginError;

/// Environment variable describing the request to the plugin.
pub const EXEC_INFO_ENV: &str = "KUBERNETES_EXEC_INFO";

/// Applied when the configuration sets no request timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_STDOUT_BYTES: usize = 1024 * 1024;
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// One concrete plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInvocation {
    pub command: String,
    pub args: Vec<String>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
    pub install_hint: Option<String>,
}

impl ExecInvocation {
    pub fn from_config(config: &ExecConfig) -> Self {
        let mut env = config.env.clone();
        let exec_info = serde_json::json!({
            "apiVersion": config.api_version,
            "kind": "ExecCredential",
            "spec": { "interactive": false },
        });
        env.push((EXEC_INFO_ENV.to_string(), exec_info.to_string()));

        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            env,
            install_hint: config.install_hint.clone(),
        }
    }
}

/// Runs an invocation and returns its stdout.
///
/// [`ProcessInvoker`] spawns real processes; tests substitute their own
/// implementation.
#[async_trait]
pub trait ExecInvoker: Send + Sync {
    async fn invoke(&self, invocation: &ExecInvocation) -> Result<Vec<u8>, ExecPluginError>;
}

/// Spawns the plugin as a child process with a deadline and bounded output.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    timeout: Duration,
    max_output: usize,
}

impl ProcessInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_output: MAX_STDOUT_BYTES,
        }
    }

    pub fn max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_EXEC_TIMEOUT)
    }
}

#[async_trait]
impl ExecInvoker for ProcessInvoker {
    async fn invoke(&self, invocation: &ExecInvocation) -> Result<Vec<u8>, ExecPluginError> {
        let name = invocation.command.clone();
        let mut child = Command::new(&invocation.command)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecPluginError::Spawn {
                command: name.clone(),
                hint: install_hint(invocation, &source),
                source,
            })?;

        let io_error = |source| ExecPluginError::Io {
            command: name.clone(),
            source,
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stdout was not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stderr was not captured")))?;

        let run = async {
            tokio::try_join!(
                read_bounded(stdout, self.max_output),
                read_bounded(stderr, MAX_STDERR_BYTES),
                child.wait(),
            )
        };
        let outcome = tokio::time::timeout(self.timeout, run).await;
        let ((stdout, stdout_truncated), (stderr, _), status) = match outcome {
            Ok(result) => result.map_err(io_error)?,
            Err(_) => {
                let _ = child.start_kill();
                return Err(ExecPluginError::Timeout {
                    command: name,
                    timeout: self.timeout,
                });
            }
        };

        if !status.success() {
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "unknown".into());
            return Err(ExecPluginError::Exit {
                command: name,
                code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        if stdout_truncated {
            return Err(ExecPluginError::OutputTooLarge {
                command: name,
                limit: self.max_output,
            });
        }
        Ok(stdout)
    }
}

fn install_hint(invocation: &ExecInvocation, err: &std::io::Error) -> String {
    match &invocation.install_hint {
        Some(hint) if err.kind() == std::io::ErrorKind::NotFound => format!("\n\n{hint}"),
        _ => String::new(),
    }
}

/// Read to EOF, keeping at most `limit` bytes. Draining the rest keeps the
/// child from blocking on a full pipe.
async fn read_bounded<R>(mut reader: R, limit: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(buf.len());
        if n > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..n.min(room)]);
    }
    Ok((buf, truncated))
}

/// Credential material returned by a plugin.
#[derive(Clone, PartialEq, Eq)]
pub enum ExecMaterial {
    Token(String),
    Certificate {
        certificate_pem: String,
        key_pem: String,
    },
}

impl ExecMaterial {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecMaterial::Token(_) => "token",
            ExecMaterial::Certificate { .. } => "client_certificate",
        }
    }
}

impl std::fmt::Debug for ExecMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExecMaterial::{}(<redacted>)", self.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCredential {
    pub material: ExecMaterial,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialResponse {
    api_version: Option<String>,
    kind: Option<String>,
    status: Option<ExecCredentialStatus>,
    // Older plugins put the expiry next to `status`.
    expiration_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    expiration_timestamp: Option<DateTime<Utc>>,
}

/// Parse plugin stdout into an [`ExecCredential`].
pub fn parse_exec_credential(
    stdout: &[u8],
    expected_api_version: &str,
) -> Result<ExecCredential, ExecPluginError> {
    let response: ExecCredentialResponse = serde_json::from_slice(stdout)
        .map_err(|err| ExecPluginError::InvalidOutput(format!("not an ExecCredential: {err}")))?;

    match response.api_version.as_deref() {
        Some(version) if version == expected_api_version => {}
        Some(version) => {
            return Err(ExecPluginError::InvalidOutput(format!(
                "apiVersion {version} does not match configured {expected_api_version}"
            )));
        }
        None => {
            return Err(ExecPluginError::InvalidOutput(
                "missing apiVersion".to_string(),
            ));
        }
    }
    if let Some(kind) = response.kind.as_deref()
        && kind != "ExecCredential"
    {
        return Err(ExecPluginError::InvalidOutput(format!(
            "unexpected kind {kind}"
        )));
    }

    let status = response
        .status
        .ok_or_else(|| ExecPluginError::InvalidOutput("missing status".to_string()))?;
    let non_empty = |value: Option<String>| value.filter(|value| !value.is_empty());

    let material = match (
        non_empty(status.token),
        non_empty(status.client_certificate_data),
        non_empty(status.client_key_data),
    ) {
        (Some(token), _, _) => ExecMaterial::Token(token),
        (None, Some(certificate_pem), Some(key_pem)) => ExecMaterial::Certificate {
            certificate_pem,
            key_pem,
        },
        (None, Some(_), None) | (None, None, Some(_)) => {
            return Err(ExecPluginError::InvalidOutput(
                "clientCertificateData and clientKeyData must be set together".to_string(),
            ));
        }
        (None, None, None) => {
            return Err(ExecPluginError::InvalidOutput(
                "status has neither token nor client certificate".to_string(),
            ));
        }
    };

    Ok(ExecCredential {
        material,
        expires_at: status
            .expiration_timestamp
            .or(response.expiration_timestamp),
    })
}

/// Runs the configured plugin and parses what it prints. Caching is the
/// caller's business; every call runs the plugin.
#[derive(Clone)]
pub struct ExecPluginRunner {
    invoker: Arc<dyn ExecInvoker>,
}

impl ExecPluginRunner {
    pub fn new(invoker: Arc<dyn ExecInvoker>) -> Self {
        Self { invoker }
    }

    /// A runner that spawns real processes, killed after `timeout`.
    pub fn process(timeout: Duration) -> Self {
        Self::new(Arc::new(ProcessInvoker::new(timeout)))
    }

    pub async fn run(&self, config: &ExecConfig) -> Result<ExecCredential, ExecPluginError> {
        let invocation = ExecInvocation::from_config(config);
        info!(command = %config.command, "running exec credential plugin");

        let stdout = self.invoker.invoke(&invocation).await?;
        let credential = parse_exec_credential(&stdout, &config.api_version)?;
        debug!(
            command = %config.command,
            material = credential.material.kind(),
            expires_at = ?credential.expires_at,
            "exec credential plugin succeeded"
        );
        Ok(credential)
    }
}
