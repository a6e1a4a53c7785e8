//! TLS trust settings and client identities for the API server connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kubeauth_config::{Configuration, DataSource};
use openssl::nid::Nid;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::X509;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("kubeauth/", env!("CARGO_PKG_VERSION"));

/// A validated client certificate chain and its private key.
///
/// Loading checks that the PEM parses, that the key belongs to the leaf
/// certificate, and keeps every certificate of the chain so the server
/// receives intermediates along with the leaf.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    chain_pem: Vec<u8>,
    key_pem: Vec<u8>,
    chain_len: usize,
    fingerprint: [u8; 32],
    subject: String,
}

impl ClientIdentity {
    pub fn from_pem(certificate: &[u8], key: &[u8]) -> Result<Self> {
        let chain = X509::stack_from_pem(certificate)
            .map_err(|err| Error::credential(format!("invalid client certificate: {err}")))?;
        let leaf = chain
            .first()
            .ok_or_else(|| Error::credential("client certificate contains no PEM certificate"))?;
        let key = PKey::private_key_from_pem(key)
            .map_err(|err| Error::credential(format!("invalid client key: {err}")))?;
        let key: &PKeyRef<Private> = &key;

        let public = leaf
            .public_key()
            .map_err(|err| Error::credential(format!("unreadable certificate public key: {err}")))?;
        if !public.public_eq(key) {
            return Err(Error::credential(
                "client key does not match client certificate",
            ));
        }

        let mut chain_pem = Vec::new();
        for cert in &chain {
            let pem = cert
                .to_pem()
                .map_err(|err| Error::credential(format!("failed to encode certificate: {err}")))?;
            chain_pem.extend_from_slice(&pem);
        }
        // Normalized to PKCS#8 so RSA, EC and PKCS#8 inputs all load the same way.
        let key_pem = key
            .private_key_to_pem_pkcs8()
            .map_err(|err| Error::credential(format!("failed to encode client key: {err}")))?;
        let leaf_der = leaf
            .to_der()
            .map_err(|err| Error::credential(format!("failed to encode certificate: {err}")))?;

        let subject = leaf
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().to_string().ok())
            .unwrap_or_default();

        Ok(Self {
            chain_pem,
            key_pem,
            chain_len: chain.len(),
            fingerprint: Sha256::digest(&leaf_der).into(),
            subject,
        })
    }

    pub fn from_sources(certificate: &DataSource, key: &DataSource) -> Result<Self> {
        let certificate_pem = certificate.load().map_err(|err| {
            Error::credential(format!(
                "failed to read client certificate {}: {err}",
                certificate.describe()
            ))
        })?;
        let key_pem = key.load().map_err(|err| {
            Error::credential(format!(
                "failed to read client key {}: {err}",
                key.describe()
            ))
        })?;
        Self::from_pem(&certificate_pem, &key_pem)
    }

    /// Number of certificates presented, leaf included.
    pub fn chain_len(&self) -> usize {
        self.chain_len
    }

    /// Common name of the leaf certificate.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// SHA-256 of the leaf certificate, lowercase hex.
    pub fn fingerprint(&self) -> String {
        self.fingerprint
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    fn to_reqwest(&self) -> Result<reqwest::Identity> {
        let mut pem = self.chain_pem.clone();
        pem.extend_from_slice(&self.key_pem);
        reqwest::Identity::from_pem(&pem)
            .map_err(|err| Error::credential(format!("unusable client identity: {err}")))
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("subject", &self.subject)
            .field("chain_len", &self.chain_len)
            .finish_non_exhaustive()
    }
}

/// Parse a PEM bundle of trusted authorities.
pub fn load_authorities(source: &DataSource) -> Result<Vec<reqwest::Certificate>> {
    let pem = source.load().map_err(|err| {
        Error::credential(format!(
            "failed to read certificate authority {}: {err}",
            source.describe()
        ))
    })?;
    let certs = X509::stack_from_pem(&pem)
        .map_err(|err| Error::credential(format!("invalid certificate authority: {err}")))?;
    if certs.is_empty() {
        return Err(Error::credential(format!(
            "certificate authority {} contains no PEM certificate",
            source.describe()
        )));
    }

    certs
        .iter()
        .map(|cert| {
            let der = cert
                .to_der()
                .map_err(|err| Error::credential(format!("failed to encode authority: {err}")))?;
            reqwest::Certificate::from_der(&der)
                .map_err(|err| Error::credential(format!("unusable certificate authority: {err}")))
        })
        .collect()
}

/// Builds the HTTP client for one [`Configuration`]: trust roots, the
/// skip-verification flag, the client identity, timeout and proxy.
#[derive(Clone, Default)]
pub struct TransportBuilder {
    authorities: Vec<reqwest::Certificate>,
    insecure: bool,
    identity: Option<Arc<ClientIdentity>>,
    timeout: Option<Duration>,
    proxy: Option<Url>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let tls = config.tls();
        let authorities = match &tls.certificate_authority {
            Some(source) => load_authorities(source)?,
            None => Vec::new(),
        };

        let builder = Self {
            authorities,
            insecure: false,
            identity: None,
            timeout: config.timeout(),
            proxy: config.proxy_url().cloned(),
        };
        Ok(builder.insecure_skip_tls_verify(tls.insecure_skip_tls_verify))
    }

    pub fn add_authority(mut self, authority: reqwest::Certificate) -> Self {
        self.authorities.push(authority);
        self
    }

    pub fn insecure_skip_tls_verify(mut self, insecure: bool) -> Self {
        if insecure {
            warn!(
                "`insecure-skip-tls-verify` is set: server certificate verification is DISABLED, \
                 this may lead to security vulnerabilities"
            );
        }
        self.insecure = insecure;
        self
    }

    pub fn identity(mut self, identity: Arc<ClientIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);

        // A configured authority replaces the platform store rather than extending it.
        if self.authorities.is_empty() {
            debug!("using the platform trust store");
        } else {
            builder = builder.tls_certs_only(self.authorities.iter().cloned());
        }
        if self.insecure {
            builder = builder.tls_danger_accept_invalid_certs(true);
        }
        if let Some(identity) = &self.identity {
            debug!(
                subject = identity.subject(),
                chain_len = identity.chain_len(),
                "presenting client certificate"
            );
            builder = builder.identity(identity.to_reqwest()?);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }

        Ok(builder.build()?)
    }
}

/// The connection layer shared by every request of one client.
///
/// The base client is built once. Identities that only appear at request
/// time (certificates returned by an exec plugin) get their own client,
/// cached until the plugin hands out a different certificate.
pub struct Transport {
    builder: TransportBuilder,
    client: reqwest::Client,
    rotated: Mutex<Option<(Arc<ClientIdentity>, reqwest::Client)>>,
}

impl Transport {
    pub fn new(builder: TransportBuilder) -> Result<Self> {
        let client = builder.build()?;
        Ok(Self {
            builder,
            client,
            rotated: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// A client presenting `identity` during the handshake.
    pub fn client_for(&self, identity: &Arc<ClientIdentity>) -> Result<reqwest::Client> {
        if self.builder.identity.as_ref() == Some(identity) {
            return Ok(self.client.clone());
        }

        let mut rotated = self.rotated.lock();
        if let Some((current, client)) = rotated.as_ref()
            && current == identity
        {
            return Ok(client.clone());
        }

        let client = self.builder.clone().identity(Arc::clone(identity)).build()?;
        info!(
            subject = identity.subject(),
            fingerprint = %identity.fingerprint(),
            "client certificate rotated, opening a new connection pool"
        );
        *rotated = Some((Arc::clone(identity), client.clone()));
        Ok(client)
    }
}
