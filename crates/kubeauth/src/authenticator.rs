use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Request, Response, StatusCode};
use tracing::{debug, warn};

use kubeauth_config::Configuration;

use crate::credential::{Credential, CredentialProvider};
use crate::error::{Error, Result, check_response};
use crate::tls::{Transport, TransportBuilder};

/// Attaches the provider's credential to outgoing requests and sends them
/// over the matching transport.
///
/// Header credentials go into `Authorization`. Certificate credentials
/// select the client that presents them during the handshake. A 401 drops
/// the provider's cached credential and surfaces as
/// [`Error::Unauthorized`]; the request is not retried.
pub struct RequestAuthenticator {
    provider: CredentialProvider,
    transport: Transport,
}

impl RequestAuthenticator {
    pub fn new(provider: CredentialProvider, transport: Transport) -> Self {
        Self {
            provider,
            transport,
        }
    }

    pub fn from_configuration(config: &Configuration) -> Result<Self> {
        let provider = CredentialProvider::from_configuration(config)?;
        let mut builder = TransportBuilder::from_configuration(config)?;
        if let Some(identity) = provider.static_identity() {
            builder = builder.identity(Arc::clone(identity));
        }
        Ok(Self::new(provider, Transport::new(builder)?))
    }

    pub fn provider(&self) -> &CredentialProvider {
        &self.provider
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Resolve the credential, apply it to `request` and return the client
    /// that must send it.
    pub async fn authenticate(&self, request: &mut Request) -> Result<reqwest::Client> {
        match self.provider.resolve().await? {
            Credential::None => Ok(self.transport.client().clone()),
            Credential::Authorization(value) => {
                let mut header = HeaderValue::from_str(&value)
                    .map_err(|_| Error::credential("credential is not a valid header value"))?;
                header.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, header);
                Ok(self.transport.client().clone())
            }
            Credential::ClientCertificate(identity) => self.transport.client_for(&identity),
        }
    }

    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        let client = self.authenticate(&mut request).await?;
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, auth = self.provider.kind(), "sending request");

        let response = client.execute(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(%method, %url, auth = self.provider.kind(), "server rejected the credential");
            self.provider.invalidate();
        }
        check_response(response)
    }
}

impl std::fmt::Debug for RequestAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestAuthenticator")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}
