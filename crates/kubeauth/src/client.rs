use std::sync::Arc;

use kubeauth_config::Configuration;
use reqwest::{Method, RequestBuilder, Response};
use url::Url;

use crate::authenticator::RequestAuthenticator;
use crate::error::{Error, Result};

/// An authenticated handle to one cluster's API server.
///
/// Cheap to clone; clones share the credential cache and connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    configuration: Configuration,
    authenticator: RequestAuthenticator,
}

impl Client {
    pub fn new(configuration: Configuration) -> Result<Self> {
        let authenticator = RequestAuthenticator::from_configuration(&configuration)?;
        Ok(Self {
            inner: Arc::new(Inner {
                configuration,
                authenticator,
            }),
        })
    }

    /// Client for the current context of the default kubeconfig.
    pub fn infer() -> Result<Self> {
        Self::new(Configuration::infer()?)
    }

    pub fn configuration(&self) -> &Configuration {
        &self.inner.configuration
    }

    pub fn host(&self) -> &Url {
        self.inner.configuration.host()
    }

    pub fn namespace(&self) -> &str {
        self.inner.configuration.namespace()
    }

    pub fn authenticator(&self) -> &RequestAuthenticator {
        &self.inner.authenticator
    }

    /// Start a request to `path`, relative to the server URL. Any path
    /// prefix in the server URL is kept.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let base = self.host().as_str().trim_end_matches('/');
        let url = format!("{base}/{}", path.trim_start_matches('/'));
        let url = Url::parse(&url).map_err(|source| Error::InvalidRequestUrl { url, source })?;
        Ok(self
            .inner
            .authenticator
            .transport()
            .client()
            .request(method, url))
    }

    /// Authenticate and send a request started with [`request`](Self::request).
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        self.inner.authenticator.execute(request.build()?).await
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.send(self.request(Method::GET, path)?).await
    }
}

impl TryFrom<Configuration> for Client {
    type Error = Error;

    fn try_from(configuration: Configuration) -> Result<Self> {
        Self::new(configuration)
    }
}
