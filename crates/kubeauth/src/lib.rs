//! # kubeauth
//!
//! Authenticated HTTP access to a cluster API server. A [`Configuration`]
//! picks one credential mechanism; this crate turns it into a
//! [`CredentialProvider`], a TLS [`Transport`] and a [`Client`] that
//! applies both to every request.
//!
//! ```ignore
//! let client = kubeauth::Client::infer()?;
//! let pods = client
//!     .get(&format!("/api/v1/namespaces/{}/pods", client.namespace()))
//!     .await?;
//! ```

mod authenticator;
mod client;
pub mod credential;
pub mod error;
pub mod exec;
pub mod oidc;
pub mod tls;
mod token;

pub use authenticator::RequestAuthenticator;
pub use client::Client;
pub use credential::{Credential, CredentialProvider, ExecProvider};
pub use error::{Error, ExecPluginError, OIDC_REFRESH_ERROR_PREFIX, Result, check_response};
pub use exec::{ExecInvocation, ExecInvoker, ExecPluginRunner, ProcessInvoker};
pub use kubeauth_config::{
    AuthConfig, ConfigResolver, Configuration, ConfigurationBuilder, DataSource, ExecConfig,
    Kubeconfig, OidcConfig, TlsConfig, TokenSource,
};
pub use oidc::{OidcProvider, OidcState};
pub use tls::{ClientIdentity, Transport, TransportBuilder};
pub use token::TokenState;
