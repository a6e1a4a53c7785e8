//! # kubeauth-config
//!
//! Turns a kubeconfig (or explicit connection settings) into one
//! normalized, immutable [`Configuration`].
//!
//! ```ignore
//! use kubeauth_config::{ConfigResolver, Configuration, Kubeconfig};
//!
//! // current-context of $KUBECONFIG or ~/.kube/config
//! let config = Configuration::infer()?;
//!
//! // an explicit context of a specific file
//! let kubeconfig = Kubeconfig::read("/etc/kube/admin.conf")?;
//! let config = ConfigResolver::new(&kubeconfig).context("admin").resolve()?;
//!
//! // no file at all
//! let config = Configuration::builder("https://10.0.0.1:6443")
//!     .bearer_token("abc123")
//!     .build()?;
//! ```

pub mod configuration;
pub mod error;
pub mod kubeconfig;
pub mod resolver;

pub use configuration::{
    AuthConfig, Configuration, ConfigurationBuilder, DataSource, ExecConfig, OidcConfig,
    TlsConfig, TokenSource,
};
pub use error::{Error, Result};
pub use kubeconfig::{
    AuthProviderSpec, Cluster, Context, ExecEnvVar, ExecSpec, KUBECONFIG_ENV, Kubeconfig,
    NamedCluster, NamedContext, NamedUser, User,
};
pub use resolver::ConfigResolver;
