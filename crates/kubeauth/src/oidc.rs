//! OpenID Connect ID tokens, refreshed with the stored refresh token once
//! they expire.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeDelta, Utc};
use kubeauth_config::OidcConfig;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::tls::{TransportBuilder, load_authorities};
use crate::token::{TokenCache, TokenState};

const DISCOVERY_PATH: &str = ".well-known/openid-configuration";

/// Where an [`OidcProvider`] stands with its ID token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidcState {
    HaveValidToken,
    Expired,
    /// The last refresh attempt failed; the next request tries again.
    RefreshFailed,
}

/// The `exp` claim of a JWT, without verifying its signature.
///
/// Returns `None` when the token does not have three segments, the payload
/// is not base64url JSON, or there is no numeric `exp`.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    let seconds = exp
        .as_i64()
        .or_else(|| exp.as_f64().map(|seconds| seconds as i64))?;
    DateTime::from_timestamp(seconds, 0)
}

/// State of a token read from the configuration. Tokens without a readable
/// expiry count as expired.
pub fn initial_state(id_token: Option<&str>, now: DateTime<Utc>) -> OidcState {
    match id_token.and_then(token_expiry) {
        Some(expires_at) if expires_at > now => OidcState::HaveValidToken,
        _ => OidcState::Expired,
    }
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

pub struct OidcProvider {
    config: OidcConfig,
    refresh_token: Mutex<Option<String>>,
    token_endpoint: Mutex<Option<String>>,
    state: Mutex<OidcState>,
    cache: TokenCache,
    http: reqwest::Client,
}

impl OidcProvider {
    pub fn new(config: OidcConfig, timeout: Option<Duration>) -> Result<Self> {
        let mut transport = TransportBuilder::new();
        if let Some(authority) = &config.idp_certificate_authority {
            for certificate in load_authorities(authority)? {
                transport = transport.add_authority(certificate);
            }
        }
        if let Some(timeout) = timeout {
            transport = transport.timeout(timeout);
        }

        let id_token = config.id_token.clone().filter(|token| !token.is_empty());
        let state = initial_state(id_token.as_deref(), Utc::now());
        let cache = match &id_token {
            Some(token) => {
                // An unreadable expiry seeds an already expired entry.
                let expires_at = token_expiry(token).unwrap_or(DateTime::<Utc>::MIN_UTC);
                TokenCache::seeded(TokenState::new(Credential::bearer(token), Some(expires_at)))
            }
            None => TokenCache::empty(),
        };

        Ok(Self {
            refresh_token: Mutex::new(config.refresh_token.clone()),
            token_endpoint: Mutex::new(None),
            state: Mutex::new(state),
            cache,
            http: transport.build()?,
            config,
        })
    }

    pub fn state(&self) -> OidcState {
        *self.state.lock()
    }

    /// The current ID token, valid or not.
    pub fn id_token(&self) -> Option<String> {
        self.cache.snapshot().and_then(|state| {
            state
                .credential
                .authorization()
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::to_string)
        })
    }

    /// The refresh token, updated when the identity provider rotates it.
    pub fn refresh_token(&self) -> Option<String> {
        self.refresh_token.lock().clone()
    }

    pub(crate) fn token_state(&self) -> Option<TokenState> {
        self.cache.snapshot()
    }

    pub(crate) fn invalidate(&self) {
        self.cache.invalidate();
        *self.state.lock() = OidcState::Expired;
    }

    pub async fn resolve(&self) -> Result<Credential> {
        let result = self.cache.get_or_refresh(|| self.refresh()).await;
        *self.state.lock() = match &result {
            Ok(_) => OidcState::HaveValidToken,
            Err(err) => {
                warn!(error = %err, "OIDC token refresh failed");
                OidcState::RefreshFailed
            }
        };
        result
    }

    async fn refresh(&self) -> Result<TokenState> {
        *self.state.lock() = OidcState::Expired;

        let Some(refresh_token) = self.refresh_token().filter(|token| !token.is_empty()) else {
            return Err(Error::refresh("refresh token is not set"));
        };
        let Some(issuer) = self.config.issuer_url.as_deref() else {
            return Err(Error::refresh("idp-issuer-url is not set"));
        };

        info!(issuer, client_id = %self.config.client_id, "refreshing OIDC ID token");
        let endpoint = self.token_endpoint(issuer).await?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = self.config.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|err| Error::refresh(format!("token request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::refresh(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| Error::refresh(format!("invalid token response: {err}")))?;

        let Some(id_token) = tokens.id_token.filter(|token| !token.is_empty()) else {
            return Err(Error::refresh("token response has no id_token"));
        };
        if let Some(rotated) = tokens.refresh_token.filter(|token| !token.is_empty()) {
            *self.refresh_token.lock() = Some(rotated);
        }

        let expires_at = token_expiry(&id_token).or_else(|| {
            tokens
                .expires_in
                .and_then(TimeDelta::try_seconds)
                .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
        });
        info!(expires_at = ?expires_at, "OIDC ID token refreshed");
        Ok(TokenState::new(Credential::bearer(id_token), expires_at))
    }

    async fn token_endpoint(&self, issuer: &str) -> Result<String> {
        if let Some(endpoint) = self.token_endpoint.lock().clone() {
            return Ok(endpoint);
        }

        let url = format!("{}/{DISCOVERY_PATH}", issuer.trim_end_matches('/'));
        let document: DiscoveryDocument = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| Error::refresh(format!("discovery request to {url} failed: {err}")))?
            .json()
            .await
            .map_err(|err| Error::refresh(format!("invalid discovery document at {url}: {err}")))?;

        *self.token_endpoint.lock() = Some(document.token_endpoint.clone());
        Ok(document.token_endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    fn config(id_token: Option<String>, refresh_token: Option<&str>) -> OidcConfig {
        OidcConfig {
            client_id: "kubectl".into(),
            client_secret: None,
            // Nothing listens here; any network attempt fails the test.
            issuer_url: Some("http://127.0.0.1:9".into()),
            id_token,
            refresh_token: refresh_token.map(str::to_string),
            idp_certificate_authority: None,
        }
    }

    #[test]
    fn reads_exp_claim() {
        let token = jwt(serde_json::json!({ "sub": "alice", "exp": 1_900_000_000 }));
        assert_eq!(token_expiry(&token).map(|at| at.timestamp()), Some(1_900_000_000));

        let float = jwt(serde_json::json!({ "exp": 1_900_000_000.5 }));
        assert_eq!(token_expiry(&float).map(|at| at.timestamp()), Some(1_900_000_000));
    }

    #[test]
    fn unreadable_tokens_have_no_expiry() {
        assert_eq!(token_expiry("opaque-token"), None);
        assert_eq!(token_expiry("a.b.c.d"), None);
        assert_eq!(token_expiry("a.%%%.c"), None);
        assert_eq!(token_expiry(&jwt(serde_json::json!({ "sub": "alice" }))), None);
        assert_eq!(token_expiry(&jwt(serde_json::json!({ "exp": "soon" }))), None);
    }

    #[test]
    fn initial_state_follows_exp() {
        let now = Utc::now();
        let future = jwt(serde_json::json!({ "exp": (now + TimeDelta::hours(1)).timestamp() }));
        let past = jwt(serde_json::json!({ "exp": (now - TimeDelta::hours(1)).timestamp() }));

        assert_eq!(initial_state(Some(&future), now), OidcState::HaveValidToken);
        assert_eq!(initial_state(Some(&past), now), OidcState::Expired);
        assert_eq!(initial_state(Some("opaque"), now), OidcState::Expired);
        assert_eq!(initial_state(None, now), OidcState::Expired);
    }

    #[tokio::test]
    async fn valid_token_is_used_without_network() {
        let token = jwt(serde_json::json!({
            "exp": (Utc::now() + TimeDelta::hours(1)).timestamp()
        }));
        let provider = OidcProvider::new(config(Some(token.clone()), Some("r")), None)
            .expect("provider");
        assert_eq!(provider.state(), OidcState::HaveValidToken);

        let credential = provider.resolve().await.expect("resolve");
        assert_eq!(credential, Credential::bearer(&token));
        assert_eq!(provider.id_token(), Some(token));
        assert_eq!(provider.state(), OidcState::HaveValidToken);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_with_prefix() {
        let expired = jwt(serde_json::json!({
            "exp": (Utc::now() - TimeDelta::minutes(5)).timestamp()
        }));
        for refresh_token in [None, Some("")] {
            let provider = OidcProvider::new(config(Some(expired.clone()), refresh_token), None)
                .expect("provider");
            assert_eq!(provider.state(), OidcState::Expired);

            let err = provider.resolve().await.unwrap_err();
            assert!(matches!(err, Error::CredentialRefresh(_)));
            assert!(
                err.to_string()
                    .starts_with(crate::error::OIDC_REFRESH_ERROR_PREFIX),
                "{err}"
            );
            assert_eq!(provider.state(), OidcState::RefreshFailed);
            // The expired token is kept for the next attempt.
            assert_eq!(provider.id_token(), Some(expired.clone()));
        }
    }

    #[tokio::test]
    async fn missing_issuer_fails_with_prefix() {
        let mut config = config(None, Some("refresh"));
        config.issuer_url = None;
        let provider = OidcProvider::new(config, None).expect("provider");

        let err = provider.resolve().await.unwrap_err();
        assert!(err.to_string().contains("idp-issuer-url"), "{err}");
    }

    #[tokio::test]
    async fn unreachable_issuer_fails_with_prefix() {
        let provider = OidcProvider::new(config(None, Some("refresh")), None).expect("provider");
        let err = provider.resolve().await.unwrap_err();
        assert!(matches!(err, Error::CredentialRefresh(_)), "{err}");
        assert_eq!(provider.state(), OidcState::RefreshFailed);
    }
}
