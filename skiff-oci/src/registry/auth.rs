//! Bearer-token negotiation for the OCI distribution spec.
//!
//! On `401`/`403` the registry answers with a `WWW-Authenticate: Bearer`
//! challenge naming a token realm. Tokens are fetched from the realm with
//! the client's basic credentials and cached per scope until they expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Static basic-auth credentials for a registry.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    /// User name.
    pub username: String,
    /// Password or personal access token.
    pub password: String,
}

impl BasicAuth {
    /// Reads credentials from `REGISTRY_USERNAME` / `REGISTRY_TOKEN`,
    /// the convention used by the integration tests.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_TOKEN").ok()?;
        Some(Self { username, password })
    }
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Challenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses a bearer challenge header value.
///
/// Returns `None` for non-bearer schemes.
pub(crate) fn parse_challenge(header: &str) -> Option<Challenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"');
        match key.trim() {
            "realm" => realm = Some(value.to_owned()),
            "service" => service = Some(value.to_owned()),
            "scope" => scope = Some(value.to_owned()),
            _ => {}
        }
    }
    Some(Challenge {
        realm: realm?,
        service,
        scope,
    })
}

/// Wire shape of a token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    #[allow(dead_code)]
    issued_at: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    acquired: Instant,
    ttl: Duration,
}

impl CachedToken {
    /// A token is usable until shortly before its advertised expiry.
    fn is_valid(&self) -> bool {
        self.acquired.elapsed() + Duration::from_secs(5) < self.ttl
    }
}

/// Per-scope bearer token cache backed by a token realm.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    /// Returns the cached token for `scope` if it has not expired.
    pub(crate) async fn get(&self, scope: &str) -> Option<String> {
        let tokens = self.tokens.lock().await;
        tokens
            .get(scope)
            .filter(|t| t.is_valid())
            .map(|t| t.token.clone())
    }

    /// Obtains a fresh token for `scope` from the challenge's realm.
    ///
    /// Fails with [`Error::Auth`] when a still-valid cached token was
    /// already rejected by the registry — re-requesting the same token
    /// would loop.
    pub(crate) async fn refresh(
        &self,
        client: &reqwest::Client,
        basic: Option<&BasicAuth>,
        challenge: &Challenge,
        scope: &str,
    ) -> Result<String> {
        {
            let tokens = self.tokens.lock().await;
            if tokens.get(scope).is_some_and(CachedToken::is_valid) {
                return Err(Error::Auth(format!(
                    "registry rejected a fresh token for scope {scope}"
                )));
            }
        }

        let scope = challenge.scope.as_deref().unwrap_or(scope);
        let mut request = client.get(&challenge.realm).query(&[
            ("client_id", "skiff"),
            ("scope", scope),
            ("offline_token", "true"),
        ]);
        if let Some(ref service) = challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Some(basic) = basic {
            request = request.basic_auth(&basic.username, Some(&basic.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| Error::Auth("token endpoint returned no token".into()))?;

        let cached = CachedToken {
            token: token.clone(),
            acquired: Instant::now(),
            ttl: Duration::from_secs(body.expires_in.unwrap_or(60)),
        };
        self.tokens.lock().await.insert(scope.to_owned(), cached);
        Ok(token)
    }
}
