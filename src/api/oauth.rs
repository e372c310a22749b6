//! OAuth2 client-credentials token acquisition.

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    /// Lifetime in seconds. Absent or zero means the token does not expire.
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        match self.expires_at {
            Some(at) => now + EXPIRY_MARGIN < at,
            None => true,
        }
    }
}

/// Caches a bearer token obtained with the client-credentials grant.
pub struct TokenSource {
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            token_url,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    /// Returns a valid access token, requesting a new one when the cached
    /// token is missing or about to expire.
    pub async fn token(&self, http: &reqwest::Client) -> Result<String> {
        if let Some(token) = self.cached_token(Instant::now()) {
            return Ok(token);
        }

        let fresh = self.request(http).await?;
        let access_token = fresh.access_token.clone();
        *self.cached.lock() = Some(fresh);

        Ok(access_token)
    }

    /// Drops the cached token so the next call requests a new one.
    pub fn invalidate(&self) {
        self.cached.lock().take();
    }

    fn cached_token(&self, now: Instant) -> Option<String> {
        self.cached
            .lock()
            .as_ref()
            .filter(|t| t.is_fresh(now))
            .map(|t| t.access_token.clone())
    }

    async fn request(&self, http: &reqwest::Client) -> Result<CachedToken> {
        debug!(url = %self.token_url, "requesting oauth token");

        let requested_at = Instant::now();
        let response = http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .context("requesting oauth token")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {} from token endpoint: {}", status, body);
        }

        let resp: TokenResponse = response
            .json()
            .await
            .context("decoding oauth token response")?;

        if resp.access_token.is_empty() {
            bail!("token endpoint returned an empty access token");
        }

        if !resp.token_type.is_empty() && !resp.token_type.eq_ignore_ascii_case("bearer") {
            bail!("unsupported token type {:?}", resp.token_type);
        }

        Ok(CachedToken {
            access_token: resp.access_token,
            expires_at: (resp.expires_in > 0)
                .then(|| requested_at + Duration::from_secs(resp.expires_in)),
        })
    }
}
