//! Request authentication for the control endpoint
//!
//! Basic credentials are sent on every request. OAuth2 uses the client
//! credentials grant; the token is cached and refreshed shortly before it
//! expires.

use crate::config::HttpOutputConfig;
use crate::sync::error::SyncError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Tokens are refreshed this long before the server says they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

pub enum Credentials {
    None,
    Basic { username: String, password: String },
    OAuth2(OAuth2TokenSource),
}

impl Credentials {
    pub fn from_config(config: &HttpOutputConfig) -> Self {
        if config.oauth2_enabled() {
            return Credentials::OAuth2(OAuth2TokenSource {
                client_id: config.client_id.clone().unwrap_or_default(),
                client_secret: config.client_secret.clone().unwrap_or_default(),
                token_url: config.token_url.clone().unwrap_or_default(),
                scopes: config.scopes.clone(),
                cached: Mutex::new(None),
            });
        }

        if config.username.is_some() || config.password.is_some() {
            return Credentials::Basic {
                username: config.username.clone().unwrap_or_default(),
                password: config.password.clone().unwrap_or_default(),
            };
        }

        Credentials::None
    }

    /// Set the authorization header on `request`, replacing any
    /// `Authorization` header added before
    pub async fn authorize(
        &self,
        client: &Client,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, SyncError> {
        let value = match self {
            Credentials::None => return Ok(request),
            Credentials::Basic { username, password } => {
                use base64::prelude::*;
                let credentials = BASE64_STANDARD.encode(format!("{}:{}", username, password));
                format!("Basic {}", credentials)
            }
            Credentials::OAuth2(source) => format!("Bearer {}", source.token(client).await?),
        };
        with_authorization(request, &value)
    }
}

fn with_authorization(request: RequestBuilder, value: &str) -> Result<RequestBuilder, SyncError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| SyncError::Token(format!("invalid authorization header: {}", e)))?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    // `headers` replaces existing values where `header` would append
    Ok(request.headers(headers))
}

struct CachedToken {
    access_token: String,
    refresh_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        self.refresh_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client credentials token source
pub struct OAuth2TokenSource {
    client_id: String,
    client_secret: String,
    token_url: String,
    scopes: Vec<String>,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuth2TokenSource {
    async fn token(&self, client: &Client) -> Result<String, SyncError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        debug!("Requesting OAuth2 token from {}", self.token_url);
        let mut form = vec![("grant_type", "client_credentials".to_string())];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }

        let response = client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Token(format!(
                "{} returned status {}",
                self.token_url,
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::Token(format!("invalid token response: {}", e)))?;

        let refresh_at = body
            .expires_in
            .map(|secs| Instant::now() + Duration::from_secs(secs).saturating_sub(EXPIRY_MARGIN));
        let access_token = body.access_token.clone();
        *cached = Some(CachedToken {
            access_token: body.access_token,
            refresh_at,
        });
        Ok(access_token)
    }
}
