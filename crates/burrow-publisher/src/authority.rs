//! HTTP client for the external token authority
//!
//! The authority is consumed as an opaque service: it hands out a bearer
//! token at startup and signs per-session payloads on demand. Token issuance
//! itself lives elsewhere.

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Authority request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Authority returned {status} for {endpoint}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

pub struct AuthorityClient {
    base_url: String,
    secret: String,
    http: reqwest::Client,
}

impl AuthorityClient {
    pub fn new(base_url: String, secret: String) -> Result<Self, AuthorityError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
            http,
        })
    }

    /// Exchange the shared secret for a bearer token.
    ///
    /// Called once at startup; a refusal here is fatal to the publisher.
    pub async fn fetch_token(&self, identity: &str) -> Result<String, AuthorityError> {
        let response = self
            .http
            .post(format!("{}/token", self.base_url))
            .json(&json!({ "identity": identity, "secret": self.secret }))
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AuthorityError::Status {
                endpoint: "/token",
                status: response.status(),
            });
        }
        Ok(response.json::<TokenResponse>().await?.token)
    }

    /// Have the authority sign a per-session payload.
    ///
    /// A non-200 fails only the session asking for it, not the publisher.
    pub async fn sign(
        &self,
        bearer: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, AuthorityError> {
        let response = self
            .http
            .post(format!("{}/sign", self.base_url))
            .bearer_auth(bearer)
            .json(&payload)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(AuthorityError::Status {
                endpoint: "/sign",
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }
}
