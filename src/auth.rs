//! Service tokens for the document registration endpoint.

use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::RegistrationError;

/// An opaque bearer token and the algorithm it was signed with, when readable.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    value: String,
    algorithm: Option<String>,
}

impl AuthToken {
    /// Wraps a bearer token, reading `alg` from its JWT header if it has one.
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let algorithm = jwt_algorithm(&value);
        Self { value, algorithm }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn algorithm(&self) -> Option<&str> {
        self.algorithm.as_deref()
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn jwt_algorithm(token: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Header {
        alg: Option<String>,
    }

    let header = token.split('.').next()?;
    let bytes = URL_SAFE_NO_PAD.decode(header.trim_end_matches('=')).ok()?;
    serde_json::from_slice::<Header>(&bytes).ok()?.alg
}

/// Obtains a fresh service token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self) -> Result<AuthToken, RegistrationError>;
}

/// OAuth client-credentials flow against the auth service.
pub struct ClientCredentialsRefresher {
    http: reqwest::Client,
    url: String,
    application_id: String,
    application_secret: String,
}

impl ClientCredentialsRefresher {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        application_id: impl Into<String>,
        application_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            url: url.into().trim_end_matches('/').to_string(),
            application_id: application_id.into(),
            application_secret: application_secret.into(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[async_trait]
impl CredentialRefresher for ClientCredentialsRefresher {
    async fn refresh(&self) -> Result<AuthToken, RegistrationError> {
        debug!(url = %self.url, "Refreshing client credentials token");
        let response = self
            .http
            .post(format!("{}/oauth/token", self.url))
            .query(&[
                ("application_id", self.application_id.as_str()),
                ("application_secret", self.application_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| RegistrationError::Credentials(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(RegistrationError::Credentials(format!(
                "token endpoint answered with status code: {}",
                status.as_u16()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::Credentials(e.to_string()))?;
        let token = body.token.ok_or_else(|| {
            RegistrationError::Credentials("token endpoint returned a null token".to_string())
        })?;

        info!("Client credentials token refreshed");
        Ok(AuthToken::new(token))
    }
}
