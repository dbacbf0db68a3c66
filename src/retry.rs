//! Retry policy for document registration, including mid-retry token refresh.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::auth::{AuthToken, CredentialRefresher};
use crate::error::RegistrationError;
use crate::registration::{DocumentRegistry, RegistrationRequest};

/// Exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first.
    pub max_tries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_tries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Decides whether a failure means the caller is not authenticated.
pub trait AuthErrorClassifier: Send + Sync {
    fn is_unauthenticated(&self, error: &RegistrationError) -> bool;
}

/// Treats a missing token and HTTP 401 as unauthenticated.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusClassifier;

impl AuthErrorClassifier for StatusClassifier {
    fn is_unauthenticated(&self, error: &RegistrationError) -> bool {
        error.is_unauthenticated()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Retry,
    GiveUp,
}

/// Registers documents through a [`DocumentRegistry`], retrying with backoff.
///
/// Unauthenticated failures give up at once unless a refresher is configured, in
/// which case the token is refreshed and cached for the next attempt. Any other
/// failure is retried until `max_tries` is exhausted.
pub struct RetryingRegistrar {
    registry: Arc<dyn DocumentRegistry>,
    refresher: Option<Arc<dyn CredentialRefresher>>,
    classifier: Box<dyn AuthErrorClassifier>,
    backoff: Backoff,
    cached_token: RwLock<Option<AuthToken>>,
}

impl RetryingRegistrar {
    pub fn new(
        registry: Arc<dyn DocumentRegistry>,
        refresher: Option<Arc<dyn CredentialRefresher>>,
    ) -> Self {
        Self {
            registry,
            refresher,
            classifier: Box::new(StatusClassifier),
            backoff: Backoff::default(),
            cached_token: RwLock::new(None),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_classifier(mut self, classifier: Box<dyn AuthErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Registers `request`, preferring `caller_token` until a refresh replaces it.
    ///
    /// A registration that succeeds without a document id is reported as
    /// [`RegistrationError::MissingDocumentId`] and is not retried.
    pub async fn register(
        &self,
        request: &RegistrationRequest,
        caller_token: Option<&str>,
    ) -> Result<String, RegistrationError> {
        let caller_token = caller_token.map(AuthToken::new);
        let mut refreshed = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let token = self.token_for_attempt(caller_token.as_ref(), refreshed).await;
            let outcome = match token {
                Some(token) => self.registry.register(request, &token).await,
                None => Err(RegistrationError::Unauthenticated),
            };

            let error = match outcome {
                Ok(Some(id)) => {
                    info!(attempt, document_id = %id, file = %request.file_metadata, "Document registered");
                    return Ok(id);
                }
                Ok(None) => {
                    return Err(RegistrationError::MissingDocumentId {
                        destination: request.file_metadata.clone(),
                    })
                }
                Err(error) => error,
            };

            let (decision, did_refresh) = self.on_failure(&error).await;
            refreshed |= did_refresh;

            if decision == Decision::GiveUp {
                error!(attempt, error = %error, "Giving up on document registration");
                return Err(error);
            }
            if attempt >= self.backoff.max_tries {
                error!(attempt, error = %error, "Document registration retries exhausted");
                return Err(error);
            }

            let delay = self.backoff.delay_after(attempt);
            warn!(
                attempt,
                max_tries = self.backoff.max_tries,
                error = %error,
                "Document registration failed, retrying in {:?}",
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn token_for_attempt(
        &self,
        caller_token: Option<&AuthToken>,
        refreshed: bool,
    ) -> Option<AuthToken> {
        let cached = self.cached_token.read().await.clone();
        if refreshed {
            cached.or_else(|| caller_token.cloned())
        } else {
            caller_token.cloned().or(cached)
        }
    }

    /// Returns the retry decision and whether a refresh was attempted.
    async fn on_failure(&self, error: &RegistrationError) -> (Decision, bool) {
        if !self.classifier.is_unauthenticated(error) {
            return (Decision::Retry, false);
        }
        let Some(refresher) = &self.refresher else {
            return (Decision::GiveUp, false);
        };

        let refreshed = match refresher.refresh().await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                None
            }
        };
        *self.cached_token.write().await = refreshed;
        (Decision::Retry, true)
    }
}
