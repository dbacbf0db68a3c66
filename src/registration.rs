//! Registration of converted documents with the document management service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::AuthToken;
use crate::error::RegistrationError;

/// Body of a registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrationRequest {
    /// Storage destination of the converted file.
    pub file_metadata: String,
    #[serde(rename = "send_SNS")]
    pub send_notification: bool,
    pub template: TemplateReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tax_document_type_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_source_id: Option<Uuid>,
    /// The caller's original content tree.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateReference {
    pub template: String,
}

/// A single registration attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    /// Registers a document, returning the id the service assigned, if any.
    async fn register(
        &self,
        request: &RegistrationRequest,
        token: &AuthToken,
    ) -> Result<Option<String>, RegistrationError>;
}

/// [`DocumentRegistry`] speaking HTTP to `{base_url}/docs`.
pub struct HttpDocumentRegistry {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDocumentRegistry {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RegistrationResponse {
    document_id: Option<String>,
}

#[async_trait]
impl DocumentRegistry for HttpDocumentRegistry {
    async fn register(
        &self,
        request: &RegistrationRequest,
        token: &AuthToken,
    ) -> Result<Option<String>, RegistrationError> {
        let response = self
            .http
            .post(format!("{}/docs", self.base_url))
            .bearer_auth(token.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        let status = response.status();
        debug!(status = status.as_u16(), file = %request.file_metadata, "Registration response");
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(RegistrationError::Unauthenticated);
        }
        if status != reqwest::StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistrationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| RegistrationError::MalformedResponse(e.to_string()))?;
        Ok(body.document_id)
    }
}
