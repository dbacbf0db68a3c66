//! Error types for the document generation worker.

use std::path::PathBuf;

/// Errors raised while turning a queue message into stored documents.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The queue message is missing attributes or carries malformed ones.
    #[error("invalid queue message: {0}")]
    Validation(String),

    /// Template substitution or barcode generation failed.
    #[error("template error: {0}")]
    Template(String),

    /// The external format converter failed.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Document registration failed after the retry policy gave up.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    /// A blob store download or upload failed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// A lock store, queue or other shared client failed.
    #[error("infrastructure error: {message}")]
    Infrastructure {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Local scratch file handling failed.
    #[error("io error at {}: {source}", path.display())]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// One or more documents of a pipeline run did not complete.
    #[error("{failed} of {total} document(s) failed")]
    RequestsFailed {
        /// Number of failed requests.
        failed: usize,
        /// Number of requests in the run.
        total: usize,
    },
}

impl WorkerError {
    /// Wraps an infrastructure failure with a description.
    pub fn infrastructure(message: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Infrastructure {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Builds an io error bound to the path that caused it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures of the document registration call.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    /// No token was available, or the service answered 401.
    #[error("document registration unauthenticated")]
    Unauthenticated,

    /// The service answered with an unexpected status.
    #[error("document registration failed with status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The request never produced a response.
    #[error("document registration request failed: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("malformed registration response: {0}")]
    MalformedResponse(String),

    /// Refreshing the client credentials token failed.
    #[error("credential refresh failed: {0}")]
    Credentials(String),

    /// The service accepted the document but returned no id.
    #[error("id was not generated for document {destination}")]
    MissingDocumentId {
        /// Storage destination sent as file metadata.
        destination: String,
    },

    /// Registration was requested but no registry endpoint is configured.
    #[error("document registration is not configured")]
    NotConfigured,
}

impl RegistrationError {
    /// Returns true for failures reported as HTTP 401 or a missing token.
    #[must_use]
    pub const fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated | Self::Status { status: 401, .. }
        )
    }
}
