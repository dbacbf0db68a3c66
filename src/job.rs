//! Conversion requests, results and per-run options.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Format tag attached to every converted document.
pub const OUTPUT_FORMAT: &str = "pdf";

/// One document to render from a shared template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    /// Normalized file name, without extension.
    pub name: String,
    pub related_source_id: Option<Uuid>,
    /// Variable scope used to fill the template.
    pub content: serde_json::Value,
}

impl ConversionRequest {
    /// Creates a request, generating a unique name when none is given.
    pub fn new(
        name: Option<&str>,
        related_source_id: Option<Uuid>,
        content: serde_json::Value,
    ) -> Self {
        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => normalize_name(name),
            None => generate_name(),
        };
        Self {
            name,
            related_source_id,
            content,
        }
    }
}

/// Outcome of rendering one [`ConversionRequest`].
///
/// A result is produced for every request, including failed ones; failed results
/// carry whatever fields were filled before the failure plus the failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    /// Registered document id, or the file name when nothing was registered.
    pub id: String,
    pub name: String,
    #[serde(rename = "pdf_to_base64")]
    pub encoded_content: String,
    #[serde(rename = "S3Destination")]
    pub storage_destination: String,
    #[serde(rename = "file_type")]
    pub format: String,
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ConversionResult {
    /// An empty result for `name`, filled in as the pipeline progresses.
    pub fn pending(name: &str, bucket_name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            encoded_content: String::new(),
            storage_destination: String::new(),
            format: OUTPUT_FORMAT.to_string(),
            bucket_name: bucket_name.to_string(),
            failure: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Options shared by every request of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Upload the converted file to blob storage.
    pub upload: bool,
    /// Prefix prepended to `{name}.pdf` to build the blob key.
    pub destination_prefix: String,
    /// Return the converted bytes base64-encoded in the result.
    pub encode_output: bool,
    pub register_document: bool,
    pub send_notification: bool,
    pub tax_document_type_id: Option<i64>,
    pub destinations: Option<Vec<String>>,
    /// Bearer token forwarded to registration; the cached service token is used when absent.
    pub auth_token: Option<String>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            upload: true,
            destination_prefix: String::new(),
            encode_output: false,
            register_document: true,
            send_notification: true,
            tax_document_type_id: None,
            destinations: None,
            auth_token: None,
        }
    }
}

/// Generates a fresh unique document name.
pub fn generate_name() -> String {
    Uuid::new_v4().to_string()
}

/// Transliterates `name` to ASCII and strips characters unsafe in file names and blob keys.
pub fn normalize_name(name: &str) -> String {
    let ascii = deunicode::deunicode(name.trim());
    let normalized: String = ascii
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_ascii_control() => '_',
            c => c,
        })
        .collect();
    let normalized = normalized.trim_matches('.').to_string();
    if normalized.is_empty() {
        generate_name()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_transliterates() {
        assert_eq!(normalize_name("Certificación Año 2023"), "Certificacion Ano 2023");
    }

    #[test]
    fn test_normalize_strips_path_separators() {
        assert_eq!(normalize_name("../etc/passwd"), "_etc_passwd");
        assert_eq!(normalize_name("a\\b:c"), "a_b_c");
    }

    #[test]
    fn test_request_generates_name_when_missing() {
        let request = ConversionRequest::new(None, None, serde_json::json!({}));
        assert!(Uuid::parse_str(&request.name).is_ok());

        let blank = ConversionRequest::new(Some("   "), None, serde_json::json!({}));
        assert!(Uuid::parse_str(&blank.name).is_ok());
    }

    #[test]
    fn test_result_wire_names() {
        let result = ConversionResult::pending("invoice-1", "docs-bucket");
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "id": "invoice-1",
                "name": "invoice-1",
                "pdf_to_base64": "",
                "S3Destination": "",
                "file_type": "pdf",
                "bucket_name": "docs-bucket",
            })
        );
        assert!(result.is_success());
    }
}
