//! Validation of raw queue envelopes into typed document generation messages.

use std::collections::HashMap;

use uuid::Uuid;

use crate::error::WorkerError;
use crate::job::{ConversionRequest, PipelineOptions};
use crate::queue::{AttributeValue, ReceivedMessage};

/// Attribute names carried by document generation messages.
pub mod attribute {
    pub const TEMPLATE: &str = "template";
    pub const CONTEXT: &str = "context";
    pub const TAX_DOCUMENT_TYPE_ID: &str = "tax_document_type_id";
    pub const RELATED_SOURCE_ID: &str = "related_source_id";
    pub const SUBFOLDER: &str = "subfolder";
    pub const REGISTER_DOCUMENT: &str = "register_document";
    pub const SEND_NOTIFICATION: &str = "send_SNS";
    pub const DESTINATIONS: &str = "destinations";
    pub const TRACE_PARENT: &str = "Traceparent";
}

/// Typed attributes of a document generation message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAttributes {
    pub template_ref: String,
    /// Nested key/value structure used to fill the template.
    pub content: serde_json::Value,
    pub tax_document_type_id: Option<i64>,
    pub related_source_id: Option<Uuid>,
    /// Destination key prefix overriding the configured default.
    pub subfolder: Option<String>,
    pub register_document: bool,
    pub send_notification: bool,
    pub destinations: Option<Vec<String>>,
    /// Propagated to telemetry only.
    pub trace_parent: Option<String>,
}

/// A validated queue message.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub receipt_handle: String,
    /// Free text, used as the document name when present.
    pub body: Option<String>,
    pub attributes: MessageAttributes,
}

impl QueueMessage {
    /// Validates a raw envelope. Missing or malformed attributes fail closed.
    pub fn parse(message: &ReceivedMessage) -> Result<Self, WorkerError> {
        let attrs = &message.attributes;

        let template_ref = string_attr(attrs, attribute::TEMPLATE)?
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| missing(attribute::TEMPLATE))?
            .to_string();

        let content = parse_content(attrs)?;

        let tax_document_type_id = string_attr(attrs, attribute::TAX_DOCUMENT_TYPE_ID)?
            .map(|raw| {
                raw.trim().parse::<i64>().map_err(|_| {
                    invalid(attribute::TAX_DOCUMENT_TYPE_ID, "a valid integer is required")
                })
            })
            .transpose()?;

        let related_source_id = string_attr(attrs, attribute::RELATED_SOURCE_ID)?
            .map(|raw| {
                Uuid::parse_str(raw.trim())
                    .map_err(|_| invalid(attribute::RELATED_SOURCE_ID, "must be a valid UUID"))
            })
            .transpose()?;

        let register_document = string_attr(attrs, attribute::REGISTER_DOCUMENT)?
            .map(|raw| parse_bool(attribute::REGISTER_DOCUMENT, raw))
            .transpose()?
            .unwrap_or(true);

        let send_notification = string_attr(attrs, attribute::SEND_NOTIFICATION)?
            .map(|raw| parse_bool(attribute::SEND_NOTIFICATION, raw))
            .transpose()?
            .unwrap_or(true);

        let destinations = string_attr(attrs, attribute::DESTINATIONS)?
            .map(|raw| raw.split(',').map(|d| d.trim().to_string()).collect());

        Ok(Self {
            id: message.message_id.clone(),
            receipt_handle: message.receipt_handle.clone(),
            body: message.body.clone(),
            attributes: MessageAttributes {
                template_ref,
                content,
                tax_document_type_id,
                related_source_id,
                subfolder: string_attr(attrs, attribute::SUBFOLDER)?.map(str::to_string),
                register_document,
                send_notification,
                destinations,
                trace_parent: string_attr(attrs, attribute::TRACE_PARENT)?.map(str::to_string),
            },
        })
    }

    /// The single request this message asks to render. The body names the document.
    pub fn to_request(&self) -> ConversionRequest {
        ConversionRequest::new(
            self.body.as_deref(),
            self.attributes.related_source_id,
            self.attributes.content.clone(),
        )
    }

    /// Pipeline options for this message; uploads always happen.
    pub fn to_options(&self, default_prefix: &str) -> PipelineOptions {
        let attrs = &self.attributes;
        PipelineOptions {
            upload: true,
            destination_prefix: attrs
                .subfolder
                .clone()
                .unwrap_or_else(|| default_prefix.to_string()),
            encode_output: false,
            register_document: attrs.register_document,
            send_notification: attrs.send_notification,
            tax_document_type_id: attrs.tax_document_type_id,
            destinations: attrs.destinations.clone(),
            auth_token: None,
        }
    }
}

fn string_attr<'a>(
    attrs: &'a HashMap<String, AttributeValue>,
    name: &str,
) -> Result<Option<&'a str>, WorkerError> {
    match attrs.get(name) {
        None => Ok(None),
        Some(AttributeValue::String(value)) => Ok(Some(value.as_str())),
        Some(AttributeValue::Binary(_)) => Err(invalid(name, "expected a string value")),
    }
}

fn parse_content(
    attrs: &HashMap<String, AttributeValue>,
) -> Result<serde_json::Value, WorkerError> {
    let bytes = match attrs.get(attribute::CONTEXT) {
        Some(AttributeValue::Binary(bytes)) => bytes.as_slice(),
        Some(AttributeValue::String(text)) => text.as_bytes(),
        None => return Err(missing(attribute::CONTEXT)),
    };
    let text = std::str::from_utf8(bytes)
        .map_err(|_| invalid(attribute::CONTEXT, "must be UTF-8 encoded"))?;
    let content: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| invalid(attribute::CONTEXT, &format!("must be JSON: {e}")))?;
    if !content.is_object() {
        return Err(invalid(attribute::CONTEXT, "must be a JSON object"));
    }
    Ok(content)
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, WorkerError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Ok(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Ok(false),
        _ => Err(invalid(name, "must be a valid boolean")),
    }
}

fn missing(name: &str) -> WorkerError {
    WorkerError::Validation(format!("{name}: this field is required"))
}

fn invalid(name: &str, reason: &str) -> WorkerError {
    WorkerError::Validation(format!("{name}: {reason}"))
}
