//! Telemetry and structured logging for the document generation worker.

use std::time::Duration;

use opentelemetry::trace::{Span, Tracer};
use opentelemetry::{global, KeyValue};
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::worker::PollMode;

const TRACER_NAME: &str = "docgen-worker";

/// Messages taking longer than this are logged as slow.
pub const SLOW_MESSAGE_THRESHOLD: Duration = Duration::from_secs(30);

/// What happened to one processed queue message.
#[derive(Debug)]
pub struct MessageReport<'a> {
    pub message_id: &'a str,
    /// Absent when the message failed validation.
    pub template: Option<&'a str>,
    pub requests: usize,
    pub duration: Duration,
    /// Propagated `Traceparent` attribute of the message.
    pub trace_parent: Option<&'a str>,
    pub error: Option<&'a WorkerError>,
}

impl MessageReport<'_> {
    pub fn outcome(&self) -> &'static str {
        if self.error.is_some() {
            "failed"
        } else {
            "succeeded"
        }
    }
}

/// Records telemetry for a processed message.
///
/// Emits a `docgen_message` span and a structured log line; slow messages and
/// failures are additionally logged as warnings.
pub fn record_message_telemetry(report: &MessageReport<'_>) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("docgen_message");
    let duration_ms = i64::try_from(report.duration.as_millis()).unwrap_or(i64::MAX);

    span.set_attribute(KeyValue::new("message_id", report.message_id.to_string()));
    span.set_attribute(KeyValue::new("outcome", report.outcome()));
    span.set_attribute(KeyValue::new("request_count", report.requests as i64));
    span.set_attribute(KeyValue::new("duration_ms", duration_ms));
    if let Some(template) = report.template {
        span.set_attribute(KeyValue::new("template", template.to_string()));
    }
    if let Some(trace_parent) = report.trace_parent {
        span.set_attribute(KeyValue::new("traceparent", trace_parent.to_string()));
    }

    info!(
        message_id = %report.message_id,
        template = report.template.unwrap_or("-"),
        outcome = report.outcome(),
        requests = report.requests,
        duration_ms,
        "Queue message processed"
    );

    if report.duration > SLOW_MESSAGE_THRESHOLD {
        warn!(
            message_id = %report.message_id,
            duration_ms,
            "Message exceeded processing threshold ({}s)",
            SLOW_MESSAGE_THRESHOLD.as_secs()
        );
    }

    if let Some(error) = report.error {
        span.set_attribute(KeyValue::new("error", error.to_string()));
        warn!(message_id = %report.message_id, error = %error, "Queue message failed");
    }

    span.end();
}

/// Records a heartbeat for a received, non-empty batch.
pub fn record_poll_heartbeat(batch_size: usize, mode: PollMode) {
    let tracer = global::tracer(TRACER_NAME);
    let mut span = tracer.start("poll_heartbeat");

    span.set_attribute(KeyValue::new("batch_size", batch_size as i64));
    span.set_attribute(KeyValue::new("poll_mode", mode.as_str()));
    span.end();

    info!(batch_size, poll_mode = mode.as_str(), "Poll heartbeat");
}

/// Initializes OpenTelemetry with an OTLP exporter over gRPC.
///
/// Should be called once at startup, from within the Tokio runtime.
pub fn init_telemetry(endpoint: &str, service_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::Config;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(Config::default().with_resource(
            opentelemetry_sdk::Resource::new(vec![
                KeyValue::new("service.name", service_name.to_string()),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    if let Some(provider) = tracer.provider() {
        global::set_tracer_provider(provider);
    }

    info!(endpoint, service_name, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_successful_message() {
        // No provider installed: spans go to the global no-op tracer.
        record_message_telemetry(&MessageReport {
            message_id: "msg-1",
            template: Some("templates/invoice.docx"),
            requests: 1,
            duration: Duration::from_millis(1200),
            trace_parent: Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            error: None,
        });
    }

    #[test]
    fn test_record_failed_message() {
        let error = WorkerError::Validation("template: this field is required".to_string());
        let report = MessageReport {
            message_id: "msg-2",
            template: None,
            requests: 0,
            duration: Duration::from_secs(31),
            trace_parent: None,
            error: Some(&error),
        };

        assert_eq!(report.outcome(), "failed");
        record_message_telemetry(&report);
    }

    #[test]
    fn test_record_heartbeat() {
        record_poll_heartbeat(10, PollMode::Fast);
    }
}
