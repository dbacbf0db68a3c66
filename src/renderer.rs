//! Document rendering: barcode splicing, page-break injection and template substitution.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::WorkerError;

/// Field holding the text to encode as a barcode.
pub const BARCODE_TEXT_FIELD: &str = "bar_code_text";
/// Fields replaced by the generated barcode image.
pub const BARCODE_FIELD: &str = "barcode";
/// Synthetic field carrying the page-break marker.
pub const PAGE_BREAK_FIELD: &str = "page_break";
/// Form feed, turned into a hard page break by the template engine.
pub const PAGE_BREAK: &str = "\u{c}";
/// Key wrapping an [`InlineImage`] inside the content tree.
pub const INLINE_IMAGE_KEY: &str = "__inline_image__";

const BARCODE_HEIGHT_MM: f64 = 20.0;

/// An image to embed at the position of the field that holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineImage {
    pub path: PathBuf,
    pub width_mm: f64,
    pub height_mm: f64,
}

impl InlineImage {
    /// Wraps the image into the marker object the template engine recognises.
    pub fn to_value(&self) -> Value {
        let mut marker = Map::new();
        marker.insert(
            INLINE_IMAGE_KEY.to_string(),
            serde_json::to_value(self).unwrap_or(Value::Null),
        );
        Value::Object(marker)
    }

    /// Reads an image back from its marker object.
    pub fn from_value(value: &Value) -> Option<Self> {
        let inner = value.as_object()?.get(INLINE_IMAGE_KEY)?;
        serde_json::from_value(inner.clone()).ok()
    }
}

/// A rendered document and the side files produced while rendering it.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDocument {
    pub path: PathBuf,
    pub barcode_paths: Vec<PathBuf>,
}

/// Renders a content tree through a template into a document file.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        content: &Value,
        template: &Path,
        destination: &Path,
    ) -> Result<RenderedDocument, WorkerError>;
}

/// Plain template substitution over a prepared content tree.
pub trait TemplateEngine: Send + Sync {
    fn render(&self, template: &Path, context: &Value, destination: &Path)
        -> Result<(), WorkerError>;
}

/// Writes a GS1-128 barcode image.
#[async_trait]
pub trait BarcodeWriter: Send + Sync {
    async fn write(&self, data: &str, destination: &Path) -> Result<(), WorkerError>;
}

/// [`DocumentRenderer`] that prepares the content tree and delegates to a [`TemplateEngine`].
pub struct TemplateRenderer {
    engine: Arc<dyn TemplateEngine>,
    barcodes: Arc<dyn BarcodeWriter>,
    barcodes_dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(
        engine: Arc<dyn TemplateEngine>,
        barcodes: Arc<dyn BarcodeWriter>,
        barcodes_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            barcodes,
            barcodes_dir: barcodes_dir.into(),
        }
    }

    fn barcode_path(&self, destination: &Path, text: &str) -> PathBuf {
        let stem = destination
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sanitized: String = text
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        self.barcodes_dir.join(format!("{stem}-{sanitized}.png"))
    }
}

#[async_trait]
impl DocumentRenderer for TemplateRenderer {
    async fn render(
        &self,
        content: &Value,
        template: &Path,
        destination: &Path,
    ) -> Result<RenderedDocument, WorkerError> {
        let mut context = content.clone();
        if !context.is_object() {
            return Err(WorkerError::Template(
                "content must be a key/value object".to_string(),
            ));
        }

        let mut barcode_paths = Vec::new();
        if let Some(text) = find_barcode_text(&context) {
            let path = self.barcode_path(destination, &text);
            self.barcodes.write(&text, &path).await?;
            barcode_paths.push(path.clone());

            let image = InlineImage {
                path,
                width_mm: barcode_width_mm(&text),
                height_mm: BARCODE_HEIGHT_MM,
            };
            let replaced = replace_fields(&mut context, BARCODE_FIELD, &image.to_value());
            debug!(text = %text, replaced, "Barcode spliced into content");
        }

        if let Value::Object(map) = &mut context {
            map.insert(
                PAGE_BREAK_FIELD.to_string(),
                Value::String(PAGE_BREAK.to_string()),
            );
        }

        let engine = self.engine.clone();
        let template = template.to_path_buf();
        let target = destination.to_path_buf();
        let rendered =
            tokio::task::spawn_blocking(move || engine.render(&template, &context, &target))
                .await
                .map_err(|e| WorkerError::Template(format!("render task failed: {e}")))
                .and_then(|result| result);

        if let Err(err) = rendered {
            for path in &barcode_paths {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    debug!(path = %path.display(), error = %e, "Barcode already removed");
                }
            }
            return Err(err);
        }

        Ok(RenderedDocument {
            path: destination.to_path_buf(),
            barcode_paths,
        })
    }
}

/// First barcode text found, searching each object's own fields before its children.
pub fn find_barcode_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(text) = map.get(BARCODE_TEXT_FIELD).and_then(scalar_text) {
                return Some(text);
            }
            map.values().find_map(find_barcode_text)
        }
        Value::Array(items) => items.iter().find_map(find_barcode_text),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Replaces every field named `field` at any depth; returns how many were replaced.
fn replace_fields(value: &mut Value, field: &str, replacement: &Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut count = 0;
            for (key, child) in map.iter_mut() {
                if key == field {
                    *child = replacement.clone();
                    count += 1;
                } else {
                    count += replace_fields(child, field, replacement);
                }
            }
            count
        }
        Value::Array(items) => items
            .iter_mut()
            .map(|item| replace_fields(item, field, replacement))
            .sum(),
        _ => 0,
    }
}

/// Printed width of a GS1-128 barcode for `text`, in millimetres.
pub fn barcode_width_mm(text: &str) -> f64 {
    let digits = text.chars().filter(|c| *c != '(' && *c != ')').count() as f64;
    ((11.0 * (digits / 2.0 + 3.0)) + 66.0) * 0.25
}

/// Formats `value` with `.` as thousands separator and `,` before `decimals` decimals.
pub fn format_number(value: f64, decimals: usize) -> String {
    let fixed = format!("{:.*}", decimals, value.abs());
    let (integer, fraction) = match fixed.split_once('.') {
        Some((integer, fraction)) => (integer, Some(fraction)),
        None => (fixed.as_str(), None),
    };

    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3);
    for (i, digit) in integer.chars().enumerate() {
        if i > 0 && (integer.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    let is_zero = fixed.chars().all(|c| c == '0' || c == '.');
    let mut out = String::new();
    if value.is_sign_negative() && !is_zero {
        out.push('-');
    }
    out.push_str(&grouped);
    if let Some(fraction) = fraction {
        out.push(',');
        out.push_str(fraction);
    }
    out
}

/// [`BarcodeWriter`] invoking the `zint` command line.
pub struct ZintBarcodeWriter {
    program: String,
}

impl ZintBarcodeWriter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl BarcodeWriter for ZintBarcodeWriter {
    async fn write(&self, data: &str, destination: &Path) -> Result<(), WorkerError> {
        let output = Command::new(&self.program)
            .arg("--barcode=16")
            .arg("--notext")
            .arg("--gs1parens")
            .arg(format!("--data={data}"))
            .arg(format!("--output={}", destination.display()))
            .output()
            .await
            .map_err(|e| WorkerError::Template(format!("could not run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = ?output.status, stderr = %stderr.trim(), "Barcode generation failed");
            return Err(WorkerError::Template(format!(
                "barcode generation failed for {data}: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingEngine {
        contexts: Mutex<Vec<Value>>,
        fail: bool,
    }

    impl TemplateEngine for RecordingEngine {
        fn render(
            &self,
            _template: &Path,
            context: &Value,
            destination: &Path,
        ) -> Result<(), WorkerError> {
            self.contexts.lock().unwrap().push(context.clone());
            if self.fail {
                return Err(WorkerError::Template("undefined variable".to_string()));
            }
            std::fs::write(destination, b"rendered").map_err(|e| WorkerError::io(destination, e))
        }
    }

    struct FileBarcodeWriter;

    #[async_trait]
    impl BarcodeWriter for FileBarcodeWriter {
        async fn write(&self, data: &str, destination: &Path) -> Result<(), WorkerError> {
            tokio::fs::write(destination, data)
                .await
                .map_err(|e| WorkerError::io(destination, e))
        }
    }

    fn renderer(engine: Arc<RecordingEngine>, dir: &Path) -> TemplateRenderer {
        TemplateRenderer::new(engine, Arc::new(FileBarcodeWriter), dir)
    }

    #[test]
    fn test_barcode_width_formula() {
        let text = format!("(415){}", "7".repeat(58));
        assert_eq!(text.len(), 63);
        // 61 characters once parentheses are stripped
        assert_eq!(barcode_width_mm(&text), ((11.0 * (30.5 + 3.0)) + 66.0) * 0.25);
        assert_eq!(barcode_width_mm(&"1".repeat(62)), 110.0);
    }

    #[test]
    fn test_format_number_swaps_separators() {
        assert_eq!(format_number(1234.5, 2), "1.234,50");
        assert_eq!(format_number(1234567.891, 0), "1.234.568");
        assert_eq!(format_number(-9876.5, 1), "-9.876,5");
        assert_eq!(format_number(0.0, 2), "0,00");
        assert_eq!(format_number(999.0, 2), "999,00");
    }

    #[test]
    fn test_find_barcode_text_prefers_shallow_fields() {
        let content = serde_json::json!({
            "invoice": {"bar_code_text": "(415)deep"},
            "bar_code_text": "(415)top",
        });
        assert_eq!(find_barcode_text(&content).as_deref(), Some("(415)top"));

        let nested = serde_json::json!({"items": [{"x": 1}, {"bar_code_text": "(8020)1"}]});
        assert_eq!(find_barcode_text(&nested).as_deref(), Some("(8020)1"));
    }

    #[tokio::test]
    async fn test_render_splices_barcode_everywhere_without_mutating_input() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let content = serde_json::json!({
            "bar_code_text": "(415)7709998001234",
            "barcode": null,
            "coupon": {"barcode": null},
        });
        let original = content.clone();
        let destination = dir.path().join("invoice.docx");

        let rendered = renderer(engine.clone(), dir.path())
            .render(&content, Path::new("template.docx"), &destination)
            .await
            .unwrap();

        assert_eq!(content, original);
        assert_eq!(rendered.path, destination);
        assert_eq!(rendered.barcode_paths.len(), 1);
        assert!(rendered.barcode_paths[0].exists());

        let seen = engine.contexts.lock().unwrap()[0].clone();
        let top = InlineImage::from_value(&seen["barcode"]).unwrap();
        let nested = InlineImage::from_value(&seen["coupon"]["barcode"]).unwrap();
        assert_eq!(top, nested);
        assert_eq!(top.height_mm, 20.0);
        assert_eq!(seen[PAGE_BREAK_FIELD], Value::String(PAGE_BREAK.to_string()));
    }

    #[tokio::test]
    async fn test_render_without_barcode_text_leaves_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let content = serde_json::json!({"barcode": "none", "total": 3});

        let rendered = renderer(engine.clone(), dir.path())
            .render(&content, Path::new("t.docx"), &dir.path().join("out.docx"))
            .await
            .unwrap();

        assert!(rendered.barcode_paths.is_empty());
        let seen = engine.contexts.lock().unwrap()[0].clone();
        assert_eq!(seen["barcode"], "none");
    }

    #[tokio::test]
    async fn test_engine_failure_removes_barcodes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(RecordingEngine {
            fail: true,
            ..Default::default()
        });
        let content = serde_json::json!({"bar_code_text": "(415)1", "barcode": null});

        let err = renderer(engine, dir.path())
            .render(&content, Path::new("t.docx"), &dir.path().join("out.docx"))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Template(_)));
        assert!(!dir.path().join("out-4151.png").exists());
    }
}
