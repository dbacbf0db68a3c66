//! Jinja-style substitution inside `.docx` packages.
//!
//! The main document part, headers and footers are rendered with [`minijinja`] using the
//! prepared content tree as scope. Inline images found in the tree are embedded into the
//! main document as pictures; the form-feed page-break marker becomes a Word page break.
//!
//! Word splits typed text into several runs and escapes `<`, `>` and quotes, so before
//! rendering every `{{ }}`, `{% %}` and `{# #}` tag is reassembled: markup inside it is
//! dropped and entities and smart quotes are restored.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use minijinja::{AutoEscape, Environment, ErrorKind};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::WorkerError;
use crate::renderer::{format_number, InlineImage, TemplateEngine, PAGE_BREAK};

const DOCUMENT_PART: &str = "word/document.xml";
const DOCUMENT_RELS_PART: &str = "word/_rels/document.xml.rels";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const IMAGE_RELATIONSHIP: &str =
    "http://schemas.openxmlformats.org/officeDocument/2006/relationships/image";
const TOKEN_MARK: char = '\u{1}';
const EMU_PER_MM: f64 = 36_000.0;

/// An opening delimiter whose two characters landed in different runs.
static SPLIT_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(?:<[^>]*>)+([{%#])").expect("Failed to compile regex"));
static SPLIT_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([}%#])(?:<[^>]*>)+\}").expect("Failed to compile regex"));
static TEMPLATE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\{\{.*?\}\}|\{%.*?%\}|\{#.*?#\}").expect("Failed to compile regex")
});
static XML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]*>").expect("Failed to compile regex"));

const PAGE_BREAK_RUN: &str =
    r#"</w:t></w:r><w:r><w:br w:type="page"/></w:r><w:r><w:t xml:space="preserve">"#;

/// [`TemplateEngine`] for Word documents.
pub struct DocxTemplateEngine {
    env: Environment<'static>,
}

impl Default for DocxTemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DocxTemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::Html);
        env.add_filter("col_number_format", col_number_format);
        Self { env }
    }

    fn render_part(
        &self,
        part: &str,
        source: &str,
        context: &minijinja::Value,
    ) -> Result<String, WorkerError> {
        self.env
            .render_str(&clean_template_tags(source), context)
            .map_err(|e| WorkerError::Template(format!("{part}: {e:#}")))
    }
}

/// `{{ value | col_number_format(decimals) }}`, defaulting to zero for empty values.
pub fn col_number_format(
    value: minijinja::Value,
    decimals: Option<usize>,
) -> Result<String, minijinja::Error> {
    let decimals = decimals.unwrap_or(2);
    if !value.is_true() {
        return Ok(format_number(0.0, decimals));
    }
    let number = match value.as_str() {
        Some(text) => text.trim().parse::<f64>().map_err(|_| {
            minijinja::Error::new(
                ErrorKind::InvalidOperation,
                format!("col_number_format expects a number, got {text:?}"),
            )
        })?,
        None => f64::try_from(value)?,
    };
    Ok(format_number(number, decimals))
}

/// Rejoins template tags that Word split across runs or escaped.
fn clean_template_tags(xml: &str) -> String {
    let joined = SPLIT_OPEN.replace_all(xml, "{$1");
    let joined = SPLIT_CLOSE.replace_all(&joined, "${1}}");
    TEMPLATE_TAG
        .replace_all(&joined, |caps: &Captures| unescape_tag(&caps[0]))
        .into_owned()
}

fn unescape_tag(tag: &str) -> String {
    XML_TAG
        .replace_all(tag, "")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201c}', '\u{201d}'], "\"")
        .replace("&amp;", "&")
}

struct PreparedContext {
    value: Value,
    /// Distinct images, in order of first appearance; index + 1 is the image number.
    images: Vec<InlineImage>,
}

/// Replaces inline image markers with placeholder tokens carrying the image number.
fn prepare_context(context: &Value) -> PreparedContext {
    fn walk(value: &Value, images: &mut Vec<InlineImage>) -> Value {
        if let Some(image) = InlineImage::from_value(value) {
            let number = match images.iter().position(|i| i.path == image.path) {
                Some(index) => index + 1,
                None => {
                    images.push(image);
                    images.len()
                }
            };
            return Value::String(image_token(number));
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), walk(v, images)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| walk(v, images)).collect()),
            other => other.clone(),
        }
    }

    let mut images = Vec::new();
    let value = walk(context, &mut images);
    PreparedContext { value, images }
}

fn image_token(number: usize) -> String {
    format!("{TOKEN_MARK}inline-image:{number}{TOKEN_MARK}")
}

fn drawing_run(number: usize, drawing_id: usize, image: &InlineImage) -> String {
    let cx = (image.width_mm * EMU_PER_MM).round() as u64;
    let cy = (image.height_mm * EMU_PER_MM).round() as u64;
    format!(
        concat!(
            r#"</w:t></w:r><w:r><w:drawing><wp:inline distT="0" distB="0" distL="0" distR="0">"#,
            r#"<wp:extent cx="{cx}" cy="{cy}"/><wp:docPr id="{id}" name="Barcode {n}"/>"#,
            r#"<a:graphic xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main">"#,
            r#"<a:graphicData uri="http://schemas.openxmlformats.org/drawingml/2006/picture">"#,
            r#"<pic:pic xmlns:pic="http://schemas.openxmlformats.org/drawingml/2006/picture">"#,
            r#"<pic:nvPicPr><pic:cNvPr id="0" name="barcode{n}.png"/><pic:cNvPicPr/></pic:nvPicPr>"#,
            r#"<pic:blipFill><a:blip r:embed="rIdBarcode{n}"/><a:stretch><a:fillRect/></a:stretch></pic:blipFill>"#,
            r#"<pic:spPr><a:xfrm><a:off x="0" y="0"/><a:ext cx="{cx}" cy="{cy}"/></a:xfrm>"#,
            r#"<a:prstGeom prst="rect"><a:avLst/></a:prstGeom></pic:spPr></pic:pic>"#,
            r#"</a:graphicData></a:graphic></wp:inline></w:drawing></w:r><w:r><w:t xml:space="preserve">"#,
        ),
        cx = cx,
        cy = cy,
        id = drawing_id,
        n = number,
    )
}

/// Swaps placeholder tokens and page breaks in rendered XML for Word markup.
fn finish_part(xml: &str, images: &[InlineImage], embed_images: bool) -> String {
    let mut out = xml.replace(PAGE_BREAK, PAGE_BREAK_RUN);
    let mut drawing_id = 1000;
    for (index, image) in images.iter().enumerate() {
        let number = index + 1;
        let token = image_token(number);
        if !embed_images {
            out = out.replace(&token, "");
            continue;
        }
        while let Some(position) = out.find(&token) {
            drawing_id += 1;
            out.replace_range(
                position..position + token.len(),
                &drawing_run(number, drawing_id, image),
            );
        }
    }
    out
}

fn add_image_relationships(rels: &str, images: &[InlineImage]) -> String {
    let entries: String = (1..=images.len())
        .map(|n| {
            format!(
                r#"<Relationship Id="rIdBarcode{n}" Type="{IMAGE_RELATIONSHIP}" Target="media/barcode{n}.png"/>"#
            )
        })
        .collect();
    match rels.rfind("</Relationships>") {
        Some(position) => {
            let mut out = rels.to_string();
            out.insert_str(position, &entries);
            out
        }
        None => rels.to_string(),
    }
}

fn add_png_content_type(types: &str) -> String {
    if types.contains(r#"Extension="png""#) {
        return types.to_string();
    }
    match types.rfind("</Types>") {
        Some(position) => {
            let mut out = types.to_string();
            out.insert_str(position, r#"<Default Extension="png" ContentType="image/png"/>"#);
            out
        }
        None => types.to_string(),
    }
}

fn is_header_or_footer(name: &str) -> bool {
    let Some(file) = name.strip_prefix("word/") else {
        return false;
    };
    !file.contains('/')
        && (file.starts_with("header") || file.starts_with("footer"))
        && file.ends_with(".xml")
}

fn zip_error(path: &Path, err: zip::result::ZipError) -> WorkerError {
    WorkerError::Template(format!("{}: {err}", path.display()))
}

impl TemplateEngine for DocxTemplateEngine {
    fn render(
        &self,
        template: &Path,
        context: &Value,
        destination: &Path,
    ) -> Result<(), WorkerError> {
        let prepared = prepare_context(context);
        let scope = minijinja::Value::from_serializable(&prepared.value);

        let file = File::open(template).map_err(|e| WorkerError::io(template, e))?;
        let mut archive = ZipArchive::new(file).map_err(|e| zip_error(template, e))?;

        let mut parts: Vec<(String, Vec<u8>, bool)> = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| zip_error(template, e))?;
            let name = entry.name().to_string();
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| WorkerError::io(template, e))?;
            parts.push((name, bytes, entry.is_dir()));
        }

        let has_images = !prepared.images.is_empty();
        let mut rendered: HashMap<String, Vec<u8>> = HashMap::new();
        for (name, bytes, _) in &parts {
            let is_document = name == DOCUMENT_PART;
            if !is_document && !is_header_or_footer(name) {
                continue;
            }
            let source = std::str::from_utf8(bytes)
                .map_err(|_| WorkerError::Template(format!("{name} is not UTF-8")))?;
            let xml = self.render_part(name, source, &scope)?;
            let xml = finish_part(&xml, &prepared.images, is_document);
            rendered.insert(name.clone(), xml.into_bytes());
        }

        let out = File::create(destination).map_err(|e| WorkerError::io(destination, e))?;
        let mut writer = ZipWriter::new(out);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

        for (name, bytes, is_dir) in &parts {
            if *is_dir {
                writer
                    .add_directory(name.as_str(), options)
                    .map_err(|e| zip_error(destination, e))?;
                continue;
            }
            let body: Vec<u8> = match name.as_str() {
                _ if rendered.contains_key(name) => rendered.remove(name).unwrap_or_default(),
                DOCUMENT_RELS_PART if has_images => {
                    add_image_relationships(&String::from_utf8_lossy(bytes), &prepared.images)
                        .into_bytes()
                }
                CONTENT_TYPES_PART if has_images => {
                    add_png_content_type(&String::from_utf8_lossy(bytes)).into_bytes()
                }
                _ => bytes.clone(),
            };
            writer
                .start_file(name.as_str(), options)
                .map_err(|e| zip_error(destination, e))?;
            writer
                .write_all(&body)
                .map_err(|e| WorkerError::io(destination, e))?;
        }

        for (index, image) in prepared.images.iter().enumerate() {
            let bytes = std::fs::read(&image.path).map_err(|e| WorkerError::io(&image.path, e))?;
            writer
                .start_file(format!("word/media/barcode{}.png", index + 1), options)
                .map_err(|e| zip_error(destination, e))?;
            writer
                .write_all(&bytes)
                .map_err(|e| WorkerError::io(destination, e))?;
        }

        writer.finish().map_err(|e| zip_error(destination, e))?;
        debug!(
            template = %template.display(),
            destination = %destination.display(),
            images = prepared.images.len(),
            "Rendered docx template"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#;
    const RELS: &str = r#"<?xml version="1.0" encoding="UTF-8"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#;

    fn write_template(path: &Path, document: &str, footer: &str) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        let options = FileOptions::default();
        for (name, body) in [
            (CONTENT_TYPES_PART, CONTENT_TYPES),
            (DOCUMENT_RELS_PART, RELS),
            (DOCUMENT_PART, document),
            ("word/footer1.xml", footer),
        ] {
            writer.start_file(name, options).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_bytes(path: &Path, name: &str) -> Option<Vec<u8>> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut entry = archive.by_name(name).ok()?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).unwrap();
        Some(bytes)
    }

    fn read_part(path: &Path, name: &str) -> Option<String> {
        read_bytes(path, name).map(|bytes| String::from_utf8(bytes).unwrap())
    }

    #[test]
    fn test_col_number_format_filter() {
        use minijinja::Value as V;

        assert_eq!(col_number_format(V::from(1234.5), None).unwrap(), "1.234,50");
        assert_eq!(col_number_format(V::from(1234.6), Some(0)).unwrap(), "1.235");
        assert_eq!(col_number_format(V::from("2500"), Some(1)).unwrap(), "2.500,0");
        assert_eq!(col_number_format(V::from(()), Some(2)).unwrap(), "0,00");
        assert_eq!(col_number_format(V::from(""), None).unwrap(), "0,00");
        assert!(col_number_format(V::from("abc"), None).is_err());
    }

    #[test]
    fn test_header_and_footer_detection() {
        assert!(is_header_or_footer("word/header1.xml"));
        assert!(is_header_or_footer("word/footer2.xml"));
        assert!(!is_header_or_footer("word/_rels/header1.xml.rels"));
        assert!(!is_header_or_footer("word/styles.xml"));
    }

    #[test]
    fn test_render_docx_substitutes_and_embeds_images() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.docx");
        let output = dir.path().join("out.docx");
        let barcode = dir.path().join("barcode.png");
        std::fs::write(&barcode, b"\x89PNG fake").unwrap();
        write_template(
            &template,
            r#"<w:document><w:body><w:p><w:r><w:t>{{ customer }} {{ total|col_number_format(2) }}</w:t></w:r></w:p><w:p><w:r><w:t>{{ barcode }}{{ page_break }}</w:t></w:r></w:p></w:body></w:document>"#,
            r#"<w:ftr><w:p><w:r><w:t>{{ customer }}{{ barcode }}</w:t></w:r></w:p></w:ftr>"#,
        );
        let image = InlineImage {
            path: barcode.clone(),
            width_mm: 110.0,
            height_mm: 20.0,
        };
        let context = serde_json::json!({
            "customer": "Acme & Sons",
            "total": 1234.5,
            "barcode": image.to_value(),
            "page_break": PAGE_BREAK,
        });

        DocxTemplateEngine::new()
            .render(&template, &context, &output)
            .unwrap();

        let document = read_part(&output, DOCUMENT_PART).unwrap();
        assert!(document.contains("Acme &amp; Sons 1.234,50"));
        assert!(document.contains(r#"r:embed="rIdBarcode1""#));
        assert!(document.contains(r#"cx="3960000""#));
        assert!(document.contains(r#"<w:br w:type="page"/>"#));
        assert!(!document.contains(TOKEN_MARK));

        let footer = read_part(&output, "word/footer1.xml").unwrap();
        assert!(footer.contains("Acme &amp; Sons</w:t>"));
        assert!(!footer.contains("w:drawing"));

        let rels = read_part(&output, DOCUMENT_RELS_PART).unwrap();
        assert!(rels.contains(r#"Target="media/barcode1.png""#));
        let types = read_part(&output, CONTENT_TYPES_PART).unwrap();
        assert!(types.contains(r#"<Default Extension="png" ContentType="image/png"/>"#));
        assert_eq!(
            read_bytes(&output, "word/media/barcode1.png").unwrap(),
            b"\x89PNG fake".to_vec()
        );
    }

    #[test]
    fn test_render_docx_without_images_keeps_package_parts() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.docx");
        let output = dir.path().join("out.docx");
        write_template(
            &template,
            "<w:document><w:t>{{ missing }}done</w:t></w:document>",
            "<w:ftr/>",
        );

        DocxTemplateEngine::new()
            .render(&template, &serde_json::json!({}), &output)
            .unwrap();

        assert_eq!(
            read_part(&output, DOCUMENT_PART).unwrap(),
            "<w:document><w:t>done</w:t></w:document>"
        );
        assert_eq!(read_part(&output, CONTENT_TYPES_PART).unwrap(), CONTENT_TYPES);
        assert_eq!(read_part(&output, DOCUMENT_RELS_PART).unwrap(), RELS);
        assert!(read_bytes(&output, "word/media/barcode1.png").is_none());
    }

    #[test]
    fn test_repeated_image_gets_one_number() {
        let image = InlineImage {
            path: PathBuf::from("/tmp/a.png"),
            width_mm: 1.0,
            height_mm: 1.0,
        };
        let context = serde_json::json!({"a": image.to_value(), "b": [image.to_value()]});

        let prepared = prepare_context(&context);

        assert_eq!(prepared.images, vec![image]);
        assert_eq!(prepared.value["a"], Value::String(image_token(1)));
        assert_eq!(prepared.value["b"][0], Value::String(image_token(1)));
    }

    #[test]
    fn test_clean_template_tags_rejoins_split_runs() {
        let xml = r#"<w:r><w:t>{{ cus</w:t></w:r><w:proofErr w:type="spellStart"/><w:r><w:rPr><w:b/></w:rPr><w:t>tomer }}</w:t></w:r>"#;
        assert_eq!(clean_template_tags(xml), "<w:r><w:t>{{ customer }}</w:t></w:r>");

        let xml = "<w:t>{</w:t></w:r><w:r><w:t>{ name }</w:t></w:r><w:r><w:t>}</w:t>";
        assert_eq!(clean_template_tags(xml), "<w:t>{{ name }}</w:t>");
    }

    #[test]
    fn test_clean_template_tags_unescapes_operators_and_quotes() {
        assert_eq!(
            clean_template_tags("<w:t>{% if total &gt; 1 %}a &amp; b{% endif %}</w:t>"),
            "<w:t>{% if total > 1 %}a &amp; b{% endif %}</w:t>"
        );
        assert_eq!(
            clean_template_tags("<w:t>{{ label or \u{201c}none\u{201d} }}</w:t>"),
            r#"<w:t>{{ label or "none" }}</w:t>"#
        );
    }

    #[test]
    fn test_render_docx_with_word_split_tags() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.docx");
        let output = dir.path().join("out.docx");
        write_template(
            &template,
            "<w:document><w:body><w:p><w:r><w:t>{{ cus</w:t></w:r><w:r><w:t>tomer }}</w:t></w:r></w:p><w:p><w:r><w:t>{% if total &gt; 1000 %}large{% endif %} {{ note or \u{201c}none\u{201d} }}</w:t></w:r></w:p></w:body></w:document>",
            "<w:ftr/>",
        );

        DocxTemplateEngine::new()
            .render(
                &template,
                &serde_json::json!({"customer": "Acme", "total": 1234.5}),
                &output,
            )
            .unwrap();

        assert_eq!(
            read_part(&output, DOCUMENT_PART).unwrap(),
            "<w:document><w:body><w:p><w:r><w:t>Acme</w:t></w:r></w:p><w:p><w:r><w:t>large none</w:t></w:r></w:p></w:body></w:document>"
        );
    }
}
