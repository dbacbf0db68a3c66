//! Render, convert, upload and register documents from a shared template.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, error, info};

use crate::converter::FormatConverter;
use crate::error::{RegistrationError, WorkerError};
use crate::job::{generate_name, ConversionRequest, ConversionResult, PipelineOptions, OUTPUT_FORMAT};
use crate::registration::{RegistrationRequest, TemplateReference};
use crate::renderer::DocumentRenderer;
use crate::retry::RetryingRegistrar;
use crate::storage::BlobStore;

/// Directory under the download folder holding cached templates.
pub const TEMPLATE_CACHE_DIR: &str = "temporal";

const DEFAULT_TEMPLATE_EXTENSION: &str = "docx";

/// Local files created during one pipeline run, deleted when the guard drops.
#[derive(Debug, Default)]
pub struct ScratchFiles {
    paths: Vec<PathBuf>,
}

impl ScratchFiles {
    pub fn track(&mut self, path: impl Into<PathBuf>) {
        self.paths.push(path.into());
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!(path = %path.display(), error = %e, "Scratch file not removed");
            }
        }
    }
}

/// The multi-stage document pipeline.
///
/// Every request of a run produces exactly one [`ConversionResult`]; a request that
/// fails carries its failure in the result and does not stop the others. Only
/// failures before the first request (template fetch) abort the run.
pub struct ConversionPipeline {
    blob_store: Arc<dyn BlobStore>,
    renderer: Arc<dyn DocumentRenderer>,
    converter: Arc<dyn FormatConverter>,
    registrar: Option<Arc<RetryingRegistrar>>,
    bucket: String,
    download_dir: PathBuf,
    converted_dir: PathBuf,
}

impl ConversionPipeline {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        renderer: Arc<dyn DocumentRenderer>,
        converter: Arc<dyn FormatConverter>,
        bucket: impl Into<String>,
        download_dir: impl Into<PathBuf>,
        converted_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            blob_store,
            renderer,
            converter,
            registrar: None,
            bucket: bucket.into(),
            download_dir: download_dir.into(),
            converted_dir: converted_dir.into(),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<RetryingRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Directory of cached templates, purged by periodic cleanup.
    pub fn template_cache_dir(&self) -> PathBuf {
        self.download_dir.join(TEMPLATE_CACHE_DIR)
    }

    /// Renders every request from `template_ref` and returns one result per request.
    ///
    /// All local working files are removed before returning, on success and failure.
    pub async fn process(
        &self,
        template_ref: &str,
        requests: &[ConversionRequest],
        options: &PipelineOptions,
    ) -> Result<Vec<ConversionResult>, WorkerError> {
        let instance_id = match requests {
            [single] => single.name.clone(),
            _ => generate_name(),
        };
        let mut scratch = ScratchFiles::default();

        let cached = self.fetch_template(template_ref).await?;
        let working_copy = self
            .download_dir
            .join(format!("{}.{}", instance_id, template_extension(template_ref)));
        tokio::fs::copy(&cached, &working_copy)
            .await
            .map_err(|e| WorkerError::io(&working_copy, e))?;
        scratch.track(&working_copy);

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let mut result = ConversionResult::pending(&request.name, &self.bucket);
            if let Err(e) = self
                .process_one(
                    template_ref,
                    &working_copy,
                    request,
                    options,
                    &mut result,
                    &mut scratch,
                )
                .await
            {
                error!(request = %request.name, template = template_ref, error = %e, "Document failed");
                result.failure = Some(e.to_string());
            }
            results.push(result);
        }

        info!(
            template = template_ref,
            requests = requests.len(),
            failed = results.iter().filter(|r| !r.is_success()).count(),
            "Pipeline run finished"
        );
        Ok(results)
    }

    async fn process_one(
        &self,
        template_ref: &str,
        working_copy: &Path,
        request: &ConversionRequest,
        options: &PipelineOptions,
        result: &mut ConversionResult,
        scratch: &mut ScratchFiles,
    ) -> Result<(), WorkerError> {
        let rendered_path = self.converted_dir.join(format!(
            "{}.{}",
            request.name,
            template_extension(template_ref)
        ));
        scratch.track(&rendered_path);
        let rendered = self
            .renderer
            .render(&request.content, working_copy, &rendered_path)
            .await?;
        for barcode in rendered.barcode_paths {
            scratch.track(barcode);
        }

        let converted = self.converter.convert(&rendered.path).await?;
        scratch.track(&converted);

        if options.upload {
            let key = format!("{}{}.{}", options.destination_prefix, request.name, OUTPUT_FORMAT);
            self.blob_store
                .upload(&converted, &self.bucket, &key)
                .await
                .map_err(WorkerError::Storage)?;
            result.storage_destination = key;
        }

        if options.encode_output {
            let bytes = tokio::fs::read(&converted)
                .await
                .map_err(|e| WorkerError::io(&converted, e))?;
            result.encoded_content = STANDARD.encode(bytes);
        }

        if options.register_document {
            let registrar = self
                .registrar
                .as_ref()
                .ok_or(RegistrationError::NotConfigured)?;
            let registration = RegistrationRequest {
                file_metadata: result.storage_destination.clone(),
                send_notification: options.send_notification,
                template: TemplateReference {
                    template: template_ref.to_string(),
                },
                tax_document_type_id: options.tax_document_type_id,
                related_source_id: request.related_source_id,
                file_content: Some(request.content.clone()),
                destinations: options.destinations.clone(),
            };
            result.id = registrar
                .register(&registration, options.auth_token.as_deref())
                .await?;
        }

        Ok(())
    }

    /// Returns the cached copy of `template_ref`, downloading it on first use.
    async fn fetch_template(&self, template_ref: &str) -> Result<PathBuf, WorkerError> {
        let relative = cache_relative_path(template_ref)?;
        let cached = self.template_cache_dir().join(relative);
        if tokio::fs::try_exists(&cached).await.unwrap_or(false) {
            debug!(template = template_ref, "Template served from cache");
            return Ok(cached);
        }

        let parent = cached.parent().unwrap_or(&self.download_dir).to_path_buf();
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| WorkerError::io(&parent, e))?;
        let partial =
            tempfile::NamedTempFile::new_in(&parent).map_err(|e| WorkerError::io(&parent, e))?;

        self.blob_store
            .download(&self.bucket, template_ref, partial.path())
            .await
            .map_err(WorkerError::Storage)?;
        partial
            .persist(&cached)
            .map_err(|e| WorkerError::io(&cached, e.error))?;

        info!(template = template_ref, path = %cached.display(), "Template downloaded");
        Ok(cached)
    }
}

fn template_extension(template_ref: &str) -> &str {
    Path::new(template_ref)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(DEFAULT_TEMPLATE_EXTENSION)
}

/// Maps a template reference to a path inside the cache, refusing escapes.
fn cache_relative_path(template_ref: &str) -> Result<PathBuf, WorkerError> {
    let path = Path::new(template_ref);
    let safe = path.components().count() > 0
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(path.to_path_buf())
    } else {
        Err(WorkerError::Validation(format!(
            "template: {template_ref:?} is not a valid template reference"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::MockFormatConverter;
    use crate::registration::MockDocumentRegistry;
    use crate::renderer::RenderedDocument;
    use crate::retry::Backoff;
    use crate::storage::MockBlobStore;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct WritingRenderer;

    #[async_trait]
    impl DocumentRenderer for WritingRenderer {
        async fn render(
            &self,
            content: &serde_json::Value,
            template: &Path,
            destination: &Path,
        ) -> Result<RenderedDocument, WorkerError> {
            assert!(template.exists(), "working copy must exist while rendering");
            if content.get("explode").is_some() {
                return Err(WorkerError::Template("bad tag".to_string()));
            }
            let barcode = destination.with_extension("png");
            std::fs::write(&barcode, b"png").unwrap();
            std::fs::write(destination, content.to_string()).unwrap();
            Ok(RenderedDocument {
                path: destination.to_path_buf(),
                barcode_paths: vec![barcode],
            })
        }
    }

    struct Dirs {
        _root: tempfile::TempDir,
        download: PathBuf,
        converted: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let download = root.path().join("download");
        let converted = root.path().join("converted");
        std::fs::create_dir_all(&download).unwrap();
        std::fs::create_dir_all(&converted).unwrap();
        Dirs {
            _root: root,
            download,
            converted,
        }
    }

    fn template_store() -> MockBlobStore {
        let mut store = MockBlobStore::new();
        store
            .expect_download()
            .withf(|bucket, key, _| bucket == "docs" && key == "templates/invoice.docx")
            .times(1)
            .returning(|_, _, destination| {
                std::fs::write(destination, b"template").unwrap();
                Ok(())
            });
        store
    }

    fn pdf_converter() -> MockFormatConverter {
        let mut converter = MockFormatConverter::new();
        converter.expect_convert().returning(|source| {
            let output = source.with_extension("pdf");
            std::fs::write(&output, b"%PDF-1.7").unwrap();
            Ok(output)
        });
        converter
    }

    fn pipeline(store: MockBlobStore, dirs: &Dirs) -> ConversionPipeline {
        ConversionPipeline::new(
            Arc::new(store),
            Arc::new(WritingRenderer),
            Arc::new(pdf_converter()),
            "docs",
            &dirs.download,
            &dirs.converted,
        )
    }

    fn local_options() -> PipelineOptions {
        PipelineOptions {
            upload: false,
            register_document: false,
            ..Default::default()
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_upload_destination_and_scratch_cleanup() {
        let dirs = dirs();
        let mut store = template_store();
        store
            .expect_upload()
            .withf(|source, bucket, key| {
                source.exists() && bucket == "docs" && key == "invoices/invoice-7.pdf"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let options = PipelineOptions {
            destination_prefix: "invoices/".to_string(),
            encode_output: true,
            register_document: false,
            ..Default::default()
        };
        let requests = vec![ConversionRequest::new(
            Some("invoice-7"),
            None,
            serde_json::json!({"total": 1}),
        )];

        let results = pipeline(store, &dirs)
            .process("templates/invoice.docx", &requests, &options)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.is_success());
        assert_eq!(result.storage_destination, "invoices/invoice-7.pdf");
        assert_eq!(result.id, "invoice-7");
        assert_eq!(result.encoded_content, STANDARD.encode(b"%PDF-1.7"));
        assert_eq!(result.bucket_name, "docs");
        assert!(files_in(&dirs.converted).is_empty());
        assert_eq!(files_in(&dirs.download), vec![TEMPLATE_CACHE_DIR.to_string()]);
        assert!(dirs
            .download
            .join("temporal/templates/invoice.docx")
            .exists());
    }

    #[tokio::test]
    async fn test_two_requests_share_template_and_yield_two_results() {
        let dirs = dirs();
        let requests = vec![
            ConversionRequest::new(Some("a"), Some(uuid::Uuid::new_v4()), serde_json::json!({})),
            ConversionRequest::new(Some("b"), None, serde_json::json!({})),
        ];
        let pipeline = pipeline(template_store(), &dirs);

        let first = pipeline
            .process("templates/invoice.docx", &requests, &local_options())
            .await
            .unwrap();
        // Cached template: the store expects exactly one download.
        let second = pipeline
            .process("templates/invoice.docx", &requests, &local_options())
            .await
            .unwrap();

        let names = |results: &[ConversionResult]| {
            results.iter().map(|r| r.name.clone()).collect::<Vec<_>>()
        };
        assert_eq!(names(&first), vec!["a", "b"]);
        assert_eq!(names(&first), names(&second));
        assert!(first.iter().all(|r| r.format == "pdf" && r.storage_destination.is_empty()));
        assert!(files_in(&dirs.converted).is_empty());
    }

    #[tokio::test]
    async fn test_failed_request_does_not_stop_the_batch() {
        let dirs = dirs();
        let requests = vec![
            ConversionRequest::new(Some("broken"), None, serde_json::json!({"explode": true})),
            ConversionRequest::new(Some("fine"), None, serde_json::json!({})),
        ];

        let results = pipeline(template_store(), &dirs)
            .process("templates/invoice.docx", &requests, &local_options())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].failure.as_deref().unwrap().contains("bad tag"));
        assert!(results[1].is_success());
        assert!(files_in(&dirs.converted).is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure_falls_back_to_name_and_cleans_up() {
        let dirs = dirs();
        let mut store = template_store();
        store.expect_upload().returning(|_, _, _| Ok(()));
        let mut registry = MockDocumentRegistry::new();
        registry.expect_register().times(5).returning(|_, _| {
            Err(RegistrationError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        });
        let registrar = RetryingRegistrar::new(Arc::new(registry), None).with_backoff(Backoff {
            max_tries: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        });
        let pipeline = pipeline(store, &dirs).with_registrar(Arc::new(registrar));
        let options = PipelineOptions {
            destination_prefix: "pdf/".to_string(),
            auth_token: Some("token".to_string()),
            ..Default::default()
        };
        let requests = vec![ConversionRequest::new(Some("doc"), None, serde_json::json!({}))];

        let results = pipeline
            .process("templates/invoice.docx", &requests, &options)
            .await
            .unwrap();

        assert_eq!(results[0].id, "doc");
        assert_eq!(results[0].storage_destination, "pdf/doc.pdf");
        assert!(!results[0].is_success());
        assert!(files_in(&dirs.converted).is_empty());
    }

    #[tokio::test]
    async fn test_registered_id_replaces_name() {
        let dirs = dirs();
        let mut store = template_store();
        store.expect_upload().returning(|_, _, _| Ok(()));
        let mut registry = MockDocumentRegistry::new();
        registry
            .expect_register()
            .withf(|request, _| {
                request.file_metadata == "pdf/doc.pdf"
                    && request.template.template == "templates/invoice.docx"
                    && request.file_content == Some(serde_json::json!({"total": 5}))
            })
            .returning(|_, _| Ok(Some("doc-123".to_string())));
        let pipeline = pipeline(store, &dirs)
            .with_registrar(Arc::new(RetryingRegistrar::new(Arc::new(registry), None)));
        let options = PipelineOptions {
            destination_prefix: "pdf/".to_string(),
            auth_token: Some("token".to_string()),
            ..Default::default()
        };
        let requests = vec![ConversionRequest::new(
            Some("doc"),
            None,
            serde_json::json!({"total": 5}),
        )];

        let results = pipeline
            .process("templates/invoice.docx", &requests, &options)
            .await
            .unwrap();

        assert_eq!(results[0].id, "doc-123");
        assert!(results[0].is_success());
    }

    #[tokio::test]
    async fn test_registration_without_registrar_fails_request() {
        let dirs = dirs();
        let mut store = template_store();
        store.expect_upload().returning(|_, _, _| Ok(()));
        let requests = vec![ConversionRequest::new(Some("doc"), None, serde_json::json!({}))];

        let results = pipeline(store, &dirs)
            .process("templates/invoice.docx", &requests, &PipelineOptions::default())
            .await
            .unwrap();

        assert_eq!(
            results[0].failure.as_deref(),
            Some("document registration is not configured")
        );
    }

    #[tokio::test]
    async fn test_template_download_failure_aborts_run() {
        let dirs = dirs();
        let mut store = MockBlobStore::new();
        store
            .expect_download()
            .returning(|_, _, _| Err(anyhow::anyhow!("NoSuchKey")));
        let requests = vec![ConversionRequest::new(Some("doc"), None, serde_json::json!({}))];

        let err = pipeline(store, &dirs)
            .process("templates/missing.docx", &requests, &local_options())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Storage(_)));
        assert!(!dirs.download.join("temporal/templates/missing.docx").exists());
        assert!(!dirs.download.join("doc.docx").exists());
    }

    #[test]
    fn test_template_reference_cannot_escape_cache() {
        assert!(cache_relative_path("templates/invoice.docx").is_ok());
        assert!(cache_relative_path("../etc/passwd").is_err());
        assert!(cache_relative_path("/etc/passwd").is_err());
        assert!(cache_relative_path("").is_err());
    }

    #[test]
    fn test_scratch_files_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("a.docx");
        std::fs::write(&kept, b"x").unwrap();
        {
            let mut scratch = ScratchFiles::default();
            scratch.track(&kept);
            scratch.track(dir.path().join("never-created.pdf"));
            assert_eq!(scratch.paths().len(), 2);
        }
        assert!(!kept.exists());
    }
}
