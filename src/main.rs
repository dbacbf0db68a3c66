//! Document Generation Worker Service
//!
//! Polls an SQS queue for document generation requests, renders each request from a
//! `.docx` template, converts it to PDF, uploads it to S3 and registers it with the
//! document management service.
//!
//! ## Architecture
//!
//! - **Queue**: SQS, long-polled with adaptive wait time
//! - **Dedup lock**: Redis `SET NX EX` keyed by message id
//! - **Renderer**: minijinja over the template package, barcodes via `zint`
//! - **Converter**: `unoconvert` external process
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! See `config.rs` for the environment variables read at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docgen_worker::auth::{ClientCredentialsRefresher, CredentialRefresher};
use docgen_worker::cleanup::LocalCleanup;
use docgen_worker::config::WorkerConfig;
use docgen_worker::converter::UnoconvertConverter;
use docgen_worker::docx::DocxTemplateEngine;
use docgen_worker::gate::ConcurrencyGate;
use docgen_worker::lock::{DedupGate, RedisLockStore};
use docgen_worker::pipeline::ConversionPipeline;
use docgen_worker::queue::SqsQueue;
use docgen_worker::registration::HttpDocumentRegistry;
use docgen_worker::renderer::{TemplateRenderer, ZintBarcodeWriter};
use docgen_worker::retry::RetryingRegistrar;
use docgen_worker::storage::S3BlobStore;
use docgen_worker::telemetry;
use docgen_worker::worker::QueueWorker;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("Failed to load configuration")?;

    // Initialize tracing
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    if config.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry(&config.otlp_endpoint, &config.service_name) {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!(
        queue = %config.queue_name,
        bucket = %config.bucket,
        concurrency = config.concurrency,
        registration = config.document_management_url.is_some(),
        "Starting document generation worker"
    );

    for dir in config.scratch_dirs() {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create scratch directory {}", dir.display()))?;
    }

    // AWS clients share one SDK configuration
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.aws_region {
        loader = loader.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.aws_endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(config.aws_endpoint_url.is_some())
        .build();

    let queue = Arc::new(SqsQueue::new(
        aws_sdk_sqs::Client::new(&sdk_config),
        &config.queue_name,
    ));
    let blob_store = Arc::new(S3BlobStore::new(aws_sdk_s3::Client::from_conf(s3_config)));
    let lock_store = Arc::new(RedisLockStore::new(&config.redis_url)?);

    let renderer = Arc::new(TemplateRenderer::new(
        Arc::new(DocxTemplateEngine::new()),
        Arc::new(ZintBarcodeWriter::new(&config.barcode_command)),
        &config.barcodes_dir,
    ));
    let converter = Arc::new(UnoconvertConverter::new(&config.converter_command));

    let mut pipeline = ConversionPipeline::new(
        blob_store,
        renderer,
        converter,
        &config.bucket,
        &config.download_dir,
        &config.converted_dir,
    );

    if let Some(url) = &config.document_management_url {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let refresher = config.credentials.as_ref().map(|credentials| {
            Arc::new(ClientCredentialsRefresher::new(
                http.clone(),
                &credentials.url,
                &credentials.application_id,
                &credentials.application_secret,
            )) as Arc<dyn CredentialRefresher>
        });
        let registry = Arc::new(HttpDocumentRegistry::new(http, url));
        pipeline = pipeline.with_registrar(Arc::new(RetryingRegistrar::new(registry, refresher)));
    }

    let mut worker = QueueWorker::new(
        queue,
        DedupGate::new(lock_store, config.lock_ttl),
        ConcurrencyGate::new(config.concurrency),
        Arc::new(pipeline),
        LocalCleanup::new(config.template_cache_dir()),
        config.worker_settings(),
    );

    // Cancel polling on Ctrl+C
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, finishing in-flight messages..."),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        signal_token.cancel();
    });

    info!("Worker service ready, press Ctrl+C to shutdown");
    worker.run(shutdown).await;

    info!("Worker service shutdown complete");
    Ok(())
}
