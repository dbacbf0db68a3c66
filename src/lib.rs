//! Document Generation Worker Library
//!
//! Core of the document generation worker: a queue polling loop that claims each
//! message through a distributed lock, bounds concurrent work, and runs every message
//! through a render, convert, upload and register pipeline.
//!
//! ## Module Overview
//!
//! - `worker`: polling loop, adaptive poll mode, per-message dispatch
//! - `lock`: dedup gate over Redis (or in-memory) set-if-absent locks
//! - `gate`: per-process concurrency gate
//! - `pipeline`: the conversion pipeline and scratch-file cleanup
//! - `renderer` / `docx`: content preparation and `.docx` template rendering
//! - `converter`: external PDF conversion
//! - `registration` / `retry` / `auth`: document registration with retry and token refresh
//! - `queue` / `storage`: SQS and S3 clients behind traits
//! - `message` / `job`: validated messages, requests and results
//! - `config`, `error`, `telemetry`, `cleanup`
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use docgen_worker::cleanup::LocalCleanup;
//! use docgen_worker::converter::UnoconvertConverter;
//! use docgen_worker::docx::DocxTemplateEngine;
//! use docgen_worker::gate::ConcurrencyGate;
//! use docgen_worker::lock::{DedupGate, MemoryLockStore};
//! use docgen_worker::pipeline::ConversionPipeline;
//! use docgen_worker::queue::SqsQueue;
//! use docgen_worker::renderer::{TemplateRenderer, ZintBarcodeWriter};
//! use docgen_worker::storage::S3BlobStore;
//! use docgen_worker::worker::{QueueWorker, WorkerSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//!
//!     let renderer = TemplateRenderer::new(
//!         Arc::new(DocxTemplateEngine::new()),
//!         Arc::new(ZintBarcodeWriter::new("zint")),
//!         "/tmp/docgen/barcodes",
//!     );
//!     let pipeline = ConversionPipeline::new(
//!         Arc::new(S3BlobStore::new(aws_sdk_s3::Client::new(&aws))),
//!         Arc::new(renderer),
//!         Arc::new(UnoconvertConverter::default()),
//!         "documents",
//!         "/tmp/docgen/download_files",
//!         "/tmp/docgen/converted_files",
//!     );
//!
//!     let mut worker = QueueWorker::new(
//!         Arc::new(SqsQueue::new(aws_sdk_sqs::Client::new(&aws), "docgen-requests")),
//!         DedupGate::new(Arc::new(MemoryLockStore::new()), Duration::from_secs(60)),
//!         ConcurrencyGate::new(4),
//!         Arc::new(pipeline),
//!         LocalCleanup::new("/tmp/docgen/download_files/temporal"),
//!         WorkerSettings::default(),
//!     );
//!
//!     // Process a single poll iteration
//!     worker.poll_once().await;
//!     worker.wait_idle().await;
//! }
//! ```

pub mod auth;
pub mod cleanup;
pub mod config;
pub mod converter;
pub mod docx;
pub mod error;
pub mod gate;
pub mod job;
pub mod lock;
pub mod message;
pub mod pipeline;
pub mod queue;
pub mod registration;
pub mod renderer;
pub mod retry;
pub mod storage;
pub mod telemetry;
pub mod worker;
