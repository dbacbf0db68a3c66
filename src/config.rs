//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::pipeline::TEMPLATE_CACHE_DIR;
use crate::worker::WorkerSettings;

/// Invalid or missing configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Client-credentials settings for refreshing the registration token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialsConfig {
    pub url: String,
    pub application_id: String,
    pub application_secret: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub bucket: String,
    pub destination_prefix: String,
    pub aws_region: Option<String>,
    pub aws_endpoint_url: Option<String>,
    pub max_wait_time: Duration,
    pub max_messages: i32,
    pub visibility_timeout: Duration,
    pub lock_ttl: Duration,
    pub concurrency: usize,
    pub redis_url: String,
    pub download_dir: PathBuf,
    pub converted_dir: PathBuf,
    pub barcodes_dir: PathBuf,
    /// Registration is disabled when unset.
    pub document_management_url: Option<String>,
    /// Token refresh is disabled when unset.
    pub credentials: Option<CredentialsConfig>,
    pub converter_command: String,
    pub barcode_command: String,
    pub json_logs: bool,
    pub otlp_endpoint: String,
    pub service_name: String,
}

impl WorkerConfig {
    /// Loads configuration from the process environment, after reading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let queue_name = get("AWS_GENERATOR_QUEUE").ok_or(ConfigError::Missing("AWS_GENERATOR_QUEUE"))?;
        let bucket = get("S3_BUCKET")
            .ok_or(ConfigError::Missing("S3_BUCKET"))?
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();

        let redis_url = match get("REDIS_URL") {
            Some(url) => url,
            None => match get("REDIS_HOST") {
                Some(host) => format!(
                    "redis://{}:{}/",
                    host,
                    get("REDIS_PORT").unwrap_or_else(|| "6379".to_string())
                ),
                None => "redis://127.0.0.1/".to_string(),
            },
        };

        let concurrency_var = if get("WORKER_CONCURRENCY").is_some() {
            "WORKER_CONCURRENCY"
        } else {
            "NUMBER_OF_PROCESSES"
        };

        let credentials = get("AUTH2_URL").map(|url| CredentialsConfig {
            url,
            application_id: get("PDF_WORKER_ID").unwrap_or_default(),
            application_secret: get("PDF_WORKER_SECRET").unwrap_or_default(),
        });

        Ok(Self {
            queue_name,
            bucket,
            destination_prefix: get("S3_SUBFOLDER").unwrap_or_else(|| "pdf/".to_string()),
            aws_region: get("AWS_REGION"),
            aws_endpoint_url: get("AWS_ENDPOINT_URL"),
            max_wait_time: Duration::from_secs(parse_or(&get, "TIME_POLLING", 20)?),
            max_messages: parse_or(&get, "MAX_NUMBER_OF_MESSAGES", 10)?,
            visibility_timeout: Duration::from_secs(parse_or(&get, "VISIBILITY_TIMEOUT", 30)?),
            lock_ttl: Duration::from_secs(parse_or(&get, "CACHE_TIMEOUT", 60)?),
            concurrency: parse_or(&get, concurrency_var, 4)?,
            redis_url,
            download_dir: get("DOWNLOAD_FOLDER")
                .unwrap_or_else(|| "/tmp/docgen/download_files".to_string())
                .into(),
            converted_dir: get("CONVERTED_FOLDER")
                .unwrap_or_else(|| "/tmp/docgen/converted_files".to_string())
                .into(),
            barcodes_dir: get("BARCODES_FOLDER")
                .unwrap_or_else(|| "/tmp/docgen/barcodes".to_string())
                .into(),
            document_management_url: get("DOCUMENT_MANAGEMENT_URL"),
            credentials,
            converter_command: get("CONVERTER_COMMAND").unwrap_or_else(|| "unoconvert".to_string()),
            barcode_command: get("BARCODE_COMMAND").unwrap_or_else(|| "zint".to_string()),
            json_logs: get("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| "http://localhost:4317".to_string()),
            service_name: get("OTEL_SERVICE_NAME").unwrap_or_else(|| "docgen-worker".to_string()),
        })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_messages: self.max_messages,
            visibility_timeout: self.visibility_timeout,
            max_wait_time: self.max_wait_time,
            destination_prefix: self.destination_prefix.clone(),
        }
    }

    /// Directory of cached templates.
    pub fn template_cache_dir(&self) -> PathBuf {
        self.download_dir.join(TEMPLATE_CACHE_DIR)
    }

    /// Every scratch directory the worker writes to.
    pub fn scratch_dirs(&self) -> [PathBuf; 4] {
        [
            self.download_dir.clone(),
            self.template_cache_dir(),
            self.converted_dir.clone(),
            self.barcodes_dir.clone(),
        ]
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: e.to_string(),
        }),
    }
}
