//! Rendered document to PDF conversion through an external converter process.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::error::WorkerError;
use crate::job::OUTPUT_FORMAT;

/// Converts a rendered document into the distributable format.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Converts `source`, returning the path of the converted file.
    async fn convert(&self, source: &Path) -> Result<PathBuf, WorkerError>;
}

/// PDF converter driving `unoconvert` (or a compatible command line).
///
/// The converted file is written next to the source with a `.pdf` extension.
pub struct UnoconvertConverter {
    program: String,
}

impl UnoconvertConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path the converter writes for `source`.
    pub fn output_path(source: &Path) -> PathBuf {
        source.with_extension(OUTPUT_FORMAT)
    }
}

impl Default for UnoconvertConverter {
    fn default() -> Self {
        Self::new("unoconvert")
    }
}

#[async_trait]
impl FormatConverter for UnoconvertConverter {
    /// Runs `{program} --convert-to pdf <source> <output>`.
    ///
    /// # Errors
    ///
    /// - the program cannot be started
    /// - the program exits with a non-zero status
    /// - the program exits cleanly but leaves no output file
    async fn convert(&self, source: &Path) -> Result<PathBuf, WorkerError> {
        let output_path = Self::output_path(source);
        info!(source = %source.display(), output = %output_path.display(), "Converting document to PDF");

        let output = Command::new(&self.program)
            .arg("--convert-to")
            .arg(OUTPUT_FORMAT)
            .arg(source)
            .arg(&output_path)
            .output()
            .await
            .map_err(|e| WorkerError::Conversion(format!("could not run {}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = ?output.status, stderr = %stderr.trim(), "Converter exited with failure");
            return Err(WorkerError::Conversion(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            return Err(WorkerError::Conversion(format!(
                "{} produced no output at {}",
                self.program,
                output_path.display()
            )));
        }

        Ok(output_path)
    }
}
