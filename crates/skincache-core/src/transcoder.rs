//! Binary <-> structured document conversion through the external converter.
//!
//! The converter is invoked as `<tool> <input> -o json|bin` and writes its
//! result next to the input with the extension swapped. This module is the
//! only place that shells out for conversion.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ToolConfig;
use crate::document::StructuredDocument;
use crate::error::{Result, SkinCacheError};
use crate::process::{run_with_deadline, ToolInvocation, ToolRunError};

/// Converts payloads between binary and structured form.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Decode `binary_path`; the structured form is also left on disk as
    /// `<stem>.json`.
    async fn decode(&self, binary_path: &Path) -> Result<StructuredDocument>;

    /// Encode the document at `document_path`, returning the `<stem>.bin` path.
    async fn encode(&self, document_path: &Path) -> Result<PathBuf>;
}

/// [`Transcoder`] backed by the external converter tool.
pub struct ExternalTranscoder {
    tool: ToolConfig,
}

impl ExternalTranscoder {
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }

    async fn convert(&self, input: &Path, format: &str) -> Result<PathBuf> {
        let output_path = input.with_extension(format);
        // Only a file written by this invocation counts as its output.
        if let Err(e) = tokio::fs::remove_file(&output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        let invocation = ToolInvocation::new(&self.tool)
            .arg(input.as_os_str())
            .arg("-o")
            .arg(format);

        let output = run_with_deadline(&invocation, self.tool.timeout())
            .await
            .map_err(|e| match e {
                ToolRunError::TimedOut { timeout, .. } => SkinCacheError::TranscodeTimeout {
                    path: input.display().to_string(),
                    timeout_secs: timeout.as_secs(),
                },
                other => SkinCacheError::TranscodeFailed {
                    path: input.display().to_string(),
                    exit_code: -1,
                    diagnostics: other.to_string(),
                },
            })?;

        if !output.success() {
            return Err(SkinCacheError::TranscodeFailed {
                path: input.display().to_string(),
                exit_code: output.exit_code,
                diagnostics: output.diagnostics(),
            });
        }
        if !tokio::fs::try_exists(&output_path).await? {
            return Err(SkinCacheError::TranscodeFailed {
                path: input.display().to_string(),
                exit_code: output.exit_code,
                diagnostics: format!("converter produced no {}", output_path.display()),
            });
        }

        debug!(
            input = %input.display(),
            format = format,
            duration_ms = output.duration_ms,
            "Converted payload"
        );
        Ok(output_path)
    }
}

#[async_trait]
impl Transcoder for ExternalTranscoder {
    async fn decode(&self, binary_path: &Path) -> Result<StructuredDocument> {
        let json_path = self.convert(binary_path, "json").await?;
        StructuredDocument::load(&json_path).await
    }

    async fn encode(&self, document_path: &Path) -> Result<PathBuf> {
        let bin_path = self.convert(document_path, "bin").await?;
        info!(path = %bin_path.display(), "Encoded document");
        Ok(bin_path)
    }
}
