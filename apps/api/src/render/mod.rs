//! Renderer — structured resume text → PDF through a headless engine.
//!
//! Each render gets its own temporary directory and child process. The child
//! is spawned with `kill_on_drop`, so a render that errors, times out or has
//! its future dropped on shutdown never leaves an engine process behind; the
//! directory is removed when the `TempDir` drops on the same paths.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

pub mod html;

pub const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to start render engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("render engine exited with {status}: {stderr}")]
    Engine { status: String, stderr: String },

    #[error("render timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("render engine produced no valid PDF: {0}")]
    InvalidOutput(String),

    #[error("render I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, text: &str) -> Result<Bytes, RenderError>;
}

/// Runs an external HTML → PDF command. `{input}` and `{output}` in the
/// arguments are replaced with the temp file paths.
#[derive(Debug, Clone)]
pub struct HeadlessRenderer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl HeadlessRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Parses a whitespace-separated command line such as
    /// `wkhtmltopdf --quiet {input} {output}`.
    pub fn from_command_line(command: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }
}

#[async_trait]
impl Renderer for HeadlessRenderer {
    async fn render(&self, text: &str) -> Result<Bytes, RenderError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("resume.html");
        let output = workdir.path().join("resume.pdf");
        tokio::fs::write(&input, html::to_html(text)).await?;

        let input_arg = input.to_string_lossy();
        let output_arg = output.to_string_lossy();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", &input_arg)
                    .replace("{output}", &output_arg)
            })
            .collect();

        let child = Command::new(&self.program)
            .args(&args)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        debug!("Render engine started (pid {:?})", child.id());

        // On timeout the wait future is dropped, taking the child with it.
        let result = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Render engine killed after {}ms", self.timeout.as_millis());
                return Err(RenderError::Timeout(self.timeout));
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(RenderError::Engine {
                status: result.status.to_string(),
                stderr: stderr.trim().chars().take(500).collect(),
            });
        }

        let pdf = match tokio::fs::read(&output).await {
            Ok(pdf) => pdf,
            Err(e) => return Err(RenderError::InvalidOutput(format!("missing output file: {e}"))),
        };
        if !pdf.starts_with(PDF_MAGIC) {
            return Err(RenderError::InvalidOutput(
                "output does not start with %PDF".to_string(),
            ));
        }

        debug!("Rendered {} byte PDF", pdf.len());
        Ok(Bytes::from(pdf))
    }
}
