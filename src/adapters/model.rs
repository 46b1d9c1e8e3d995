//! Forecast model run as a subprocess.
//!
//! The configured program receives the `ForecastRequest` as JSON on
//! stdin and must print the forecast product as JSON on stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{ForecastModel, ForecastRequest};

/// Model command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Executable to run
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// Per-run timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    600
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Forecast model backed by an external executable
pub struct CommandForecastModel {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandForecastModel {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let program = settings
            .command
            .clone()
            .context("forecast.model.command is not configured")?;
        Ok(Self::new(
            program,
            settings.args.clone(),
            Duration::from_secs(settings.timeout_secs),
        ))
    }
}

#[async_trait]
impl ForecastModel for CommandForecastModel {
    async fn compute(&self, request: &ForecastRequest) -> Result<Value> {
        let input = serde_json::to_vec(request).context("Failed to serialize forecast request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn forecast model '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .context("Failed to write to forecast model stdin")?;
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "Forecast model timed out after {:?} for {}",
                    self.timeout, request.event_id
                )
            })?
            .context("Failed to wait for forecast model")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Forecast model failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("Forecast model output is not valid JSON")
    }
}
