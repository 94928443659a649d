//! Summarizer that shells out to an external command.
//!
//! The article text is piped to the command's stdin; the command prints a JSON
//! object `{"categories": [...], "tags": [...], "summary": "...", "model_name": "..."}`
//! on stdout.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Summarizer, SummaryOutput};

/// Configuration for the command summarizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Program to run (default: "summarize")
    #[serde(default = "default_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Per-call timeout in seconds (default: 120)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_command() -> String {
    "summarize".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Summarizer backed by a subprocess
pub struct CommandSummarizer {
    command: String,
    args: Vec<String>,
    call_timeout: Duration,
}

impl CommandSummarizer {
    pub fn new(config: &SummarizerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            call_timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    async fn run(&self, input: &str) -> Result<String> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn summarizer '{}'", self.command))?;

        // Feed stdin from its own task so a child that never reads cannot
        // hold the call past the timeout
        let stdin = child.stdin.take();
        let input = input.as_bytes().to_vec();
        let command = self.command.clone();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(command = %command, error = %e, "Summarizer stdin closed early");
                }
                // Dropping stdin signals EOF
            }
        });

        let waited = timeout(self.call_timeout, child.wait_with_output()).await;
        writer.abort();

        let output = waited
            .with_context(|| {
                format!(
                    "Summarizer '{}' timed out after {:?}",
                    self.command, self.call_timeout
                )
            })?
            .with_context(|| format!("Failed to wait for summarizer '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Summarizer '{}' failed with exit code {}: {}",
                self.command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("Summarizer output is not valid UTF-8")
    }
}

/// Parse and validate summarizer stdout
pub fn parse_summary(stdout: &str) -> Result<SummaryOutput> {
    let output: SummaryOutput =
        serde_json::from_str(stdout.trim()).context("Summarizer output is not the expected JSON")?;

    if output.summary.trim().is_empty() {
        anyhow::bail!("Summarizer returned an empty summary");
    }

    Ok(output)
}

#[async_trait]
impl Summarizer for CommandSummarizer {
    fn name(&self) -> &str {
        &self.command
    }

    async fn summarize(&self, text: &str) -> Result<SummaryOutput> {
        let stdout = self.run(text).await?;
        parse_summary(&stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary() {
        let out = parse_summary(
            r#"{"categories":["backend"],"tags":["rust","kafka"],"summary":"Short.","model_name":"m1"}"#,
        )
        .unwrap();
        assert_eq!(out.categories, vec!["backend"]);
        assert_eq!(out.tags.len(), 2);
        assert_eq!(out.model_name.as_deref(), Some("m1"));
    }

    #[test]
    fn test_empty_summary_rejected() {
        assert!(parse_summary(r#"{"summary":"   "}"#).is_err());
        assert!(parse_summary("not json").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_with_stdin() {
        let summarizer = CommandSummarizer::new(&SummarizerConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"cat > /dev/null; echo '{"summary":"ok","tags":["t"]}'"#.to_string(),
            ],
            timeout_secs: 10,
        });
        let out = summarizer.summarize("some article text").await.unwrap();
        assert_eq!(out.summary, "ok");
        assert_eq!(out.tags, vec!["t"]);
        assert!(out.categories.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_covers_unread_stdin() {
        let summarizer = CommandSummarizer::new(&SummarizerConfig {
            command: "sleep".to_string(),
            args: vec!["30".to_string()],
            timeout_secs: 1,
        });
        // Larger than any pipe buffer, and `sleep` never reads it
        let input = "x".repeat(1 << 20);

        let started = std::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), summarizer.summarize(&input))
            .await
            .expect("summarizer ignored its timeout");
        let err = result.unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let summarizer = CommandSummarizer::new(&SummarizerConfig {
            command: "/nonexistent/summarizer-binary".to_string(),
            ..SummarizerConfig::default()
        });
        assert!(summarizer.summarize("x").await.is_err());
    }
}
