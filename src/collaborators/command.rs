//! Article processor that shells out to an external rewrite command.
//!
//! The command receives the configured args followed by the article URL. Its
//! exit code tells the orchestrator how the attempt went:
//!
//! | Exit code | Outcome |
//! |-----------|---------|
//! | 0 | success |
//! | 2 | network error |
//! | 3 | content extraction failed |
//! | 4 | rewrite failed |
//! | other | unknown error |
//!
//! Spawn failures and timeouts are unknown errors too.

use super::{ArticleProcessor, ProcessingError};
use crate::config::ProcessorConfig;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

/// Map a finished command to a processing outcome.
///
/// `code` is `None` when the process was killed by a signal.
pub fn outcome_from_exit(code: Option<i32>, stderr: &str) -> Result<(), ProcessingError> {
    let detail = truncate_for_log(stderr.trim(), 500);
    match code {
        Some(0) => Ok(()),
        Some(2) => Err(ProcessingError::Network(detail)),
        Some(3) => Err(ProcessingError::ContentExtraction(detail)),
        Some(4) => Err(ProcessingError::Rewrite(detail)),
        Some(code) => Err(ProcessingError::Unknown(format!(
            "exit code {code}: {detail}"
        ))),
        None => Err(ProcessingError::Unknown(format!(
            "terminated by signal: {detail}"
        ))),
    }
}

#[async_trait]
impl ArticleProcessor for CommandProcessor {
    #[instrument(level = "info", skip(self))]
    async fn process(&self, url: &str) -> Result<(), ProcessingError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessingError::Unknown(format!("failed to spawn {}: {e}", self.program)))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ProcessingError::Unknown(e.to_string()))?,
            Err(_) => {
                return Err(ProcessingError::Unknown(format!(
                    "timeout after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            code = ?output.status.code(),
            stdout = %truncate_for_log(&String::from_utf8_lossy(&output.stdout), 200),
            "Processor finished"
        );
        outcome_from_exit(output.status.code(), &stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert!(outcome_from_exit(Some(0), "").is_ok());
        assert!(matches!(
            outcome_from_exit(Some(2), "dns failure"),
            Err(ProcessingError::Network(_))
        ));
        assert!(matches!(
            outcome_from_exit(Some(3), "empty content"),
            Err(ProcessingError::ContentExtraction(_))
        ));
        assert!(matches!(
            outcome_from_exit(Some(4), "model refused"),
            Err(ProcessingError::Rewrite(_))
        ));
        assert!(matches!(
            outcome_from_exit(Some(1), "boom"),
            Err(ProcessingError::Unknown(_))
        ));
        assert!(matches!(outcome_from_exit(None, ""), Err(ProcessingError::Unknown(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_with_url() {
        let ok = CommandProcessor::new("true", vec![], Duration::from_secs(5));
        assert!(ok.process("https://golf.com/news/a").await.is_ok());

        let failing = CommandProcessor::new(
            "sh",
            vec!["-c".to_string(), "echo 'empty content' >&2; exit 3".to_string()],
            Duration::from_secs(5),
        );
        let err = failing.process("https://golf.com/news/a").await.unwrap_err();
        assert!(matches!(err, ProcessingError::ContentExtraction(ref m) if m.contains("empty content")));
    }

    #[tokio::test]
    async fn test_missing_program_is_unknown_error() {
        let p = CommandProcessor::new("definitely-not-a-real-binary-xyz", vec![], Duration::from_secs(5));
        assert!(matches!(
            p.process("https://golf.com/news/a").await,
            Err(ProcessingError::Unknown(_))
        ));
    }
}
