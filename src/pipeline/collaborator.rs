//! Out-of-process collaborator invocation
//!
//! Stage scripts run under a configured interpreter with piped stdio and a
//! hard wall-clock timeout. Stdout carries the result payload; stderr is
//! captured for diagnostics only and never parsed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use log::{error, info, warn};
use tokio::process::Command;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};

/// Runs collaborator scripts out of process
#[derive(Debug, Clone)]
pub struct Collaborator {
    interpreter: String,
    scripts_dir: PathBuf,
    timeout: Duration,
}

impl Collaborator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            scripts_dir: PathBuf::from(&config.scripts_dir),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Run one script to completion and return its trimmed stdout.
    ///
    /// A spawn failure, non-zero exit, or timeout fails the stage. The
    /// child is killed when the timeout fires.
    pub async fn run(&self, stage: &str, script: &str, args: &[String]) -> Result<String> {
        let script_path = self.scripts_dir.join(script);
        info!(
            "Invoking {} collaborator: {} {}",
            stage,
            script_path.display(),
            args.join(" ")
        );

        let child = Command::new(&self.interpreter)
            .arg(&script_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CollaboratorFailed {
                stage: stage.to_string(),
                message: format!("could not spawn {}: {}", script, e),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::CollaboratorFailed {
                    stage: stage.to_string(),
                    message: format!("could not collect output: {}", e),
                });
            }
            Err(_) => {
                error!(
                    "{} collaborator exceeded the {}s wall-clock limit",
                    stage,
                    self.timeout.as_secs()
                );
                return Err(Error::CollaboratorFailed {
                    stage: stage.to_string(),
                    message: format!("timed out after {}s", self.timeout.as_secs()),
                });
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            warn!("{} collaborator stderr: {}", stage, stderr.trim());
        }
        if !output.status.success() {
            error!(
                "{} collaborator failed (exit={:?}): {}",
                stage,
                output.status.code(),
                stderr.trim()
            );
            return Err(Error::CollaboratorFailed {
                stage: stage.to_string(),
                message: format!("exited with {}", output.status),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
