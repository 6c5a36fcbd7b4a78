//! The spawned engine binary, modeled as a scoped resource.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;
use tunnelrank_core::{RankError, Result};

/// A running engine process. `kill_on_drop` backs the explicit [`shutdown`],
/// so the child cannot outlive the probe even on an early return.
///
/// [`shutdown`]: EngineProcess::shutdown
pub(crate) struct EngineProcess {
    child: Child,
}

impl EngineProcess {
    /// Spawn `<bin> run -config=<path>` with piped output. Both streams are
    /// line-forwarded to debug logs from detached tasks; an engine that
    /// never logs is fine.
    pub(crate) fn launch(bin: &Path, config_path: &Path, label: &str) -> Result<Self> {
        let mut child = Command::new(bin)
            .arg("run")
            .arg(format!("-config={}", config_path.display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RankError::EngineLaunch(format!("spawn {}: {e}", bin.display())))?;

        if let Some(out) = child.stdout.take() {
            tokio::spawn(forward_lines(out, label.to_string(), "stdout"));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(forward_lines(err, label.to_string(), "stderr"));
        }

        Ok(Self { child })
    }

    /// Terminate the engine. Kill failures are swallowed: by the time we
    /// get here the probe's outcome is already decided.
    pub(crate) async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "engine kill failed");
        }
        let _ = timeout(Duration::from_secs(1), self.child.wait()).await;
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, label: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            debug!(label = label.as_str(), stream, "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn launch_fails_cleanly_for_missing_binary() {
        let err = EngineProcess::launch(
            &PathBuf::from("/nonexistent/engine-binary"),
            &PathBuf::from("/tmp/whatever.json"),
            "x",
        )
        .err()
        .unwrap();
        assert!(matches!(err, RankError::EngineLaunch(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_terminates_a_live_child_promptly() {
        let child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let engine = EngineProcess { child };
        // A sleeping child must not hold shutdown for anywhere near 30s.
        timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .expect("shutdown did not return promptly");
    }
}
