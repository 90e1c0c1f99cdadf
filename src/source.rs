use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info};

use crate::error::SourceError;

/// Longest stderr excerpt carried in an error.
const STDERR_SNIPPET: usize = 200;

/// Executes commands and reads files on behalf of the poller.
///
/// Every call is bounded by `timeout`; expiry is reported as [`SourceError::Timeout`].
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn run_command(&self, argv: &[String], timeout: Duration) -> Result<String, SourceError>;

    async fn read_file(&self, path: &Path, timeout: Duration) -> Result<String, SourceError>;
}

/// Reader backed by real child processes and the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemReader;

#[async_trait]
impl SourceReader for SystemReader {
    async fn run_command(&self, argv: &[String], timeout: Duration) -> Result<String, SourceError> {
        let command = shell_join(argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(SourceError::Spawn {
                command,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SourceError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = match time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(SourceError::Spawn { command, source }),
            Err(_) => {
                return Err(SourceError::Timeout {
                    what: command,
                    after: timeout,
                })
            }
        };

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.len() > STDERR_SNIPPET {
                let mut cut = STDERR_SNIPPET;
                while !stderr.is_char_boundary(cut) {
                    cut -= 1;
                }
                stderr.truncate(cut);
            }
            return Err(SourceError::Exit {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!(%command, bytes = output.stdout.len(), "command finished");
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_file(&self, path: &Path, timeout: Duration) -> Result<String, SourceError> {
        match time::timeout(timeout, tokio::fs::read_to_string(path)).await {
            Ok(Ok(s)) => Ok(s),
            Ok(Err(source)) => Err(SourceError::Read {
                path: path.display().to_string(),
                source,
            }),
            Err(_) => Err(SourceError::Timeout {
                what: path.display().to_string(),
                after: timeout,
            }),
        }
    }
}

/// Run `argv` through the escalation prefix, e.g. `su -c "ip neigh show"`.
///
/// Any failure other than a timeout comes back as [`SourceError::PrivilegeDenied`].
pub async fn run_privileged(
    reader: &dyn SourceReader,
    escalate: &[String],
    argv: &[String],
    timeout: Duration,
) -> Result<String, SourceError> {
    let mut full = escalate.to_vec();
    full.push(shell_join(argv));
    reader
        .run_command(&full, timeout)
        .await
        .map_err(SourceError::into_privileged)
}

/// Check once whether the escalation prefix yields a root shell.
pub async fn probe_privilege(reader: &dyn SourceReader, escalate: &[String], timeout: Duration) -> bool {
    let id = vec!["id".to_string(), "-u".to_string()];
    match run_privileged(reader, escalate, &id, timeout).await {
        Ok(out) => {
            let available = out.trim() == "0";
            info!(available, "privileged execution probe finished");
            available
        }
        Err(e) => {
            info!(error = %e, "privileged execution unavailable");
            false
        }
    }
}

/// Join argv into one `sh`-compatible string, single-quoting words that need it.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            let plain = !a.is_empty()
                && a.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
            if plain {
                a.clone()
            } else {
                format!("'{}'", a.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
