//! Outbound secure-shell capability

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PanelError;

/// How to authenticate to a node
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
}

impl SshTarget {
    /// `user@host:port`, safe for logs
    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the channel closed without reporting a status
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable summary for diagnostics
    pub fn summary(&self, lines: usize) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        let mut out = format!("exit code {}", code);
        let stdout = tail_lines(&self.stdout, lines);
        let stderr = tail_lines(&self.stderr, lines);
        if !stdout.is_empty() {
            out.push_str("\nstdout:\n");
            out.push_str(&stdout);
        }
        if !stderr.is_empty() {
            out.push_str("\nstderr:\n");
            out.push_str(&stderr);
        }
        out
    }
}

/// Last `lines` non-empty lines of `text`
pub fn tail_lines(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}

/// Opens authenticated sessions to nodes
#[async_trait]
pub trait SecureShell: Send + Sync {
    /// Connect and authenticate within `timeout`.
    ///
    /// Rejected credentials are `AuthFailure`; unreachable hosts are
    /// `Unreachable` or `Timeout`.
    async fn connect(
        &self,
        target: &SshTarget,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, PanelError>;
}

/// An open, authenticated session
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command to completion, capturing stdout and stderr
    async fn exec(&self, command: &str) -> Result<CommandOutput, PanelError>;

    /// Write `content` to `path` with the given permission bits
    async fn upload(&self, path: &str, content: Bytes, mode: u32) -> Result<(), PanelError>;

    async fn close(&self) -> Result<(), PanelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_redacted() {
        let target = SshTarget {
            host: "10.0.0.2".into(),
            port: 22,
            user: "root".into(),
            auth: SshAuth::Password("hunter2".into()),
        };
        let debug = format!("{:?}", target);
        assert!(!debug.contains("hunter2"));
        assert_eq!(target.display(), "root@10.0.0.2:22");
    }

    #[test]
    fn summary_keeps_the_tail() {
        let output = CommandOutput {
            stdout: "a\nb\n\nc\n".into(),
            stderr: "boom\n".into(),
            exit_code: Some(2),
        };
        assert!(!output.success());
        assert_eq!(tail_lines(&output.stdout, 2), "b\nc");
        let summary = output.summary(2);
        assert!(summary.starts_with("exit code 2"));
        assert!(summary.contains("boom"));
    }
}
