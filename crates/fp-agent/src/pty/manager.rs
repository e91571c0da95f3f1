//! PTY shells on this node
//!
//! One pseudo-terminal per tunnel stream, via portable-pty. The reader half
//! is handed out to a blocking task; writes, resizes and teardown go through
//! the manager.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, PtySystem};

use fp_protocol::{StreamId, TerminalSize};

/// Shells accepted without an `/etc/shells` entry
const KNOWN_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/dash",
    "/bin/ash",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/dash",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
];

/// Resolve a requested shell to an allowed, existing absolute path
pub fn validate_shell_path(shell: &str) -> Result<String> {
    let listed = KNOWN_SHELLS.contains(&shell)
        || std::fs::read_to_string("/etc/shells")
            .map(|shells| {
                shells
                    .lines()
                    .map(str::trim)
                    .any(|line| !line.starts_with('#') && line == shell)
            })
            .unwrap_or(false);

    if !listed {
        anyhow::bail!("Shell '{}' is not an allowed login shell", shell);
    }
    if !Path::new(shell).exists() {
        anyhow::bail!("Shell '{}' does not exist", shell);
    }
    Ok(shell.to_string())
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn Write + Send>,
}

/// Live PTY shells keyed by tunnel stream
pub struct PtyManager {
    pty_system: Box<dyn PtySystem + Send>,
    sessions: HashMap<StreamId, PtySession>,
    default_shell: String,
    default_env: Vec<(String, String)>,
}

impl PtyManager {
    pub fn new(default_shell: String, default_env: Vec<(String, String)>) -> Self {
        Self {
            pty_system: native_pty_system(),
            sessions: HashMap::new(),
            default_shell,
            default_env,
        }
    }

    /// Spawn a shell for `stream_id`. Returns its pid and the PTY reader.
    pub fn open(
        &mut self,
        stream_id: StreamId,
        shell: Option<String>,
        env: Vec<(String, String)>,
        size: TerminalSize,
    ) -> Result<(u32, Box<dyn Read + Send>)> {
        if self.sessions.contains_key(&stream_id) {
            anyhow::bail!("Stream {} already has a shell", stream_id);
        }

        let requested = shell.unwrap_or_else(|| self.default_shell.clone());
        let shell_path = validate_shell_path(&requested)
            .with_context(|| format!("Invalid shell requested: {}", requested))?;

        tracing::info!(
            "Opening {} on {} ({}x{})",
            shell_path,
            stream_id,
            size.cols,
            size.rows
        );

        let pair = self
            .pty_system
            .openpty(pty_size(size))
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(&shell_path);
        for (key, value) in self.default_env.iter().chain(env.iter()) {
            cmd.env(key, value);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("Failed to spawn shell: {}", shell_path))?;
        // The child holds its own slave handle
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let reader = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")?;
        let writer = pair.master.take_writer().context("Failed to take PTY writer")?;

        self.sessions.insert(
            stream_id,
            PtySession {
                master: pair.master,
                child,
                writer,
            },
        );
        tracing::debug!("Shell on {} has pid {}", stream_id, pid);
        Ok((pid, reader))
    }

    pub fn write(&mut self, stream_id: StreamId, data: &[u8]) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or_else(|| anyhow::anyhow!("No shell on {}", stream_id))?;
        session
            .writer
            .write_all(data)
            .context("Failed to write to PTY")?;
        session.writer.flush().context("Failed to flush PTY")?;
        Ok(())
    }

    pub fn resize(&mut self, stream_id: StreamId, size: TerminalSize) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&stream_id)
            .ok_or_else(|| anyhow::anyhow!("No shell on {}", stream_id))?;
        session
            .master
            .resize(pty_size(size))
            .context("Failed to resize PTY")
    }

    /// Exit code if the shell on `stream_id` has exited
    pub fn try_wait(&mut self, stream_id: StreamId) -> Option<i32> {
        let session = self.sessions.get_mut(&stream_id)?;
        match session.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code() as i32),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to check shell on {}: {}", stream_id, e);
                None
            }
        }
    }

    /// Kill and reap the shell. `None` if there was none or its status is
    /// unknown.
    pub fn close(&mut self, stream_id: StreamId) -> Option<i32> {
        let mut session = self.sessions.remove(&stream_id)?;
        if let Ok(Some(status)) = session.child.try_wait() {
            return Some(status.exit_code() as i32);
        }
        let _ = session.child.kill();
        session
            .child
            .wait()
            .ok()
            .map(|status| status.exit_code() as i32)
    }

    pub fn contains(&self, stream_id: StreamId) -> bool {
        self.sessions.contains_key(&stream_id)
    }

    pub fn streams(&self) -> Vec<StreamId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
