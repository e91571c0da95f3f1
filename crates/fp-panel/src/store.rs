//! Durable state under the data directory
//!
//! Whole documents (`nodes.json`, `jobs.json`) are replaced through a temp
//! file and rename. Metric history and the audit log are JSON lines, appended
//! in place. A store opened with [`Store::in_memory`] keeps nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use fp_core::PanelError;

pub const NODES_FILE: &str = "nodes.json";
pub const JOBS_FILE: &str = "jobs.json";
pub const AUDIT_FILE: &str = "audit.log";
pub const METRICS_DIR: &str = "metrics";

pub struct Store {
    root: Option<PathBuf>,
}

impl Store {
    /// Open (and create) a store rooted at `dir`
    pub fn open(dir: &Path) -> Result<Self, PanelError> {
        fs::create_dir_all(dir.join(METRICS_DIR)).map_err(|e| {
            PanelError::Storage(format!("cannot create data dir {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            root: Some(dir.to_path_buf()),
        })
    }

    pub fn in_memory() -> Self {
        Self { root: None }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Read a JSON document; missing files read as `T::default()`
    pub fn load_json<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(T::default());
        };
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PanelError::Storage(format!("corrupt {}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(storage_err(&path, e)),
        }
    }

    /// Replace a JSON document atomically
    pub fn save_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|e| PanelError::Storage(format!("cannot encode {}: {}", name, e)))?;
        replace_file(&path, &bytes)
    }

    /// Append one JSON line
    pub fn append_line<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(value)
            .map_err(|e| PanelError::Storage(format!("cannot encode {}: {}", name, e)))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| storage_err(&path, e))?;
        file.write_all(&line).map_err(|e| storage_err(&path, e))
    }

    /// Read all JSON lines, skipping lines that do not parse
    pub fn read_lines<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(Vec::new());
        };
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(&path, e)),
        };

        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| storage_err(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(value) => out.push(value),
                Err(e) => tracing::warn!(
                    "Skipping unreadable line {} of {}: {}",
                    idx + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(out)
    }

    /// Replace a JSON-lines file with `values`
    pub fn rewrite_lines<T: Serialize>(&self, name: &str, values: &[T]) -> Result<(), PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        let mut buf = Vec::new();
        for value in values {
            serde_json::to_writer(&mut buf, value)
                .map_err(|e| PanelError::Storage(format!("cannot encode {}: {}", name, e)))?;
            buf.push(b'\n');
        }
        replace_file(&path, &buf)
    }

    pub fn remove(&self, name: &str) -> Result<(), PanelError> {
        let Some(path) = self.path(name) else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(&path, e)),
        }
    }

    /// Relative name of a node's metric history file
    pub fn metrics_file(node_id: &str) -> String {
        let safe: String = node_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}/{}.jsonl", METRICS_DIR, safe)
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(name))
    }
}

fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), PanelError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| storage_err(&tmp, e))?;
        file.write_all(bytes).map_err(|e| storage_err(&tmp, e))?;
        file.sync_all().map_err(|e| storage_err(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| storage_err(path, e))
}

fn storage_err(path: &Path, e: std::io::Error) -> PanelError {
    PanelError::Storage(format!("{}: {}", path.display(), e))
}
