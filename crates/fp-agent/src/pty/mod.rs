//! Pseudo-terminal shells

mod manager;

pub use manager::{validate_shell_path, PtyManager};
