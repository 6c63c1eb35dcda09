//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::path::PathBuf;
use std::time::Duration;

/// Log filter when neither `RUST_LOG` nor `--debug` says otherwise.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Log filter selected by `--debug`.
pub const DEBUG_LOG_FILTER: &str = "debug";

/// Directory under the user config dir holding `config.toml`.
pub const CONFIG_DIR_NAME: &str = "unionfs";

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// How long a `--mount` command gets to publish its tree.
pub const MOUNTEE_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Mode for files created by `touch`.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Mode for directories created by `mkdir`.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Bytes requested per read when copying a file out.
pub const READ_CHUNK: u32 = 64 * 1024;

/// `~/.config/unionfs/config.toml`, or wherever the platform keeps it.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Per-process directory a `--mount` command publishes its tree at.
pub fn default_mountee_dir() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(format!("unionfs-{}", std::process::id()))
        .join("mountee")
}
