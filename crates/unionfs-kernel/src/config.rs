//! Union configuration files.
//!
//! ```toml
//! cache_size = 512
//! underlying = true
//! underlying_dir = "/srv/root"
//!
//! [[backend]]
//! path = "~/layers/base"
//!
//! [[backend]]
//! path = "~/layers/scratch"
//! writable = true
//! priority = 10
//!
//! [[stow]]
//! dir = "/usr/local/stow"
//! match = ["bin", "lib*"]
//!
//! [mount]
//! command = "my-fs-server --flag"
//! dir = "/run/unionfs/mountee"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache::DEFAULT_CACHE_SIZE;
use crate::chain::{Chain, DEFAULT_PRIORITY};
use crate::pattern::PatternList;
use crate::stow::StowDir;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// One statically configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub priority: i32,
}

/// A stow directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StowConfig {
    pub dir: PathBuf,
    #[serde(default, rename = "match")]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub priority: i32,
}

/// An external backend started as a child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub command: String,
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub writable: bool,
    #[serde(default)]
    pub priority: i32,
    /// Merge the published tree into the union.
    #[serde(default = "default_true")]
    pub merge: bool,
}

fn default_true() -> bool {
    true
}

/// Top-level union configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnionConfig {
    pub cache_size: usize,
    pub debug: bool,
    /// Include the translator's own underlying directory.
    pub underlying: bool,
    /// Where the underlying directory is. Defaults to the working
    /// directory.
    pub underlying_dir: Option<PathBuf>,
    #[serde(rename = "backend")]
    pub backends: Vec<BackendConfig>,
    #[serde(rename = "stow")]
    pub stows: Vec<StowConfig>,
    pub mount: Option<MountConfig>,
}

impl Default for UnionConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            debug: false,
            underlying: false,
            underlying_dir: None,
            backends: Vec::new(),
            stows: Vec::new(),
            mount: None,
        }
    }
}

impl UnionConfig {
    pub fn from_toml(source: &str, origin: &str) -> Result<Self, ConfigError> {
        let mut config: UnionConfig = toml::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml(&source, &path.display().to_string())
    }

    /// Expand `~` and environment variables in every path.
    fn expand_paths(&mut self) {
        self.underlying_dir = self.underlying_dir.as_deref().map(expand);
        for backend in &mut self.backends {
            backend.path = expand(&backend.path);
        }
        for stow in &mut self.stows {
            stow.dir = expand(&stow.dir);
        }
        if let Some(mount) = &mut self.mount {
            mount.dir = mount.dir.as_deref().map(expand);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_size == 0 {
            return Err(ConfigError::ValidationFailed("cache_size must be at least 1".into()));
        }
        if let Some(mount) = &self.mount {
            if mount.command.trim().is_empty() {
                return Err(ConfigError::ValidationFailed("mount command is empty".into()));
            }
        }
        for stow in &self.stows {
            stow_patterns(stow)?;
        }
        Ok(())
    }

    /// Register the underlying source and the static backends.
    pub fn register_backends(&self, chain: &Chain) {
        if self.underlying {
            chain.register(None, false, DEFAULT_PRIORITY);
        }
        for backend in &self.backends {
            chain.register(Some(backend.path.clone()), backend.writable, backend.priority);
        }
    }

    /// Stow directories with compiled patterns.
    pub fn stow_dirs(&self) -> Result<Vec<StowDir>, ConfigError> {
        self.stows
            .iter()
            .map(|stow| {
                Ok(StowDir::new(&stow.dir)
                    .with_patterns(stow_patterns(stow)?)
                    .with_writable(stow.writable)
                    .with_priority(stow.priority))
            })
            .collect()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationFailed(e.to_string()))
    }
}

fn stow_patterns(stow: &StowConfig) -> Result<PatternList, ConfigError> {
    let mut list = PatternList::new();
    for pattern in &stow.patterns {
        list.add(pattern).map_err(|e| ConfigError::Pattern {
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(list)
}

fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(&raw).as_ref()),
    }
}
