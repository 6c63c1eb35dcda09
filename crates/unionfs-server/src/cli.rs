//! Command-line interface.
//!
//! Backend flags are positional modifiers: `--writable`, `--priority` and
//! `--remove` apply to the next filesystem (or `--underlying`) and are
//! then reset. clap records where every value sat on the command line,
//! which is enough to recover that pairing after parsing. The flags are
//! declared as appending options with an implied `true` so that each
//! occurrence keeps its own position.

use anyhow::{Context, Result};
use clap::{ArgAction, ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

use unionfs_kernel::DEFAULT_PRIORITY;
use unionfs_kernel::UnionConfig;
use unionfs_kernel::config::{MountConfig, StowConfig};

use crate::constants::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, default_config_path};

/// Union filesystem: several directory trees merged into one namespace.
#[derive(Parser, Debug)]
#[command(name = "unionfs")]
#[command(version, about = "Merge several directory trees into one namespace")]
#[command(subcommand_precedence_over_arg = true)]
pub struct Cli {
    /// Backing filesystems. Directories merge; for anything else the
    /// highest-priority filesystem that has the name wins
    #[arg(value_name = "FILESYSTEMS")]
    pub filesystems: Vec<PathBuf>,

    /// Add the underlying directory to the union
    #[arg(short, long, num_args = 0, default_missing_value = "true", action = ArgAction::Append)]
    pub underlying: Vec<bool>,

    /// Mark the following filesystem as writable
    #[arg(short, long, num_args = 0, default_missing_value = "true", action = ArgAction::Append)]
    pub writable: Vec<bool>,

    /// Priority of the following filesystem
    #[arg(short, long, value_name = "N", allow_negative_numbers = true)]
    pub priority: Vec<i32>,

    /// Remove the following filesystem instead of adding it
    #[arg(short, long, num_args = 0, default_missing_value = "true", action = ArgAction::Append)]
    pub remove: Vec<bool>,

    /// Maximum number of directories kept in the cache
    #[arg(short, long, value_name = "SIZE")]
    pub cache_size: Option<usize>,

    /// Stow directory whose packages are merged
    #[arg(short, long, value_name = "DIR")]
    pub stow: Vec<PathBuf>,

    /// Merge only the package subdirectories matching PATTERN (every --stow)
    #[arg(short = 'm', long = "match", value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// Start COMMAND and merge the tree it publishes
    #[arg(short = 't', long, value_name = "COMMAND")]
    pub mount: Option<String>,

    /// Start the --mount command without merging its tree
    #[arg(short, long, requires = "mount")]
    pub no_mount: bool,

    /// Where the --mount command publishes its tree
    #[arg(long, value_name = "DIR", requires = "mount")]
    pub mount_dir: Option<PathBuf>,

    /// Directory used by --underlying (default: working directory)
    #[arg(long, value_name = "DIR")]
    pub underlying_dir: Option<PathBuf>,

    /// Send debugging messages to stderr
    #[arg(short, long)]
    pub debug: bool,

    /// Configuration file (default: ~/.config/unionfs/config.toml, if present)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Keep the union running, tracking stow directories, until interrupted
    Serve,

    /// List a merged directory
    Ls {
        #[arg(default_value = "")]
        path: String,

        /// Print the packed directory records instead
        #[arg(long)]
        raw: bool,
    },

    /// Show the attributes of an entry
    Stat { path: String },

    /// Copy a file to stdout from the filesystem that provides it
    Cat { path: String },

    /// Create a directory
    Mkdir {
        path: String,

        /// Permission bits, in octal
        #[arg(long, default_value_t = DEFAULT_DIR_MODE, value_parser = parse_mode)]
        mode: u32,
    },

    /// Remove a directory from every filesystem that has it
    Rmdir { path: String },

    /// Remove a file from every filesystem that has it
    Rm { path: String },

    /// Create an empty file unless the name exists
    Touch {
        path: String,

        /// Permission bits, in octal
        #[arg(long, default_value_t = DEFAULT_FILE_MODE, value_parser = parse_mode)]
        mode: u32,
    },

    /// Print the options that reproduce the current filesystem set
    Args,

    /// Print the effective configuration as TOML
    Config,
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| format!("`{s}` is not an octal mode"))
}

/// One filesystem operand with the modifiers that preceded it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerArg {
    /// `path: None` is the underlying directory.
    Add {
        path: Option<PathBuf>,
        writable: bool,
        priority: i32,
    },
    Remove { path: Option<PathBuf> },
}

#[derive(Debug)]
enum Token {
    Writable,
    Remove,
    Priority(i32),
    Target(Option<PathBuf>),
}

impl Cli {
    /// Parse `args` (program name first), keeping the order of the
    /// backend flags.
    pub fn parse_with_layers<I, T>(args: I) -> Result<(Self, Vec<LayerArg>), clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = <Self as CommandFactory>::command().try_get_matches_from(args)?;
        let cli = Self::from_arg_matches(&matches)?;
        Ok((cli, layers(&matches)))
    }

    /// Load the configuration file and apply the command-line overrides.
    ///
    /// An explicit `--config` must exist; the default location is used
    /// only if it does.
    pub fn load_config(&self) -> Result<UnionConfig> {
        let path = match &self.config {
            Some(path) => Some(path.clone()),
            None => default_config_path().filter(|p| p.is_file()),
        };
        let mut config = match &path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config");
                UnionConfig::load(path)
                    .with_context(|| format!("failed to load {}", path.display()))?
            }
            None => UnionConfig::default(),
        };
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut UnionConfig) {
        if let Some(size) = self.cache_size {
            config.cache_size = size;
        }
        config.debug |= self.debug;
        if self.underlying_dir.is_some() {
            config.underlying_dir = self.underlying_dir.clone();
        }
        for dir in &self.stow {
            config.stows.push(StowConfig {
                dir: dir.clone(),
                patterns: self.patterns.clone(),
                writable: false,
                priority: DEFAULT_PRIORITY,
            });
        }
        if let Some(command) = &self.mount {
            config.mount = Some(MountConfig {
                command: command.clone(),
                dir: self.mount_dir.clone(),
                writable: false,
                priority: DEFAULT_PRIORITY,
                merge: !self.no_mount,
            });
        }
    }

    /// The subcommand to run; `serve` when none was given.
    pub fn action(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}

/// Pair each filesystem operand with the flags in front of it.
fn layers(matches: &ArgMatches) -> Vec<LayerArg> {
    let mut tokens: Vec<(usize, Token)> = Vec::new();

    if let Some(indices) = matches.indices_of("writable") {
        tokens.extend(indices.map(|i| (i, Token::Writable)));
    }
    if let Some(indices) = matches.indices_of("remove") {
        tokens.extend(indices.map(|i| (i, Token::Remove)));
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("priority"),
        matches.get_many::<i32>("priority"),
    ) {
        tokens.extend(indices.zip(values).map(|(i, p)| (i, Token::Priority(*p))));
    }
    if let Some(indices) = matches.indices_of("underlying") {
        tokens.extend(indices.map(|i| (i, Token::Target(None))));
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("filesystems"),
        matches.get_many::<PathBuf>("filesystems"),
    ) {
        tokens.extend(
            indices
                .zip(values)
                .map(|(i, path)| (i, Token::Target(Some(path.clone())))),
        );
    }

    // Stable, so bundled short flags (`-wu`) keep modifier-before-target.
    tokens.sort_by_key(|(i, _)| *i);
    fold_layers(tokens.into_iter().map(|(_, t)| t))
}

fn fold_layers(tokens: impl IntoIterator<Item = Token>) -> Vec<LayerArg> {
    let mut layers = Vec::new();
    let mut writable = false;
    let mut remove = false;
    let mut priority = DEFAULT_PRIORITY;

    for token in tokens {
        match token {
            Token::Writable => writable = true,
            Token::Remove => remove = true,
            Token::Priority(p) => priority = p,
            Token::Target(path) => {
                layers.push(if remove {
                    LayerArg::Remove { path }
                } else {
                    LayerArg::Add {
                        path,
                        writable,
                        priority,
                    }
                });
                writable = false;
                remove = false;
                priority = DEFAULT_PRIORITY;
            }
        }
    }
    if writable || remove || priority != DEFAULT_PRIORITY {
        tracing::warn!("trailing filesystem flags with no filesystem after them were ignored");
    }
    layers
}
