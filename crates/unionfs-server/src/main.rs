//! unionfs binary
//!
//! ## Usage
//!
//! ```bash
//! # Merge two trees and keep tracking a stow directory
//! unionfs /srv/base --writable --priority 10 /srv/scratch --stow /usr/local/stow serve
//!
//! # One-shot operations against the merged view
//! unionfs /srv/base /srv/scratch ls etc
//! unionfs /srv/base /srv/scratch cat etc/motd
//! unionfs /srv/base --writable /srv/scratch mkdir etc/new
//!
//! # Print the options that reproduce the filesystem set
//! unionfs --config ~/.config/unionfs/config.toml args
//! ```

use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use unionfs_kernel::UnionConfig;
use unionfs_server::constants::{DEBUG_LOG_FILTER, DEFAULT_LOG_FILTER};
use unionfs_server::session::format_records;
use unionfs_server::{Cli, Command, LayerArg, Session};

#[tokio::main]
async fn main() -> ExitCode {
    let (cli, layers) = match Cli::parse_with_layers(std::env::args_os()) {
        Ok(parsed) => parsed,
        Err(e) => e.exit(),
    };

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("unionfs: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let filter = if config.debug {
        EnvFilter::new(DEBUG_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli.action(), config, &layers).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: UnionConfig, layers: &[LayerArg]) -> Result<()> {
    if command == Command::Config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let session = Session::open(config, layers).await?;
    let mut out = std::io::stdout().lock();

    match command {
        Command::Serve => {
            drop(out);
            session.serve().await?;
        }
        Command::Ls { path, raw: false } => {
            for entry in session.list(&path).await? {
                writeln!(out, "{:<9} {}", format!("{:?}", entry.kind).to_lowercase(), entry.name)?;
            }
        }
        Command::Ls { path, raw: true } => {
            let page = session.list_raw(&path).await?;
            for line in format_records(&page) {
                writeln!(out, "{line}")?;
            }
            writeln!(out, "{} records, {} bytes", page.count, page.data.len())?;
        }
        Command::Stat { path } => {
            let attr = session.stat(&path).await?;
            writeln!(out, "  File: {path}")?;
            writeln!(out, "  Type: {:?}", attr.kind)?;
            writeln!(out, "  Size: {}", attr.size)?;
            writeln!(out, "Device: {}  Inode: {}  Links: {}", attr.dev, attr.ino, attr.nlink)?;
            writeln!(out, "  Mode: {:04o}", attr.perm)?;
            match (attr.uid, attr.gid) {
                (Some(uid), Some(gid)) => writeln!(out, " Owner: {uid}:{gid}")?,
                _ => writeln!(out, " Owner: -")?,
            }
        }
        Command::Cat { path } => {
            let data = session.read(&path).await?;
            out.write_all(&data).context("cannot write to stdout")?;
        }
        Command::Mkdir { path, mode } => session.mkdir(&path, mode).await?,
        Command::Rmdir { path } => session.rmdir(&path).await?,
        Command::Rm { path } => session.unlink(&path).await?,
        Command::Touch { path, mode } => {
            session.touch(&path, mode).await?;
        }
        Command::Args => writeln!(out, "{}", session.args().join(" "))?,
        // Printed before the union was opened.
        Command::Config => {}
    }
    Ok(())
}
