//! PIT read/write command implementations.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;
use odinflash::pit;

use crate::commands::flash::open_greeted_session;
use crate::config::Config;
use crate::Cli;

/// `pit read` implementation.
pub(crate) fn cmd_pit_read(
    cli: &Cli,
    config: &mut Config,
    out: Option<&Path>,
    backup_dir: Option<&Path>,
    no_backup: bool,
) -> Result<()> {
    let mut session = open_greeted_session(cli, config)?;

    let blob = session.read_pit().context("PIT read failed")?;
    pit::ensure_plausible_pit(&blob).context("device sent an implausible PIT")?;
    if !cli.quiet {
        eprintln!(
            "{} Read {} bytes of partition table",
            style("✓").green(),
            blob.len()
        );
    }

    session.end().context("could not end the session")?;

    if let Some(out) = out {
        fs::write(out, &blob)
            .with_context(|| format!("could not write {}", out.display()))?;
        if !cli.quiet {
            eprintln!("{} Saved to {}", style("💾").cyan(), out.display());
        }
    }

    if !no_backup {
        let base: PathBuf = backup_dir
            .map(Path::to_path_buf)
            .or_else(|| config.flash.backup_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let path = pit::write_backup(&base, &blob).context("could not archive the PIT")?;
        if !cli.quiet {
            eprintln!("{} Backup at {}", style("💾").cyan(), path.display());
        }
    }

    Ok(())
}

/// `pit write` implementation.
pub(crate) fn cmd_pit_write(cli: &Cli, config: &mut Config, file: &Path) -> Result<()> {
    let blob = fs::read(file).with_context(|| format!("could not read {}", file.display()))?;
    pit::ensure_plausible_pit(&blob)
        .with_context(|| format!("{} does not look like a PIT", file.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Repartitioning from {} ({} bytes). This rewrites the partition table.",
            style("🗂").cyan(),
            file.display(),
            blob.len()
        );
    }

    let mut session = open_greeted_session(cli, config)?;
    session.enter_pit_mode().context("PIT mode entry failed")?;
    session.write_pit(&blob).context("PIT write failed")?;
    session.end().context("could not end the session")?;

    if !cli.quiet {
        eprintln!("{} Partition table written", style("🎉").green().bold());
    }
    Ok(())
}
