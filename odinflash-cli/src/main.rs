//! odinflash CLI - flash Samsung devices in download mode.
//!
//! ## Features
//!
//! - Flash stock firmware bundles (`*.tar`, `*.tar.md5`) or raw images
//! - Read the partition table with automatic timestamped backups
//! - Repartition from a PIT file
//! - Passive and active device detection
//! - Watch mode reporting devices entering and leaving download mode
//! - Shell completion generation
//! - Environment variable support

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use env_logger::Env;
use log::debug;
use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{ask_remember_port, select_serial_port, SerialOptions};

/// Set by the Ctrl-C handler; polled by the library between chunks.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Check if spinners/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    console::colors_enabled_stderr()
}

/// odinflash - flash Samsung devices in download mode over LOKE/Odin.
///
/// Environment variables:
///   ODINFLASH_PORT              - Default serial port
///   ODINFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "odinflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "The device must already be in download mode: power off, \
then hold the download-mode key combo while plugging in USB.")]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ODINFLASH_PORT")]
    pub(crate) port: Option<String>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ODINFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// Offer every serial port during selection, not only Samsung ones.
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware bundle (.tar/.tar.md5) or a single raw image.
    Flash {
        /// Path to the firmware bundle or image file.
        firmware: PathBuf,

        /// Ignore PIT entries found inside the bundle.
        #[arg(long)]
        skip_pit: bool,

        /// Finish with an explicit reboot to normal mode (REBT).
        #[arg(long)]
        reboot: bool,
    },

    /// Read or write the device partition table.
    Pit {
        #[command(subcommand)]
        action: PitAction,
    },

    /// Find a device in download mode and print its port.
    Detect {
        /// Actively probe every serial port when passive detection fails.
        #[arg(long)]
        probe: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Report devices entering and leaving download mode until interrupted.
    Watch,

    /// Reboot a connected device to normal mode.
    Reboot,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Partition table subcommands.
#[derive(Subcommand)]
enum PitAction {
    /// Read the PIT from the device and archive it.
    Read {
        /// Also write the PIT to this file.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Base directory for the timestamped backup.
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Skip the timestamped backup.
        #[arg(long)]
        no_backup: bool,
    },

    /// Upload a PIT file, repartitioning the device.
    Write {
        /// Path to the PIT file.
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    if env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "odinflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed))
        .context("failed to install Ctrl-C handler")?;
    odinflash::set_interrupt_checker(was_interrupted);

    let mut config = match cli.config_path {
        Some(ref path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            skip_pit,
            reboot,
        } => {
            let reboot = *reboot || config.flash.auto_reboot;
            commands::flash::cmd_flash(&cli, &mut config, firmware, *skip_pit, reboot)
        }
        Commands::Pit { action } => match action {
            PitAction::Read {
                out,
                backup_dir,
                no_backup,
            } => commands::pit::cmd_pit_read(
                &cli,
                &mut config,
                out.as_deref(),
                backup_dir.as_deref(),
                *no_backup,
            ),
            PitAction::Write { file } => commands::pit::cmd_pit_write(&cli, &mut config, file),
        },
        Commands::Detect { probe } => commands::ports::cmd_detect(*probe),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        }
        Commands::Watch => commands::watch::cmd_watch(&cli),
        Commands::Reboot => commands::flash::cmd_reboot(&cli, &mut config),
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        }
    }
}

/// Get serial port from CLI args, config, or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Generate shell completions on stdout.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
