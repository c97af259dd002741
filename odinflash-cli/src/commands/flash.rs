//! Flash and reboot command implementations.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use odinflash::image::{self, ImageStream};
use odinflash::{Error, LokeSession, NativePort, Port, TarStream};

use crate::config::Config;
use crate::{get_port, use_fancy_output, was_interrupted, Cli};

/// Images at least this large may fail individually without aborting the
/// rest of the archive.
const SKIPPABLE_IMAGE_SIZE: u64 = 1024 * 1024 * 1024;

/// Archive suffixes treated as tar bundles (stock firmware ships as
/// `*.tar.md5`, a plain tar with a checksum line appended).
const TAR_SUFFIXES: &[&str] = &[".tar", ".tar.md5"];

pub(crate) fn open_greeted_session(
    cli: &Cli,
    config: &mut Config,
) -> Result<LokeSession<NativePort>> {
    let port = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Opening {} (115200 8N1, DTR/RTS asserted)",
            style("🔌").cyan(),
            style(&port).bold()
        );
    }

    let mut session =
        LokeSession::open(&port).with_context(|| format!("could not open {port}"))?;
    session.greet().context("device did not answer ODIN")?;
    if !cli.quiet {
        eprintln!("{} Session established", style("✓").green());
    }
    Ok(session)
}

fn progress_bar(cli: &Cli, name: &str, size: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(size);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(name.to_string());
    pb
}

fn is_tar_bundle(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    TAR_SUFFIXES
        .iter()
        .any(|suffix| image::has_suffix_ignore_case(&name, suffix))
}

/// Send ENDS on a cancelled session if it is still in a state to take it;
/// otherwise the device stays mid-transfer and the user must be told.
fn close_after_cancel(session: &mut LokeSession<NativePort>) {
    match session.end() {
        Ok(()) => eprintln!("{} Cancelled; session ended cleanly", style("⚠").yellow()),
        Err(_) => {
            let _ = session.port_mut().close();
            eprintln!(
                "{} Cancelled mid-transfer; device left in an unknown state",
                style("⚠").yellow()
            );
        }
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    skip_pit: bool,
    reboot: bool,
) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            style(firmware.display()).bold()
        );
    }

    // Open the source before touching any port so a bad path fails fast.
    let result = if is_tar_bundle(firmware) {
        let file = File::open(firmware)
            .with_context(|| format!("could not open {}", firmware.display()))?;
        let mut session = open_greeted_session(cli, config)?;
        let outcome = flash_archive(cli, &mut session, file, skip_pit);
        finish(cli, session, outcome, reboot)
    } else {
        let mut image = ImageStream::from_file(firmware)
            .with_context(|| format!("could not open {}", firmware.display()))?;
        let mut session = open_greeted_session(cli, config)?;
        let pb = progress_bar(cli, image.name(), image.size());
        let outcome = session
            .flash_image(&mut image, &mut |sent, _| pb.set_position(sent))
            .map(|()| {
                pb.finish();
                Vec::new()
            });
        finish(cli, session, outcome, reboot)
    };

    result
}

/// Walk a tar bundle, writing an embedded PIT first when present and
/// streaming every image entry. Returns the names of skipped images.
fn flash_archive(
    cli: &Cli,
    session: &mut LokeSession<NativePort>,
    file: File,
    skip_pit: bool,
) -> Result<Vec<String>, Error> {
    let mut tar = TarStream::new(BufReader::new(file));
    let mut failed: Vec<String> = Vec::new();

    while let Some(mut entry) = tar.next_entry()? {
        if was_interrupted() {
            return Err(Error::Cancelled);
        }
        if entry.is_dir() || entry.size() == 0 {
            continue;
        }
        let name = entry.name().to_string();

        if image::is_pit_name(&name) {
            if skip_pit {
                debug!("skipping PIT entry {name}");
                continue;
            }
            let mut blob = Vec::new();
            entry.read_to_end(&mut blob)?;
            odinflash::pit::ensure_plausible_pit(&blob)?;
            if !cli.quiet {
                eprintln!(
                    "{} Repartitioning from {} ({} bytes)",
                    style("🗂").cyan(),
                    name,
                    blob.len()
                );
            }
            session.enter_pit_mode()?;
            session.write_pit(&blob)?;
            continue;
        }

        if !image::is_flashable_image(&name) {
            debug!("skipping non-image entry {name}");
            continue;
        }

        let size = entry.size();
        let pb = progress_bar(cli, &name, size);
        let mut stream = ImageStream::new(name.clone(), size, &mut entry);
        match session.flash_image(&mut stream, &mut |sent, _| pb.set_position(sent)) {
            Ok(()) => pb.finish(),
            Err(Error::Cancelled) => {
                pb.abandon();
                return Err(Error::Cancelled);
            }
            Err(e) if size >= SKIPPABLE_IMAGE_SIZE => {
                pb.abandon();
                warn!("{name} failed ({e}); continuing with the remaining images");
                failed.push(name);
                // The archive walker drops the rest of the entry; the session
                // needs a fresh greeting before the next DATA.
                session.recover()?;
            }
            Err(e) => {
                pb.abandon();
                return Err(e);
            }
        }
    }

    Ok(failed)
}

/// Close the session and print the per-run verdict.
fn finish(
    cli: &Cli,
    mut session: LokeSession<NativePort>,
    outcome: Result<Vec<String>, Error>,
    reboot: bool,
) -> Result<()> {
    match outcome {
        Ok(failed) => {
            if reboot {
                session.reboot().context("reboot command failed")?;
            } else {
                session.end().context("could not end the session")?;
            }
            if failed.is_empty() {
                if !cli.quiet {
                    eprintln!("{} Flash completed", style("🎉").green().bold());
                }
                Ok(())
            } else {
                eprintln!(
                    "{} Partial flash: images failed: {}",
                    style("⚠").yellow().bold(),
                    failed.join(", ")
                );
                anyhow::bail!("{} image(s) failed", failed.len());
            }
        }
        Err(Error::Cancelled) => {
            close_after_cancel(&mut session);
            anyhow::bail!("flash aborted");
        }
        Err(e) => Err(e).context("flash aborted"),
    }
}

/// Reboot command implementation.
pub(crate) fn cmd_reboot(cli: &Cli, config: &mut Config) -> Result<()> {
    let mut session = open_greeted_session(cli, config)?;
    session.reboot().context("reboot command failed")?;
    if !cli.quiet {
        eprintln!("{} Device is rebooting to normal mode", style("🔄").cyan());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tar_bundle_detection() {
        assert!(is_tar_bundle(Path::new("G973F_firmware.tar")));
        assert!(is_tar_bundle(Path::new("AP_G973F.tar.md5")));
        assert!(is_tar_bundle(Path::new("UPPER.TAR")));
        assert!(!is_tar_bundle(Path::new("recovery.img")));
        assert!(!is_tar_bundle(Path::new("device.pit")));
    }
}
