//! Device presence watcher command.

use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::Result;
use console::style;
use odinflash::{PortEvent, PortMonitor};

use crate::{was_interrupted, Cli};

/// `watch` implementation: print presence changes until interrupted.
pub(crate) fn cmd_watch(cli: &Cli) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Watching for download-mode devices (Ctrl-C to stop)",
            style("👀").cyan()
        );
    }

    let (tx, rx) = mpsc::channel();
    // No session runs inside this command, so the gate stays open.
    let session_active = Arc::new(AtomicBool::new(false));
    let monitor = PortMonitor::spawn(tx, session_active);

    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(PortEvent::Added(name)) => {
                println!("added {name}");
            }
            Ok(PortEvent::Removed) => {
                println!("removed");
            }
            Ok(PortEvent::Changed { old, new }) => {
                println!("changed {old} -> {new}");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if was_interrupted() {
            break;
        }
    }

    monitor.stop();
    Ok(())
}
