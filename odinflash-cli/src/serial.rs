//! Interactive serial port selection.
//!
//! Resolution order: explicit `--port`, then the configured preference, then
//! automatic selection when exactly one download-mode device is present, and
//! finally an interactive prompt. Non-interactive mode fails instead of
//! prompting so scripts stay deterministic.

use std::cmp::Ordering;

use anyhow::Result;
use console::style;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::{debug, info};
use odinflash::device::{self, DetectedPort};

use crate::config::Config;

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer all ports (including non-Samsung ones).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if ambiguous).
    pub non_interactive: bool,
    /// Force confirmation even for a single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a download-mode or configured device.
    pub is_known: bool,
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = device::detect_ports();
    if ports.is_empty() {
        anyhow::bail!("No serial ports found. Connect a device or specify a port with -p.");
    }

    let known_ports: Vec<_> = ports.iter().filter(|p| p.is_samsung()).cloned().collect();

    if known_ports.len() == 1 && !options.confirm_port {
        let port = known_ports.into_iter().next().unwrap();
        info!("Auto-selected download-mode port: {}", port.name);
        return Ok(SelectedPort {
            port,
            is_known: true,
        });
    }

    if options.non_interactive {
        anyhow::bail!(
            "Could not pick a port automatically ({} candidates). Use -p to specify one.",
            if known_ports.is_empty() {
                ports.len()
            } else {
                known_ports.len()
            }
        );
    }

    let selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    match selection_ports.len().cmp(&1) {
        Ordering::Greater => select_port_interactive(selection_ports),
        Ordering::Equal => {
            let port = selection_ports.into_iter().next().unwrap();
            if port.is_samsung() {
                Ok(SelectedPort {
                    is_known: true,
                    port,
                })
            } else {
                confirm_single_port(port)
            }
        }
        Ordering::Less => anyhow::bail!("No serial ports available."),
    }
}

/// Resolve an explicitly named port against the enumeration.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = device::detect_ports();

    if let Some(port) = ports.iter().find(|p| p.name == name) {
        return SelectedPort {
            is_known: port.is_samsung(),
            port: port.clone(),
        };
    }

    // Not enumerated (yet); trust the caller and carry the bare name.
    SelectedPort {
        port: DetectedPort {
            name: name.to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        },
        is_known: false,
    }
}

fn describe(port: &DetectedPort) -> String {
    let tag = if port.is_download_mode() {
        format!(" {}", style("[download mode]").green())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" [{vid:04X}:{pid:04X}]")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_deref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();
    format!("{}{}{}", port.name, tag, product)
}

fn select_port_interactive(ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    let items: Vec<String> = ports.iter().map(describe).collect();
    let choice = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the device port")
        .items(&items)
        .default(0)
        .interact()?;

    let port = ports.into_iter().nth(choice).unwrap();
    Ok(SelectedPort {
        is_known: port.is_samsung(),
        port,
    })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let accept = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "{} is not a recognised download-mode device. Use it anyway?",
            describe(&port)
        ))
        .default(false)
        .interact()?;
    if !accept {
        anyhow::bail!("Port selection aborted.");
    }
    Ok(SelectedPort {
        port,
        is_known: false,
    })
}

/// Offer to persist an unrecognised port as the preferred one.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for future runs?", port.name))
        .default(false)
        .interact()?;
    if remember {
        config.remember_port(&port.name)?;
        eprintln!("{} Saved preferred port {}", style("✓").green(), port.name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_port_by_name_carries_unenumerated_name() {
        let selected = find_port_by_name("/dev/odinflash-nonexistent");
        assert_eq!(selected.port.name, "/dev/odinflash-nonexistent");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_describe_tags_download_mode() {
        let port = DetectedPort {
            name: "COM3".into(),
            vid: Some(0x04E8),
            pid: Some(0x685D),
            manufacturer: None,
            product: Some("Gadget Serial".into()),
            serial: None,
        };
        let text = describe(&port);
        assert!(text.contains("COM3"));
        assert!(text.contains("download mode"));
        assert!(text.contains("Gadget Serial"));
    }
}
