//! Port listing and device detection commands.

use anyhow::{Context, Result};
use console::style;
use odinflash::device;

/// `list-ports` implementation.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = device::detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "download_mode": p.is_download_mode(),
                    "samsung": p.is_samsung(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("none found").dim());
        return;
    }
    for line in device::format_port_list(&detected) {
        eprintln!("  {} {}", style("•").green(), line);
    }
}

/// `detect` implementation.
pub(crate) fn cmd_detect(probe: bool) -> Result<()> {
    let port = device::locate_device(probe).context(
        "no download-mode device found (hold Volume Down + Bixby + plug USB, \
         or retry with --probe)",
    )?;

    println!("{}", port.name);
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        eprintln!(
            "{} Device {:04X}:{:04X} on {}",
            style("✓").green(),
            vid,
            pid,
            port.name
        );
    } else {
        eprintln!("{} Device answered probe on {}", style("✓").green(), port.name);
    }
    Ok(())
}
