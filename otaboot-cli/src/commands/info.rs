//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    otaboot::{FirmwareImage, FlashLayout, auto_detect_port, discover_ports},
    std::path::Path,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for line in otaboot::device::format_port_list(&detected) {
        eprintln!("  {} {line}", style("•").green());
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = FirmwareImage::from_file(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let summary = image.summary();
    let fits_dual_slot = image
        .ensure_fits(&FlashLayout::dual_slot())
        .is_ok();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "image": summary,
                "crc_hex": format!("0x{:08X}", summary.crc),
                "fits_dual_slot": fits_dual_slot,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{} Loaded firmware {}",
        style("📦").cyan(),
        firmware.display()
    );
    eprintln!("\n{}", style("Image").bold().underlined());
    eprintln!("  Size:           {} bytes", summary.size);
    eprintln!("  CRC-32/MPEG-2:  0x{:08X}", summary.crc);
    eprintln!("  Pages:          {}", summary.pages);
    eprintln!("  Data packets:   {}", summary.data_packets);
    eprintln!("  Total packets:  {}", summary.total_packets);
    eprintln!(
        "  Dual-slot:      {}",
        if fits_dual_slot {
            style("fits").green()
        } else {
            style("too large").yellow()
        }
    );

    Ok(())
}
