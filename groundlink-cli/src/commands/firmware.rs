//! Firmware image inspection.

use anyhow::{Context, Result};
use console::style;
use groundlink::FirmwareImage;
use groundlink::image::DEFAULT_BASE_ADDRESS;
use std::path::Path;

pub(crate) fn image_json(image: &FirmwareImage) -> serde_json::Value {
    let segments: Vec<serde_json::Value> = image
        .segments()
        .iter()
        .map(|s| {
            serde_json::json!({
                "address": format!("{:#010x}", s.address),
                "size": s.len(),
            })
        })
        .collect();
    serde_json::json!({
        "format": image.format().to_string(),
        "start_address": format!("{:#010x}", image.start_address()),
        "entry_point": image.entry_point().map(|e| format!("{e:#010x}")),
        "total_size": image.total_size(),
        "segments": segments,
    })
}

/// `firmware info` implementation.
pub(crate) fn cmd_firmware_info(firmware: &Path, base: Option<u32>, json: bool) -> Result<()> {
    let image = FirmwareImage::from_file_with_base(firmware, base.unwrap_or(DEFAULT_BASE_ADDRESS))
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&image_json(&image))?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware Information").bold().underlined());
    eprintln!("  File: {}", firmware.display());
    eprint!("{image}");
    Ok(())
}
