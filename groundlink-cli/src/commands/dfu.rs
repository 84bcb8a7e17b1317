//! DFU listing and flashing.

use anyhow::{Context, Result};
use console::style;
use groundlink::dfu::device::STM32_DFU_VID;
use groundlink::dfu::{DfuDevice, DfuDeviceInfo, DfuHost, FlashOptions, FlashPhase, wait_for_device};
use groundlink::image::DEFAULT_BASE_ADDRESS;
use groundlink::{FirmwareImage, RusbHost, Stm32Flasher};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// Resolved `dfu flash` arguments (command line merged with config).
#[derive(Debug, Clone)]
pub(crate) struct FlashArgs {
    pub(crate) firmware: PathBuf,
    pub(crate) base: Option<u32>,
    pub(crate) verify: bool,
    pub(crate) leave_in_dfu: bool,
    pub(crate) entry: Option<u32>,
    pub(crate) wait_secs: u64,
}

impl FlashArgs {
    fn options(&self) -> FlashOptions {
        let options = FlashOptions::default()
            .with_verify(self.verify)
            .with_leave_in_dfu(self.leave_in_dfu);
        match self.entry {
            Some(entry) => options.with_entry_address(entry),
            None => options,
        }
    }
}

fn device_json(info: &DfuDeviceInfo) -> serde_json::Value {
    serde_json::json!({
        "vid": info.vid,
        "pid": info.pid,
        "bus": info.bus,
        "address": info.address,
        "interface": info.interface,
        "alt_setting": info.alt_setting,
        "serial": info.serial,
        "name": info.alt_name,
    })
}

/// `dfu list` implementation.
pub(crate) fn cmd_dfu_list(json: bool) -> Result<()> {
    let mut host = RusbHost::new().context("Failed to initialise libusb")?;
    let devices = host.enumerate().context("Failed to enumerate USB devices")?;

    if json {
        let list: Vec<serde_json::Value> = devices.iter().map(device_json).collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    eprintln!("{}", style("DFU interfaces:").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No DFU devices found").dim());
    }
    for info in &devices {
        eprintln!("  {} {info}", style("•").green());
    }
    Ok(())
}

fn phase_label(phase: FlashPhase) -> &'static str {
    match phase {
        FlashPhase::Erase => "Erasing",
        FlashPhase::Download => "Writing",
        FlashPhase::Verify => "Verifying",
        FlashPhase::Manifest => "Leaving DFU",
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

/// `dfu flash` implementation.
pub(crate) fn cmd_dfu_flash(cli: &Cli, args: &FlashArgs) -> Result<()> {
    let image = FirmwareImage::from_file_with_base(
        &args.firmware,
        args.base.unwrap_or(DEFAULT_BASE_ADDRESS),
    )
    .with_context(|| format!("Failed to load firmware {}", args.firmware.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} image, {} bytes in {} segment(s) from {:#010x}",
            style("📦").cyan(),
            image.format(),
            image.total_size(),
            image.segments().len(),
            image.start_address()
        );
    }

    let mut host = RusbHost::new().context("Failed to initialise libusb")?;
    let options = args.options();

    let mut flasher = if args.wait_secs > 0 {
        if !cli.quiet {
            eprintln!("{} Waiting for a DFU device...", style("⏳").yellow());
        }
        let info = wait_for_device(
            &mut host,
            |d| d.vid == STM32_DFU_VID && d.alt_setting == 0,
            Duration::from_secs(args.wait_secs),
            Duration::from_millis(500),
        )
        .context("No STM32 DFU device appeared")?;
        let backend = host.connect(&info)?;
        Stm32Flasher::new(host, DfuDevice::new(info, backend), options)
    } else {
        Stm32Flasher::connect_first(host, options).context("No DFU device found")?
    };

    if was_interrupted() {
        return Err(CliError::Cancelled("Interrupted".to_string()).into());
    }
    if !cli.quiet {
        eprintln!("{} Connected to {}", style("✓").green(), flasher.device().info());
    }

    let pb = progress_bar(cli.quiet);
    let result = flasher.flash(&image, &mut |progress| {
        pb.set_message(format!("{} {}", phase_label(progress.phase), progress.message));
        pb.set_position(u64::from(progress.percent));
    });
    pb.finish_and_clear();

    let report = result.context("Flashing failed")?;

    if !cli.quiet {
        eprintln!(
            "{} Wrote {} bytes in {} segment(s) (erase: {:?})",
            style("✓").green(),
            report.bytes_written,
            report.segments,
            report.erase_method
        );
        if args.verify {
            eprintln!(
                "{} Verified {}/{} segment(s)",
                style("✓").green(),
                report.verified_segments,
                report.segments
            );
        }
        for warning in &report.verify_warnings {
            eprintln!("{} {warning}", style("⚠").yellow());
        }
        if report.manifested {
            eprintln!("{} Device left DFU mode", style("→").green().bold());
        } else {
            eprintln!("{} Device is still in DFU mode", style("ℹ").blue());
        }
    }

    Ok(())
}
