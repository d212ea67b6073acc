//! Flash command implementation.

use {
    crate::{Cli, config::Config, get_port, use_fancy_output},
    anyhow::{Context, Result},
    clap::Args,
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    otaboot::{
        FirmwareImage, FlashLayout, NativePort, OtaSender, Port, SerialConfig, port::DEFAULT_BAUD,
    },
    std::path::{Path, PathBuf},
};

/// Arguments of `otaboot flash`.
#[derive(Debug, Args)]
pub(crate) struct FlashArgs {
    /// Path to the raw firmware image.
    pub(crate) firmware: PathBuf,

    /// Send the Header without the START handshake.
    #[arg(long)]
    pub(crate) skip_start: bool,

    /// Check the image against the dual-slot size limit.
    #[arg(long)]
    pub(crate) dual_slot: bool,

    /// Resends of a page whose CRC is rejected.
    #[arg(long, value_name = "N")]
    pub(crate) page_retries: Option<u32>,
}

/// Flash layout selected by `--dual-slot`.
pub(crate) fn layout(dual_slot: bool) -> FlashLayout {
    if dual_slot {
        FlashLayout::dual_slot()
    } else {
        FlashLayout::single_slot()
    }
}

/// Load an image and check it fits `layout`, describing it unless quiet.
pub(crate) fn load_image(path: &Path, layout: &FlashLayout, quiet: bool) -> Result<FirmwareImage> {
    if !quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            path.display()
        );
    }

    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("Failed to load firmware {}", path.display()))?;
    image.ensure_fits(layout)?;

    if !quiet {
        let summary = image.summary();
        eprintln!(
            "{} {} bytes, CRC 0x{:08X}, {} pages, {} packets",
            style("ℹ").blue(),
            summary.size,
            summary.crc,
            summary.pages,
            summary.total_packets
        );
    }
    Ok(image)
}

/// Byte progress bar on stderr, hidden when quiet or not on a terminal.
pub(crate) fn progress_bar(total: usize, quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, args: &FlashArgs) -> Result<()> {
    let image = load_image(&args.firmware, &layout(args.dual_slot), cli.quiet)?;

    let port_name = get_port(cli, config)?;
    let baud = cli
        .baud
        .or(config.port.connection.baud)
        .unwrap_or(DEFAULT_BAUD);
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).green(),
            baud
        );
    }

    let mut port = NativePort::open(&SerialConfig::new(port_name.as_str(), baud))
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    let mut sender_config = config.transfer.sender_config();
    if args.skip_start {
        sender_config = sender_config.with_start(false);
    }
    if let Some(retries) = args.page_retries {
        sender_config = sender_config.with_page_retries(retries);
    }

    if !cli.quiet {
        eprintln!("{} Waiting for the bootloader...", style("⏳").yellow());
    }
    let pb = progress_bar(image.data().len(), cli.quiet);
    let result = OtaSender::with_config(&mut port, sender_config)
        .upload(&image, |sent, _| pb.set_position(sent as u64));

    let report = match result {
        Ok(report) => {
            pb.finish_with_message("done");
            report
        },
        Err(e) => {
            pb.abandon();
            return Err(e).context("Upload failed");
        },
    };
    port.close()?;

    if !cli.quiet {
        eprintln!(
            "\n{} Uploaded {} bytes in {} pages ({} page resends) in {:.1?}",
            style("🎉").green().bold(),
            report.bytes,
            report.pages,
            report.page_retries,
            report.elapsed
        );
        eprintln!("   The device is resetting into the new firmware.");
    }

    Ok(())
}
