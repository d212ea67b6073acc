//! Simulated upload: the real sender against an in-process bootloader.

use {
    super::flash::{layout, load_image, progress_bar},
    crate::{Cli, config::Config},
    anyhow::{Context, Result},
    clap::Args,
    console::style,
    otaboot::{
        BootAction, EngineConfig, Fault, ImageSummary, OtaSender, SendReport, SimulatedDevice,
        UpdateRecord, flash::StagingMode,
    },
    serde::Serialize,
    std::path::PathBuf,
};

/// Arguments of `otaboot simulate`.
#[derive(Debug, Args)]
pub(crate) struct SimulateArgs {
    /// Path to the raw firmware image.
    pub(crate) firmware: PathBuf,

    /// Stage into slot B and promote it at boot.
    #[arg(long)]
    pub(crate) dual_slot: bool,

    /// Corrupt the first Data packet of page N once.
    #[arg(long, value_name = "N")]
    pub(crate) corrupt_page: Option<usize>,

    /// Announce a wrong image CRC in the Header.
    #[arg(long)]
    pub(crate) wrong_crc: bool,

    /// Make the device reject frames with a bad frame CRC.
    #[arg(long)]
    pub(crate) verify_frame_crc: bool,

    /// Output the report as JSON to stdout.
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    image: ImageSummary,
    staging: StagingMode,
    success: bool,
    error: Option<String>,
    transfer: Option<SendReport>,
    responses: Vec<&'static str>,
    record: Option<UpdateRecord>,
    boot_action: BootAction,
    resets: u32,
}

/// Simulate command implementation.
pub(crate) fn cmd_simulate(cli: &Cli, config: &Config, args: &SimulateArgs) -> Result<()> {
    let quiet = cli.quiet || args.json;
    let layout = layout(args.dual_slot);
    let image = load_image(&args.firmware, &layout, quiet)?;

    let engine = EngineConfig::default()
        .with_layout(layout)
        .with_frame_crc_check(args.verify_frame_crc || config.transfer.verify_frame_crc);
    let mut device = SimulatedDevice::with_config(engine)?;
    if let Some(page) = args.corrupt_page {
        device = device.with_fault(Fault::CorruptPage(page));
    }
    if args.wrong_crc {
        device = device.with_fault(Fault::WrongImageCrc);
    }

    let pb = progress_bar(image.data().len(), quiet);
    let result = OtaSender::with_config(&mut device, config.transfer.sender_config())
        .upload(&image, |sent, _| pb.set_position(sent as u64));
    pb.finish_and_clear();

    let report = SimulationReport {
        image: image.summary(),
        staging: layout.staging,
        success: result.is_ok(),
        error: result
            .as_ref()
            .err()
            .map(ToString::to_string),
        transfer: result
            .as_ref()
            .ok()
            .cloned(),
        responses: device
            .responses()
            .iter()
            .map(|r| r.as_str())
            .collect(),
        record: device.record()?,
        boot_action: device.boot_action(),
        resets: device.resets(),
    };

    if args.json {
        let output = serde_json::json!({
            "ok": report.success,
            "data": report,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !cli.quiet {
        print_report(&report);
    }

    result
        .map(|_| ())
        .context("Simulated upload failed")
}

fn print_report(report: &SimulationReport) {
    eprintln!("\n{}", style("Responses").bold().underlined());
    for chunk in report.responses.chunks(8) {
        eprintln!("  {}", chunk.join(" "));
    }

    if let Some(transfer) = &report.transfer {
        eprintln!(
            "\n{} {} pages, {} page resends, {} chunk resends",
            style("✓").green(),
            transfer.pages,
            transfer.page_retries,
            transfer.chunk_retries
        );
    }

    eprintln!("\n{}", style("Update record").bold().underlined());
    match &report.record {
        Some(record) => {
            eprintln!("  flag_update:        {}", record.flag_update);
            eprintln!("  flag_block_updates: {}", record.flag_block_updates);
            eprintln!("  fw_received_size:   {}", record.fw_received_size);
            eprintln!("  fw_crc:             0x{:08X}", record.fw_crc);
        },
        None => eprintln!("  {}", style("(none)").dim()),
    }

    let action = match report.boot_action {
        BootAction::RunApplication => style("run application").green(),
        BootAction::StayInBootloader => style("stay in bootloader").yellow(),
    };
    eprintln!("\n{} Boot decision after {} reset(s): {action}", style("→").bold(), report.resets);
}
