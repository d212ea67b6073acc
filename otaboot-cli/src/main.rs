//! otaboot CLI - upload firmware to serial OTA bootloaders.
//!
//! ## Features
//!
//! - Upload raw `.bin` images over a serial port
//! - Rehearse an upload against a simulated bootloader, with fault injection
//! - Inspect an image's size, CRC and packet count
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use {
    commands::{flash::FlashArgs, simulate::SimulateArgs},
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// otaboot - upload firmware to serial OTA bootloaders.
///
/// Environment variables:
///   OTABOOT_PORT              - Default serial port
///   OTABOOT_BAUD              - Default baud rate (default: 115200)
///   OTABOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "otaboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    otaboot flash app.bin\n  \
    otaboot -p /dev/ttyACM0 flash --skip-start app.bin\n  \
    otaboot simulate --corrupt-page 3 app.bin\n  \
    otaboot info --json app.bin")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "OTABOOT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate (default: 115200 or the configured rate).
    #[arg(short, long, global = true, env = "OTABOOT_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "OTABOOT_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Upload a firmware image to the bootloader.
    Flash(FlashArgs),

    /// Rehearse an upload against a simulated bootloader.
    Simulate(SimulateArgs),

    /// Show size, CRC and packet counts of a firmware image.
    Info {
        /// Path to the raw firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

impl Commands {
    /// Whether stdout carries JSON, so logging must stay quiet.
    fn wants_json(&self) -> bool {
        match self {
            Self::Simulate(args) => args.json,
            Self::Info { json, .. } | Self::ListPorts { json } => *json,
            Self::Flash(_) | Self::Completions { .. } => false,
        }
    }
}

/// Exit code for a failed run.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(otaboot::Error::Interrupted) = cause.downcast_ref::<otaboot::Error>() {
            return 130;
        }
    }
    1
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet || cli.command.wants_json() {
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
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    otaboot::set_interrupt_checker(was_interrupted);
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "otaboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash(args) => commands::flash::cmd_flash(cli, &mut config, args),
        Commands::Simulate(args) => commands::simulate::cmd_simulate(cli, &config, args),
        Commands::Info { firmware, json } => commands::info::cmd_info(firmware, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: otaboot completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
