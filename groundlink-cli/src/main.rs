//! groundlink CLI - talk to flight controllers and flash STM32 boards.
//!
//! ## Features
//!
//! - List serial ports and DFU devices
//! - Flash Intel HEX, DfuSe and raw binary images over USB DFU
//! - Sniff MAVLink traffic, with optional signature checking
//! - Send MSP requests and print the replies
//! - Raw hex monitor on any endpoint
//! - Shell completion generation

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use groundlink::Endpoint;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// groundlink - ground-station link tool for MAVLink/MSP flight controllers.
///
/// Environment variables:
///   GROUNDLINK_ENDPOINT         - Default endpoint (serial:/dev/ttyACM0:115200, udp:14550, tcp:host:5760)
///   GROUNDLINK_PORT             - Default serial port
///   GROUNDLINK_BAUD             - Default baud rate (default: 115200)
///   GROUNDLINK_NON_INTERACTIVE  - Non-interactive mode (disable prompts)
///   GROUNDLINK_CONFIG           - Configuration file path
#[derive(Parser)]
#[command(name = "groundlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  groundlink list-ports\n  groundlink dfu flash firmware.hex\n  groundlink -e udp:14550 mavlink sniff")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Endpoint to connect to (overrides --port).
    #[arg(short, long, global = true, env = "GROUNDLINK_ENDPOINT")]
    pub(crate) endpoint: Option<String>,

    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "GROUNDLINK_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate for serial ports.
    #[arg(short, long, global = true, env = "GROUNDLINK_BAUD")]
    pub(crate) baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "GROUNDLINK_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    pub(crate) confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    pub(crate) list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "GROUNDLINK_CONFIG")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// USB DFU bootloader operations.
    #[command(subcommand)]
    Dfu(DfuCommand),

    /// Firmware image inspection.
    #[command(subcommand)]
    Firmware(FirmwareCommand),

    /// MAVLink operations.
    #[command(subcommand)]
    Mavlink(MavlinkCommand),

    /// MSP operations.
    #[command(subcommand)]
    Msp(MspCommand),

    /// Hex dump everything received on the endpoint.
    Monitor {
        /// Stop after this many bytes.
        #[arg(long)]
        limit: Option<usize>,
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

/// `dfu` subcommands.
#[derive(Subcommand)]
pub(crate) enum DfuCommand {
    /// List attached DFU interfaces.
    List {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Flash a firmware image to an STM32 in DFU mode.
    Flash {
        /// Firmware file (.hex, .dfu or .bin).
        firmware: PathBuf,

        /// Load address for raw binaries.
        #[arg(long, value_parser = parse_hex_u32)]
        base: Option<u32>,

        /// Skip read-back verification.
        #[arg(long)]
        no_verify: bool,

        /// Stay in the bootloader after flashing.
        #[arg(long)]
        leave_in_dfu: bool,

        /// Jump address used when leaving DFU.
        #[arg(long, value_parser = parse_hex_u32)]
        entry: Option<u32>,

        /// Seconds to wait for a DFU device to appear.
        #[arg(long, default_value = "0")]
        wait: u64,
    },
}

/// `firmware` subcommands.
#[derive(Subcommand)]
pub(crate) enum FirmwareCommand {
    /// Show the segments of a firmware image.
    Info {
        /// Firmware file (.hex, .dfu or .bin).
        firmware: PathBuf,

        /// Load address for raw binaries.
        #[arg(long, value_parser = parse_hex_u32)]
        base: Option<u32>,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// `mavlink` subcommands.
#[derive(Subcommand)]
pub(crate) enum MavlinkCommand {
    /// Print every MAVLink frame received.
    Sniff {
        /// Stop after this many frames.
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Reject v2 payloads shorter than the message minimum.
        #[arg(long)]
        strict: bool,

        /// 32-byte signing key as hex; unsigned and badly signed frames are dropped.
        #[arg(long, env = "GROUNDLINK_SIGNING_KEY", hide_env_values = true)]
        signing_key: Option<String>,

        /// One JSON object per frame on stdout.
        #[arg(long)]
        json: bool,
    },
}

/// `msp` subcommands.
#[derive(Subcommand)]
pub(crate) enum MspCommand {
    /// Send one request and print the reply.
    Request {
        /// Command id (e.g. 108 for MSP_ATTITUDE).
        command: u16,

        /// Request payload as hex.
        #[arg(long, default_value = "")]
        payload: String,

        /// Always use MSP v2 framing.
        #[arg(long)]
        v2: bool,

        /// Reply timeout in milliseconds.
        #[arg(long, default_value = "1000")]
        timeout: u64,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
pub(crate) fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Exit code for a failed run.
pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(lib_err) = err.downcast_ref::<groundlink::Error>() {
        return match lib_err {
            groundlink::Error::Aborted => 130,
            groundlink::Error::Config(_) => 3,
            groundlink::Error::DeviceNotFound | groundlink::Error::DeviceLost(_) => 4,
            _ => 1,
        };
    }
    1
}

fn install_interrupt_handler() {
    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: give up immediately.
            std::process::exit(130);
        }
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    groundlink::set_interrupt_checker(was_interrupted);
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
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

    debug!(
        "groundlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for_error(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Dfu(DfuCommand::List { json }) => commands::dfu::cmd_dfu_list(*json),
        Commands::Dfu(DfuCommand::Flash {
            firmware,
            base,
            no_verify,
            leave_in_dfu,
            entry,
            wait,
        }) => {
            let args = commands::dfu::FlashArgs {
                firmware: firmware.clone(),
                base: *base,
                verify: !no_verify && config.dfu.verify.unwrap_or(true),
                leave_in_dfu: *leave_in_dfu || config.dfu.leave_in_dfu,
                entry: entry.or(config.dfu.entry_address),
                wait_secs: *wait,
            };
            commands::dfu::cmd_dfu_flash(cli, &args)
        },
        Commands::Firmware(FirmwareCommand::Info {
            firmware,
            base,
            json,
        }) => commands::firmware::cmd_firmware_info(firmware, *base, *json),
        Commands::Mavlink(MavlinkCommand::Sniff {
            count,
            strict,
            signing_key,
            json,
        }) => {
            let endpoint = resolve_endpoint(cli, &mut config)?;
            let key = signing_key.clone().or_else(|| config.mavlink.signing_key.clone());
            let args = commands::link::SniffArgs {
                count: *count,
                strict: *strict || config.mavlink.strict_length,
                signing_key: key,
                json: *json,
            };
            commands::link::cmd_mavlink_sniff(cli, &endpoint, &args)
        },
        Commands::Msp(MspCommand::Request {
            command,
            payload,
            v2,
            timeout,
        }) => {
            let endpoint = resolve_endpoint(cli, &mut config)?;
            let payload = hex::decode(payload.trim())
                .map_err(|e| CliError::Usage(format!("Invalid payload hex: {e}")))?;
            commands::link::cmd_msp_request(
                &endpoint,
                *command,
                &payload,
                *v2 || config.msp.force_v2,
                std::time::Duration::from_millis(*timeout),
            )
        },
        Commands::Monitor { limit } => {
            let endpoint = resolve_endpoint(cli, &mut config)?;
            commands::monitor::cmd_monitor(cli, &endpoint, *limit)
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: groundlink completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Work out what to connect to: explicit endpoint, then serial port
/// selection.
pub(crate) fn resolve_endpoint(cli: &Cli, config: &mut Config) -> Result<Endpoint> {
    let configured = cli
        .endpoint
        .as_deref()
        .or(config.connection.endpoint.as_deref());
    if let Some(text) = configured {
        return text
            .parse::<Endpoint>()
            .map_err(|e| CliError::Usage(format!("Invalid endpoint '{text}': {e}")).into());
    }

    let baud = cli
        .baud
        .or(config.connection.baud)
        .unwrap_or(groundlink::transport::DEFAULT_BAUD);
    let path = get_port(cli, config)?;
    Ok(Endpoint::Serial { path, baud })
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config).context("No serial port selected")?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
