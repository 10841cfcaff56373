//! picoptic CLI - Download firmware to PIC targets over an optical link.
//!
//! ## Features
//!
//! - Flash Intel-HEX images through an LED serial adapter
//! - Inspect images and their page maps
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

mod commands;
mod config;
mod serial;

use commands::{completions, flash, info};
use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Exit code for runtime failures.
const EXIT_FAILURE: i32 = 1;
/// Exit code for usage and setup errors.
const EXIT_USAGE: i32 = 2;
/// Exit code after Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Errors classified for the process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or environment; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// The user backed out; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// picoptic - firmware download over light for PIC microcontrollers.
///
/// Environment variables:
///   PICOPTIC_PORT              - Default serial port
///   PICOPTIC_BAUD              - Adapter baud rate (default: 9600)
///   PICOPTIC_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "picoptic")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Baud rate of the optical adapter.
    #[arg(long, global = true, env = "PICOPTIC_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PICOPTIC_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by `flash` and `info` for loading an image.
#[derive(clap::Args, Debug, Clone)]
struct ImageArgs {
    /// Intel-HEX image to load.
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Skip data outside program memory instead of failing.
    #[arg(short = 'r', long)]
    ignore_out_of_range: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an image to the target.
    Flash {
        #[command(flatten)]
        image: ImageArgs,

        /// Serial port of the optical adapter.
        #[arg(short = 'o', long, env = "PICOPTIC_PORT")]
        port: Option<String>,

        /// Leave out data in the bootloader pages instead of failing.
        #[arg(short = 'p', long)]
        ignore_protected: bool,

        /// Download even when the battery reads low.
        #[arg(short = 'b', long)]
        ignore_battery: bool,

        /// Print the page map before downloading.
        #[arg(short = 'm', long)]
        map: bool,

        /// Skip the completion chime.
        #[arg(long)]
        no_chime: bool,

        /// Erase the application entry page if a page cannot be written.
        #[arg(long)]
        invalidate_on_failure: bool,

        /// Lowest acceptable battery voltage.
        #[arg(long, value_name = "VOLTS")]
        min_volts: Option<f32>,
    },

    /// Show what an image contains.
    Info {
        #[command(flatten)]
        image: ImageArgs,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    picoptic::set_interrupt_checker(was_interrupted);

    let code = match run(&cli) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code(&err)
        },
    };
    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
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
        "picoptic v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            image,
            port,
            ignore_protected,
            ignore_battery,
            map,
            no_chime,
            invalidate_on_failure,
            min_volts,
        } => {
            let request = flash::FlashRequest {
                image: image.image.clone(),
                port: port.clone(),
                ignore_out_of_range: image.ignore_out_of_range,
                ignore_protected: *ignore_protected,
                ignore_battery: *ignore_battery,
                map: *map,
                no_chime: *no_chime,
                invalidate_on_failure: *invalidate_on_failure,
                min_volts: *min_volts,
            };
            flash::cmd_flash(cli, &mut config, &request)
        },
        Commands::Info { image, json } => {
            let ignore_out_of_range = image.ignore_out_of_range
                || config
                    .flash
                    .ignore_out_of_range
                    .unwrap_or(false);
            info::cmd_info(&image.image, ignore_out_of_range, *json)
        },
        Commands::ListPorts { json } => info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Cancelled(_) => EXIT_INTERRUPTED,
        };
    }
    if matches!(
        err.downcast_ref::<picoptic::Error>(),
        Some(picoptic::Error::Interrupted)
    ) || was_interrupted()
    {
        return EXIT_INTERRUPTED;
    }
    EXIT_FAILURE
}

/// Get serial port from CLI args, configuration or interactive selection.
fn get_port(cli: &Cli, port: Option<&String>, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: port.cloned(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if selected.prompted && !cli.non_interactive {
        ask_remember_port(&selected.name, config)?;
    }

    Ok(selected.name)
}

#[cfg(test)]
mod cli_tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash_defaults() {
        let cli = Cli::try_parse_from(["picoptic", "flash", "blink.hex"]).unwrap();
        assert!(cli.baud.is_none());
        assert_eq!(cli.verbose, 0);
        if let Commands::Flash {
            image,
            ignore_protected,
            no_chime,
            min_volts,
            ..
        } = cli.command
        {
            assert_eq!(image.image.to_str().unwrap(), "blink.hex");
            assert!(!image.ignore_out_of_range);
            assert!(!ignore_protected);
            assert!(!no_chime);
            assert!(min_volts.is_none());
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "picoptic",
            "-vv",
            "--baud",
            "4800",
            "flash",
            "fw.hex",
            "-o",
            "/dev/ttyUSB0",
            "-p",
            "-r",
            "-b",
            "-m",
            "--no-chime",
            "--invalidate-on-failure",
            "--min-volts",
            "2.2",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.baud, Some(4800));
        if let Commands::Flash {
            image,
            port,
            ignore_protected,
            ignore_battery,
            map,
            no_chime,
            invalidate_on_failure,
            min_volts,
        } = cli.command
        {
            assert!(image.ignore_out_of_range);
            assert_eq!(port.as_deref(), Some("/dev/ttyUSB0"));
            assert!(ignore_protected);
            assert!(ignore_battery);
            assert!(map);
            assert!(no_chime);
            assert!(invalidate_on_failure);
            assert_eq!(min_volts, Some(2.2));
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["picoptic", "info", "-r", "fw.hex", "--json"]).unwrap();
        if let Commands::Info { image, json } = cli.command {
            assert!(image.ignore_out_of_range);
            assert!(json);
        } else {
            panic!("Expected Info command");
        }
    }

    #[test]
    fn test_cli_flash_requires_image() {
        assert!(Cli::try_parse_from(["picoptic", "flash"]).is_err());
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["picoptic", "list-ports", "-q", "--non-interactive"]).unwrap();
        assert!(cli.quiet);
        assert!(cli.non_interactive);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            exit_code(&CliError::Usage("bad".into()).into()),
            EXIT_USAGE
        );
        assert_eq!(
            exit_code(&CliError::Cancelled("no".into()).into()),
            EXIT_INTERRUPTED
        );
        assert_eq!(
            exit_code(&picoptic::Error::Interrupted.into()),
            EXIT_INTERRUPTED
        );
        assert_eq!(
            exit_code(&picoptic::Error::ProtectedPage { page: 5 }.into()),
            EXIT_FAILURE
        );
    }
}
