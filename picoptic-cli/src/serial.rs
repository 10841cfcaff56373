//! Interactive serial port selection.
//!
//! The adapter is found in this order:
//! - the port given on the command line
//! - the port remembered in configuration
//! - the only recognised USB bridge (or the only port at all)
//! - a `dialoguer` prompt, never shown in non-interactive mode

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    picoptic::{DetectedPort, discover_ports},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection.
pub struct SelectedPort {
    /// The selected port name.
    pub name: String,
    /// Whether the user picked it from a prompt.
    pub prompted: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Narrow the candidates to recognised bridges when there are any.
fn candidates(ports: Vec<DetectedPort>) -> Vec<DetectedPort> {
    if ports
        .iter()
        .any(DetectedPort::is_known_bridge)
    {
        ports
            .into_iter()
            .filter(DetectedPort::is_known_bridge)
            .collect()
    } else {
        ports
    }
}

fn select_non_interactive_port(ports: Vec<DetectedPort>) -> Result<SelectedPort> {
    match ports
        .len()
        .cmp(&1)
    {
        Ordering::Equal => Ok(SelectedPort {
            name: ports[0]
                .name
                .clone(),
            prompted: false,
        }),
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found, choose one with --port",
        )),
        Ordering::Less => Err(usage_err("no serial ports found")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    if let Some(name) = &config
        .port
        .serial
    {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            prompted: false,
        });
    }

    let ports = candidates(discover_ports());

    if options.non_interactive || ports.len() <= 1 {
        let selected = select_non_interactive_port(ports)?;
        info!("Auto-selected port: {}", selected.name);
        return Ok(selected);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(&ports)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "multiple serial ports found and no terminal to ask, choose one with --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("port selection cancelled".to_string()).into()
            } else {
                usage_err("port selection prompt failed")
            }
        },
    }
}

fn port_label(port: &DetectedPort) -> String {
    let bridge = if port.is_known_bridge() {
        format!(" [{}]", style(port.kind.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{bridge}{product}", port.name)
}

fn select_port_interactive(ports: &[DetectedPort]) -> Result<SelectedPort> {
    eprintln!(
        "{} {} serial ports found",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the optical adapter")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                name: port
                    .name
                    .clone(),
                prompted: true,
            })
        },
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

/// Ask user if they want to remember this port.
pub fn ask_remember_port(name: &str, config: &mut Config) -> Result<()> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {name} for this directory?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.save_port(name) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        picoptic::{BridgeKind, PortInfo},
    };

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        DetectedPort::from(PortInfo {
            name: name.to_string(),
            vid,
            pid,
            ..PortInfo::default()
        })
    }

    fn is_usage(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_)))
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.port.serial = Some("/dev/ttyUSB9".to_string());
        let options = SerialOptions {
            port: Some("COM3".to_string()),
            non_interactive: true,
        };
        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.name, "COM3");
        assert!(!selected.prompted);
    }

    #[test]
    fn test_configured_port_used() {
        let mut config = Config::default();
        config.port.serial = Some("/dev/ttyUSB9".to_string());
        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB9");
    }

    #[test]
    fn test_candidates_prefer_known_bridges() {
        let ports = candidates(vec![
            port("/dev/ttyS0", None, None),
            port("/dev/ttyUSB0", Some(0x1A86), Some(0x7523)),
        ]);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].kind, BridgeKind::Ch340);

        let ports = candidates(vec![port("/dev/ttyS0", None, None), port("/dev/ttyS1", None, None)]);
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![
            port("/dev/ttyUSB0", None, None),
            port("/dev/ttyUSB1", None, None),
        ])
        .err()
        .expect("expected error");
        assert!(is_usage(&err));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(Vec::new())
            .err()
            .expect("expected error");
        assert!(is_usage(&err));
    }

    #[test]
    fn test_non_interactive_single_port() {
        let selected = select_non_interactive_port(vec![port("/dev/ttyUSB0", None, None)]).unwrap();
        assert_eq!(selected.name, "/dev/ttyUSB0");
        assert!(!selected.prompted);
    }

    #[test]
    fn test_port_label_shows_bridge() {
        console::set_colors_enabled(false);
        let label = port_label(&port("/dev/ttyUSB0", Some(0x10C4), Some(0xEA60)));
        assert!(label.starts_with("/dev/ttyUSB0"));
        assert!(label.contains("CP210x"));

        let label = port_label(&port("/dev/ttyACM0", Some(0x2341), Some(0x0043)));
        assert!(label.contains("(2341:0043)"));
    }
}
