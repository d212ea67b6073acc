//! Interactive serial port selection.
//!
//! Order of preference: the `--port` argument, the configured port, then
//! detection. Known USB bridges (built-in table or remembered in the
//! ports config) are offered before anything else.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    otaboot::{DetectedPort, PortInfo, discover_ports},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

fn select_non_interactive_port(
    mut selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match selection_ports.len() {
        0 => Err(usage_err("No serial port available")),
        1 => {
            let port = selection_ports.remove(0);
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        n => Err(usage_err(&format!(
            "Found {n} serial ports, multiple candidates in non-interactive mode; pass --port"
        ))),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("No serial ports found; connect the board or pass --port"));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let mut selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    if selection_ports.len() > 1 {
        ensure_interactive_terminal()?;
        return select_port_interactive(selection_ports, config);
    }

    let port = selection_ports.remove(0);
    let is_known = is_known_device(&port, config);
    if is_known && !options.confirm_port {
        info!("Auto-selected port: {} [{}]", port.name, port.device.name());
        Ok(SelectedPort { port, is_known })
    } else {
        ensure_interactive_terminal()?;
        confirm_single_port(port)
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// Find a port by name, falling back to a bare entry for unlisted paths.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = discover_ports();
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: port.device.is_known(),
        },
        None => SelectedPort {
            port: DetectedPort::from(PortInfo::plain(name)),
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (from config or built-in list).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
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

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Known USB bridges are highlighted").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    let max_item_width = (console::Term::stderr().size().1 as usize).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bootloader's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled)?;
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember the USB bridge of a port that was not recognised.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} as a bootloader bridge?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort::from(PortInfo {
            vid: Some(vid),
            pid: Some(pid),
            ..PortInfo::plain(name)
        })
    }

    fn usage_error(result: Result<SelectedPort>) -> bool {
        result
            .err()
            .and_then(|e| {
                e.downcast_ref::<CliError>()
                    .map(|c| matches!(c, CliError::Usage(_)))
            })
            .unwrap_or(false)
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_is_known_device_builtin() {
        let port = usb("/dev/ttyACM0", 0x0483, 0x374B);
        assert!(is_known_device(&port, &Config::default()));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let port = usb("/dev/ttyUSB0", 0x9999, 0x9999);
        assert!(!is_known_device(&port, &Config::default()));
        assert!(!is_known_device(
            &DetectedPort::from(PortInfo::plain("/dev/ttyS0")),
            &Config::default()
        ));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let port = usb("/dev/ttyUSB0", 0xABCD, 0x1234);
        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&port, &config));
    }

    #[test]
    fn test_explicit_unlisted_port_is_kept() {
        let selected = select_serial_port(
            &SerialOptions {
                port: Some("/dev/otaboot-test-does-not-exist".to_string()),
                ..SerialOptions::default()
            },
            &Config::default(),
        )
        .unwrap();
        assert_eq!(selected.port.name, "/dev/otaboot-test-does-not-exist");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_label_truncates_to_width() {
        let mut port = usb("/dev/verylongttyacm0", 0x0483, 0x374B);
        port.product = Some("Very Long Product Name That Would Wrap".to_string());
        let label = port_label(&port, &Config::default());

        let truncated = truncate_str(&label, 26, "…").into_owned();
        assert!(measure_text_width(&truncated) <= 26);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![
            DetectedPort::from(PortInfo::plain("/dev/ttyUSB0")),
            DetectedPort::from(PortInfo::plain("/dev/ttyUSB1")),
        ];
        assert!(usage_error(select_non_interactive_port(ports, &Config::default())));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        assert!(usage_error(select_non_interactive_port(vec![], &Config::default())));
    }

    #[test]
    fn test_select_non_interactive_single_port_returns_selected_port() {
        let ports = vec![usb("/dev/ttyACM0", 0x0483, 0x374B)];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyACM0");
        assert!(selected.is_known);
    }
}
