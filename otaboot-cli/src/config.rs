//! Configuration file support for otaboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (OTABOOT_*)
//! 3. Local config file (./otaboot.toml or ./otaboot_ports.toml)
//! 4. Global config file (~/.config/otaboot/config.toml)

use {
    directories::ProjectDirs,
    log::{debug, info, warn},
    otaboot::SenderConfig,
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    },
};

const LOCAL_CONFIG: &str = "otaboot.toml";
const LOCAL_PORTS: &str = "otaboot_ports.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Upload settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Wait for each response line, in milliseconds.
    pub response_timeout_ms: Option<u64>,
    /// Resends of a rejected page.
    pub page_retries: Option<u32>,
    /// Do not open the session with START.
    #[serde(default)]
    pub skip_start: bool,
    /// Simulated devices check frame CRCs.
    #[serde(default)]
    pub verify_frame_crc: bool,
}

impl TransferConfig {
    /// Sender settings with the configured overrides applied.
    pub fn sender_config(&self) -> SenderConfig {
        let mut config = SenderConfig::default().with_start(!self.skip_start);
        if let Some(ms) = self.response_timeout_ms {
            config = config.with_response_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = self.page_retries {
            config = config.with_page_retries(retries);
        }
        config
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Transfer configuration.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config.port = ports_config;
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    fn load_ports_config() -> Option<PortConfig> {
        let global = Self::global_config_dir().map(|dir| dir.join("ports.toml"));
        [Some(PathBuf::from(LOCAL_PORTS)), global]
            .into_iter()
            .flatten()
            .filter(|path| path.exists())
            .find_map(|path| {
                let content = fs::read_to_string(&path).ok()?;
                let config = toml::from_str(&content).ok()?;
                debug!("Loaded ports config from {}", path.display());
                Some(config)
            })
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "otaboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        self.port.usb_device.extend(other.port.usb_device);

        if other.transfer.response_timeout_ms.is_some() {
            self.transfer.response_timeout_ms = other.transfer.response_timeout_ms;
        }
        if other.transfer.page_retries.is_some() {
            self.transfer.page_retries = other.transfer.page_retries;
        }
        self.transfer.skip_start |= other.transfer.skip_start;
        self.transfer.verify_frame_crc |= other.transfer.verify_frame_crc;
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };
        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        let path = if Path::new(LOCAL_PORTS).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS)
        };

        self.port.usb_device.push(device);

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
