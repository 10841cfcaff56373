//! Configuration file support for picoptic.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PICOPTIC_*)
//! 3. Local config file (./picoptic.toml)
//! 4. Global config file (~/.config/picoptic/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use picoptic::SessionOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-directory configuration file.
pub const LOCAL_CONFIG: &str = "picoptic.toml";

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate of the optical adapter.
    pub baud: Option<u32>,
}

/// Download policy defaults.
///
/// Unset keys fall back to the library defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Skip image data in the bootloader pages.
    pub ignore_protected: Option<bool>,
    /// Skip image data outside program memory.
    pub ignore_out_of_range: Option<bool>,
    /// Download even when the battery reads low.
    pub ignore_battery: Option<bool>,
    /// Lowest acceptable battery voltage.
    pub min_battery_volts: Option<f32>,
    /// Play the completion chime.
    pub chime: Option<bool>,
    /// Erase the application entry page when a download fails.
    pub invalidate_on_failure: Option<bool>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
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

    /// Load configuration from a specific file.
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

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "picoptic").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Port config
        if other.port.serial.is_some() {
            self.port.serial = other.port.serial;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }

        // Flash config
        let flash = other.flash;
        self.flash.ignore_protected = flash.ignore_protected.or(self.flash.ignore_protected);
        self.flash.ignore_out_of_range = flash
            .ignore_out_of_range
            .or(self.flash.ignore_out_of_range);
        self.flash.ignore_battery = flash.ignore_battery.or(self.flash.ignore_battery);
        self.flash.min_battery_volts = flash.min_battery_volts.or(self.flash.min_battery_volts);
        self.flash.chime = flash.chime.or(self.flash.chime);
        self.flash.invalidate_on_failure = flash
            .invalidate_on_failure
            .or(self.flash.invalidate_on_failure);
    }

    /// Session options with the configured policy applied over the defaults.
    pub fn session_options(&self) -> SessionOptions {
        let defaults = SessionOptions::default();
        SessionOptions {
            ignore_protected: self
                .flash
                .ignore_protected
                .unwrap_or(defaults.ignore_protected),
            ignore_battery: self
                .flash
                .ignore_battery
                .unwrap_or(defaults.ignore_battery),
            min_battery_volts: self
                .flash
                .min_battery_volts
                .unwrap_or(defaults.min_battery_volts),
            chime: self
                .flash
                .chime
                .unwrap_or(defaults.chime),
            invalidate_on_failure: self
                .flash
                .invalidate_on_failure
                .unwrap_or(defaults.invalidate_on_failure),
            ..defaults
        }
    }

    /// Remember `serial` as the preferred port in the local config file.
    ///
    /// Other settings already in that file are kept.
    pub fn save_port(&mut self, serial: &str) -> anyhow::Result<()> {
        self.save_port_to(Path::new(LOCAL_CONFIG), serial)
    }

    fn save_port_to(&mut self, path: &Path, serial: &str) -> anyhow::Result<()> {
        let mut local = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        local.port.serial = Some(serial.to_string());

        let content = toml::to_string_pretty(&local)?;
        fs::write(path, content)?;
        info!("Saved port configuration to {}", path.display());

        self.port.serial = Some(serial.to_string());
        Ok(())
    }
}
