//! Configuration management for the GAP managers.
//!
//! Inquiry parameters and LE timeouts are read from a TOML file. Missing
//! fields fall back to the values the Bluetooth Core specification
//! recommends.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hci::{InquiryMode, InquiryScanType};

/// Errors raised while loading or storing configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Main configuration structure.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub bredr: BrEdrConfig,

   #[serde(default)]
   pub le: LeConfig,
}

/// BR/EDR discovery settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BrEdrConfig {
   #[serde(default = "default_inquiry_mode")]
   pub inquiry_mode: InquiryMode,

   /// Inquiry duration in units of 1.28 s.
   #[serde(default = "default_inquiry_length")]
   pub inquiry_length: u8,

   /// Inquiry scan interval in units of 0.625 ms.
   #[serde(default = "default_inquiry_scan_interval")]
   pub inquiry_scan_interval: u16,

   /// Inquiry scan window in units of 0.625 ms.
   #[serde(default = "default_inquiry_scan_window")]
   pub inquiry_scan_window: u16,

   #[serde(default = "default_interlaced_inquiry_scan")]
   pub interlaced_inquiry_scan: bool,
}

/// LE connection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LeConfig {
   #[serde(default = "default_connect_timeout")]
   pub connect_timeout_ms: u64,

   #[serde(default = "default_connection_parameter_update_timeout")]
   pub connection_parameter_update_timeout_ms: u64,
}

const fn default_inquiry_mode() -> InquiryMode {
   InquiryMode::Extended
}

const fn default_inquiry_length() -> u8 {
   0x08
}

const fn default_inquiry_scan_interval() -> u16 {
   0x01E0
}

const fn default_inquiry_scan_window() -> u16 {
   0x0012
}

const fn default_interlaced_inquiry_scan() -> bool {
   true
}

const fn default_connect_timeout() -> u64 {
   20_000
}

const fn default_connection_parameter_update_timeout() -> u64 {
   30_000
}

impl Default for BrEdrConfig {
   fn default() -> Self {
      Self {
         inquiry_mode: default_inquiry_mode(),
         inquiry_length: default_inquiry_length(),
         inquiry_scan_interval: default_inquiry_scan_interval(),
         inquiry_scan_window: default_inquiry_scan_window(),
         interlaced_inquiry_scan: default_interlaced_inquiry_scan(),
      }
   }
}

impl BrEdrConfig {
   pub const fn inquiry_scan_type(&self) -> InquiryScanType {
      if self.interlaced_inquiry_scan {
         InquiryScanType::Interlaced
      } else {
         InquiryScanType::Standard
      }
   }
}

impl Default for LeConfig {
   fn default() -> Self {
      Self {
         connect_timeout_ms: default_connect_timeout(),
         connection_parameter_update_timeout_ms: default_connection_parameter_update_timeout(),
      }
   }
}

impl LeConfig {
   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_millis(self.connect_timeout_ms)
   }

   pub const fn connection_parameter_update_timeout(&self) -> Duration {
      Duration::from_millis(self.connection_parameter_update_timeout_ms)
   }
}

impl Config {
   /// Loads configuration from the default location or creates it.
   pub fn load() -> Result<Self, ConfigError> {
      Self::load_from(&Self::config_path()?)
   }

   /// Loads configuration from `path`, writing the defaults there if the
   /// file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to the default location.
   pub fn save(&self) -> Result<(), ConfigError> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;
      Ok(())
   }

   fn config_path() -> Result<PathBuf, ConfigError> {
      let config_dir = if let Ok(home) = env::var("BT_GAP_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Some(dir) = dirs::config_dir() {
         dir
      } else {
         return Err(ConfigError::ConfigDirNotFound);
      };

      Ok(config_dir.join("bt-gap").join("config.toml"))
   }
}
