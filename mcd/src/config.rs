//! # CONFIGURATION
//!
//! Loads the daemon's startup configuration from a TOML file (`serde` +
//! `toml`), with CLI flags overriding individual fields. A missing or
//! malformed config file is tolerated only when every required field is
//! supplied some other way; a genuinely missing required field is a
//! startup configuration error (exit code 2).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Cli;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
  spi_device: Option<String>,
  sbc_ready_gpio: Option<u32>,
  firmware_ready_gpio: Option<u32>,
  direction_gpio: Option<u32>,
  handshake_timeout_ms: Option<u64>,
  resync_hold_ms: Option<u64>,
  body_cap: Option<usize>,
  plugin_list_path: Option<String>,
  macro_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub spi_device: PathBuf,
  pub sbc_ready_gpio: u32,
  pub firmware_ready_gpio: u32,
  pub direction_gpio: u32,
  pub handshake_timeout: Duration,
  pub resync_hold: Duration,
  pub body_cap: usize,
  pub plugin_list_path: PathBuf,
  pub macro_dir: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read { path: PathBuf, source: std::io::Error },
  #[error("failed to parse config file {path}: {source}")]
  Parse { path: PathBuf, source: toml::de::Error },
  #[error("missing required configuration field `{0}` (set it in the config file or pass the matching flag)")]
  MissingField(&'static str),
}

impl Config {
  /// Loads the file at `config_path` if it exists (absence is not an
  /// error — every field may instead arrive via `cli`), then layers CLI
  /// overrides on top.
  pub fn load(config_path: &Path, cli: &Cli) -> Result<Self, ConfigError> {
    let file = if config_path.exists() {
      let text = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
      })?;
      toml::from_str::<FileConfig>(&text).map_err(|source| ConfigError::Parse {
        path: config_path.to_path_buf(),
        source,
      })?
    } else {
      FileConfig::default()
    };

    let spi_device = cli.spi_device.clone().or(file.spi_device).ok_or(ConfigError::MissingField("spi_device"))?;

    Ok(Self {
      spi_device: PathBuf::from(spi_device),
      sbc_ready_gpio: cli.sbc_ready_gpio.or(file.sbc_ready_gpio).unwrap_or(23),
      firmware_ready_gpio: cli.firmware_ready_gpio.or(file.firmware_ready_gpio).unwrap_or(24),
      direction_gpio: cli.direction_gpio.or(file.direction_gpio).unwrap_or(25),
      handshake_timeout: Duration::from_millis(file.handshake_timeout_ms.unwrap_or(4_000)),
      resync_hold: Duration::from_millis(file.resync_hold_ms.unwrap_or(1_000)),
      body_cap: file.body_cap.unwrap_or(mc_proto::header::DEFAULT_BODY_CAP),
      plugin_list_path: PathBuf::from(cli.plugin_list_path.clone().or(file.plugin_list_path).unwrap_or_else(|| "plugins.list".to_string())),
      macro_dir: PathBuf::from(cli.macro_dir.clone().or(file.macro_dir).unwrap_or_else(|| "macros".to_string())),
    })
  }
}
