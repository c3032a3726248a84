use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use log::LevelFilter;
use remotefat::remote::RemoteConfig;
use serde::Deserialize;

use crate::{env_utils, logging};

pub const DEFAULT_BAUD: u32 = 2_000_000;

/// Keys accepted in the TOML file; anything left out keeps its default.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    port: Option<String>,
    port_hint: Option<String>,
    baud: Option<u32>,
    batch_timeout_ms: Option<u64>,
    batch_retries: Option<u32>,
    handshake_timeout_ms: Option<u64>,
    staging_sectors: Option<u32>,
    log_json_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub port: Option<String>,
    pub baud: Option<u32>,
    pub log_json_path: Option<PathBuf>,
    pub verbose: u8,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub port: Option<String>,
    pub port_hint: Option<String>,
    pub baud: u32,
    pub batch_timeout_ms: u64,
    pub batch_retries: u32,
    pub handshake_timeout_ms: u64,
    pub staging_sectors: u32,
    pub log_json_path: Option<PathBuf>,
    pub log_level: LevelFilter,
}

impl Default for Settings {
    fn default() -> Self {
        let remote = RemoteConfig::default();
        Self {
            port: None,
            port_hint: None,
            baud: DEFAULT_BAUD,
            batch_timeout_ms: remote.batch_timeout.as_millis() as u64,
            batch_retries: remote.batch_retries,
            handshake_timeout_ms: remote.handshake_timeout.as_millis() as u64,
            staging_sectors: remote.staging_sectors,
            log_json_path: None,
            log_level: LevelFilter::Warn,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file, then `M65FTP_*` variables, then flags.
    pub fn load(cli: &CliOverrides) -> Result<Self> {
        let mut settings = Self::default();

        let config_path = cli
            .config_path
            .clone()
            .or_else(|| env_utils::env_string("M65FTP_CONFIG").map(PathBuf::from));
        if let Some(path) = config_path {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed reading config {}", path.display()))?;
            settings
                .apply_toml(&raw)
                .with_context(|| format!("invalid TOML config {}", path.display()))?;
        }

        settings.apply_env()?;
        settings.apply_cli(cli)?;
        Ok(settings)
    }

    fn apply_toml(&mut self, raw: &str) -> Result<()> {
        let file = toml::from_str::<FileConfig>(raw)?;
        self.port = file.port.or(self.port.take());
        self.port_hint = file.port_hint.or(self.port_hint.take());
        self.baud = file.baud.unwrap_or(self.baud);
        self.batch_timeout_ms = file.batch_timeout_ms.unwrap_or(self.batch_timeout_ms);
        self.batch_retries = file.batch_retries.unwrap_or(self.batch_retries);
        self.handshake_timeout_ms = file.handshake_timeout_ms.unwrap_or(self.handshake_timeout_ms);
        self.staging_sectors = file.staging_sectors.unwrap_or(self.staging_sectors);
        self.log_json_path = file.log_json_path.or(self.log_json_path.take());
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(port) = env_utils::env_string("M65FTP_PORT") {
            self.port = Some(port);
        }
        if let Some(hint) = env_utils::env_string("M65FTP_PORT_HINT") {
            self.port_hint = Some(hint);
        }
        if let Some(path) = env_utils::env_string("M65FTP_LOG_JSON_PATH") {
            self.log_json_path = Some(PathBuf::from(path));
        }
        self.baud = env_utils::parse_env_u32("M65FTP_BAUD", self.baud)?;
        self.batch_timeout_ms =
            env_utils::parse_env_u64("M65FTP_BATCH_TIMEOUT_MS", self.batch_timeout_ms)?;
        self.batch_retries = env_utils::parse_env_u32("M65FTP_BATCH_RETRIES", self.batch_retries)?;
        self.handshake_timeout_ms =
            env_utils::parse_env_u64("M65FTP_HANDSHAKE_TIMEOUT_MS", self.handshake_timeout_ms)?;
        Ok(())
    }

    fn apply_cli(&mut self, cli: &CliOverrides) -> Result<()> {
        if let Some(port) = &cli.port {
            self.port = Some(port.clone());
        }
        if let Some(baud) = cli.baud {
            self.baud = baud;
        }
        if let Some(path) = &cli.log_json_path {
            self.log_json_path = Some(path.clone());
        }
        let env_level = env_utils::env_string("M65FTP_LOG");
        self.log_level = logging::level_from(cli.verbose, env_level.as_deref())?;
        Ok(())
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            batch_retries: self.batch_retries,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            staging_sectors: self.staging_sectors,
            ..RemoteConfig::default()
        }
    }
}
