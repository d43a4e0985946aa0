//! DAQ settings loading and parsing.
//!
//! Parses `mvlcd.toml` (or an override path provided by the caller) into a
//! typed settings structure. Unknown fields are ignored (TOML
//! deserialization tolerance) so configs written for newer versions still
//! load; every field has a default, so an absent file yields a usable
//! configuration.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "mvlcd.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Eth,
    Usb,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "ConnectionConfig::default_kind")]
    pub kind: ConnectionKind,
    /// Hostname or address of the controller; Ethernet only.
    #[serde(default)]
    pub host: String,
    /// Disable active stack triggers instead of failing with "in use".
    #[serde(default)]
    pub force: bool,
}

impl ConnectionConfig {
    const fn default_kind() -> ConnectionKind {
        ConnectionKind::Eth
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: Self::default_kind(),
            host: String::new(),
            force: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadoutConfig {
    #[serde(default = "ReadoutConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u32,
    #[serde(default = "ReadoutConfig::default_buffer_words")]
    pub buffer_words: usize,
    #[serde(default = "ReadoutConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Listfile output path; absent disables recording.
    #[serde(default)]
    pub listfile: Option<PathBuf>,
}

impl ReadoutConfig {
    const fn default_read_timeout_ms() -> u32 {
        100
    }

    const fn default_buffer_words() -> usize {
        // Roughly one megabyte of readout data per buffer.
        256 * 1024
    }

    const fn default_queue_capacity() -> usize {
        8
    }
}

impl Default for ReadoutConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: Self::default_read_timeout_ms(),
            buffer_words: Self::default_buffer_words(),
            queue_capacity: Self::default_queue_capacity(),
            listfile: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisConfig {
    /// Extra worker threads for operator stepping; 0 steps everything on
    /// the stream worker.
    #[serde(default)]
    pub worker_threads: usize,
    /// Abort the run on the first parse error instead of counting it.
    #[serde(default)]
    pub abort_on_error: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub readout: ReadoutConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Original file contents when a file was found.
    pub raw: Option<String>,
    pub file: ConfigFile,
}

/// Best-effort config path: the working directory first, then the
/// platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("mvlcd").join(CONFIG_FILE_NAME);
    }
    PathBuf::from(CONFIG_FILE_NAME)
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config> {
    let path = path.unwrap_or_else(discover);

    if let Ok(content) = fs::read_to_string(&path) {
        let file = toml::from_str::<ConfigFile>(&content)?;
        info!(target: "config", path = %path.display(), "configuration loaded");
        Ok(Config {
            raw: Some(content),
            file,
        })
    } else {
        info!(target: "config", path = %path.display(), "no configuration file, using defaults");
        Ok(Config::default())
    }
}
