//! Application configuration.
//!
//! Settings live in a TOML file written by `offline-deals-client init`:
//!
//! ```toml
//! [api]
//! endpoint = "https://datasets.filedrive.io/"
//! token = ""
//!
//! [car]
//! autoClean = false
//! cleanPeriod = "24h"
//! ```
//!
//! [`SyncerConfig`] is the validated runtime form handed to the syncer.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default dataset API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://datasets.filedrive.io/";

/// Settings as stored in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Dataset API access.
    #[serde(default)]
    pub api: ApiSettings,
    /// Local archive housekeeping.
    #[serde(default)]
    pub car: CarSettings,
}

/// `[api]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSettings {
    /// Base URL of the dataset API.
    pub endpoint: String,
    /// Bearer token for the dataset API.
    #[serde(default)]
    pub token: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: String::new(),
        }
    }
}

/// `[car]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarSettings {
    /// Delete a deal's archive when its record is evicted after import.
    #[serde(rename = "autoClean", default)]
    pub auto_clean: bool,
    /// How long an imported record is kept, e.g. `"24h"` or `"90m"`.
    #[serde(rename = "cleanPeriod")]
    pub clean_period: String,
}

impl Default for CarSettings {
    fn default() -> Self {
        Self {
            auto_clean: false,
            clean_period: "24h".to_string(),
        }
    }
}

impl CarSettings {
    /// Parse the clean period.
    pub fn clean_period(&self) -> Result<Duration> {
        parse_duration(&self.clean_period)
            .map_err(|e| Error::Config(format!("parse cleanPeriod error, {e}")))
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("fail to load app config {}: {}", path.display(), e))
        })?;
        let settings: Settings = toml::from_str(&text)?;
        tracing::info!(
            endpoint = %settings.api.endpoint,
            auto_clean = settings.car.auto_clean,
            clean_period = %settings.car.clean_period,
            "configuration loaded from {}",
            path.display()
        );
        Ok(settings)
    }

    /// Render the settings as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Write the settings to `path`, creating its parent directory.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

/// Validated runtime configuration for the syncer.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Base URL of the dataset API.
    pub endpoint: String,
    /// Bearer token for the dataset API.
    pub token: String,
    /// Delete archives of evicted imported records.
    pub auto_clean: bool,
    /// Age after which an imported record is evicted.
    pub clean_period: Duration,
    /// Age after which any record is evicted.
    pub stale_after: Duration,
    /// Ledger snapshot file.
    pub ledger_path: PathBuf,
    /// Directory holding `<cid>.car` archives.
    pub car_dir: PathBuf,
    /// Capacity of each work queue.
    pub queue_capacity: usize,
    /// Time between reconciliation cycles.
    pub reconcile_interval: Duration,
    /// Blocks fetched ahead of the archive writer.
    pub export_window: usize,
}

impl SyncerConfig {
    /// Derive the runtime configuration from file settings and a data directory.
    ///
    /// Fails if the clean period cannot be parsed.
    pub fn from_settings(settings: &Settings, data_dir: &Path) -> Result<Self> {
        Ok(Self {
            endpoint: settings.api.endpoint.clone(),
            token: settings.api.token.clone(),
            auto_clean: settings.car.auto_clean,
            clean_period: settings.car.clean_period()?,
            ledger_path: data_dir.join("deals"),
            car_dir: data_dir.join("car"),
            ..Self::with_defaults(data_dir)
        })
    }

    /// Defaults rooted at `data_dir`.
    pub fn with_defaults(data_dir: &Path) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: String::new(),
            auto_clean: false,
            clean_period: Duration::from_secs(24 * 3600),
            stale_after: Duration::from_secs(24 * 3600),
            ledger_path: data_dir.join("deals"),
            car_dir: data_dir.join("car"),
            queue_capacity: 1000,
            reconcile_interval: Duration::from_secs(300), // 5 minutes
            export_window: 8,
        }
    }
}

/// Parse a Go-style duration string (`"300ms"`, `"1.5h"`, `"2h45m"`).
///
/// Valid units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A lone `"0"`
/// is accepted; signs are not.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let text = input.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err(format!("invalid duration {input:?}"));
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration {input:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(format!("missing unit in duration {input:?}")),
            unit => return Err(format!("unknown unit {unit:?} in duration {input:?}")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("invalid duration {input:?}"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
