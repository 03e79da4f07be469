//! YAML configuration schema and the merged per-device runtime settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::notify::NotifierOverrides;

/// Where a device's SES data comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SourceKind {
    /// A SCSI generic device node polled through `sg_ses`.
    #[default]
    Device,
    /// A regular file containing a JSON dump (used for testing setups).
    File,
}

impl TryFrom<u8> for SourceKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Device),
            1 => Ok(Self::File),
            other => Err(format!("unknown device type {other} (expected 0 or 1)")),
        }
    }
}

impl From<SourceKind> for u8 {
    fn from(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Device => 0,
            SourceKind::File => 1,
        }
    }
}

/// Immutable identity of a monitored device, fixed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "type")]
    pub source: SourceKind,
    pub path: String,
    pub address: String,
    pub description: String,
}

/// Top-level YAML configuration. Unknown keys are rejected.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub disable_timestamps: bool,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl Config {
    /// Parses a YAML configuration document, rejecting unknown keys.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|err| Error::invalid_argument(format!("failure parsing YAML: {err}")))
    }
}

/// One device entry in the YAML configuration.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceEntry {
    #[serde(default)]
    pub device: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type", default)]
    pub source: SourceKind,

    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub config: Option<MonitorOverrides>,

    #[serde(default)]
    pub script_notifier: Option<ScriptNotifierEntry>,
}

/// Script notifier section of a device entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptNotifierEntry {
    pub script: String,

    #[serde(default)]
    pub config: Option<NotifierOverrides>,
}

/// User-supplied monitor configuration; absent fields fall back to defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorOverrides {
    /// How often to poll the target device for data.
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub poll_interval: Option<Duration>,

    /// How often to attempt a device poll (must be > 0).
    #[serde(default)]
    pub poll_attempts: Option<u32>,

    /// How long a device poll attempt can take (multiplies with attempts).
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub poll_attempt_timeout: Option<Duration>,

    /// How long to wait between device poll attempts (in case of failure).
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub poll_attempt_interval: Option<Duration>,

    /// How many consecutive poll failures trigger the back-off period.
    #[serde(default)]
    pub poll_backoff_after: Option<u32>,

    /// How long to pause polling the device when in the back-off period.
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub poll_backoff_time: Option<Duration>,

    /// Dispatch a notification through the agent when entering back-off.
    #[serde(default)]
    pub poll_backoff_notify: Option<bool>,

    /// Permanently stop monitoring the device when entering back-off.
    #[serde(default)]
    pub poll_backoff_stopmonitor: Option<bool>,

    /// Folder to write JSON files of device state and alerts to.
    /// Must be unique per device.
    #[serde(default)]
    pub output_dir: Option<String>,

    /// Also log verbose operational information.
    #[serde(default)]
    pub verbose: Option<bool>,
}

/// Effective monitor settings: the user overrides merged onto the defaults.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSettings {
    #[serde(serialize_with = "human_duration::serialize")]
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    #[serde(serialize_with = "human_duration::serialize")]
    pub poll_attempt_timeout: Duration,
    #[serde(serialize_with = "human_duration::serialize")]
    pub poll_attempt_interval: Duration,
    pub poll_backoff_after: u32,
    #[serde(serialize_with = "human_duration::serialize")]
    pub poll_backoff_time: Duration,
    pub poll_backoff_notify: bool,
    pub poll_backoff_stopmonitor: bool,
    pub output_dir: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(90),
            poll_attempts: 3,
            poll_attempt_timeout: Duration::from_secs(15),
            poll_attempt_interval: Duration::from_secs(15),
            poll_backoff_after: 3,
            poll_backoff_time: Duration::from_secs(3 * 60),
            poll_backoff_notify: true,
            poll_backoff_stopmonitor: false,
            output_dir: None,
            verbose: false,
        }
    }
}

impl MonitorSettings {
    /// Merges user-provided overrides onto the defaults, validating ranges.
    pub fn merge(user: Option<&MonitorOverrides>) -> Result<Self> {
        let mut merged = Self::default();
        let Some(user) = user else {
            return Ok(merged);
        };

        if let Some(interval) = user.poll_interval {
            merged.poll_interval = interval;
        }
        if let Some(attempts) = user.poll_attempts {
            if attempts == 0 {
                return Err(Error::invalid_argument("poll_attempts must be > 0"));
            }
            merged.poll_attempts = attempts;
        }
        if let Some(timeout) = user.poll_attempt_timeout {
            merged.poll_attempt_timeout = timeout;
        }
        if let Some(interval) = user.poll_attempt_interval {
            merged.poll_attempt_interval = interval;
        }
        if let Some(after) = user.poll_backoff_after {
            if after == 0 {
                return Err(Error::invalid_argument("poll_backoff_after must be > 0"));
            }
            merged.poll_backoff_after = after;
        }
        if let Some(time) = user.poll_backoff_time {
            merged.poll_backoff_time = time;
        }
        if let Some(notify) = user.poll_backoff_notify {
            merged.poll_backoff_notify = notify;
        }
        if let Some(stop) = user.poll_backoff_stopmonitor {
            merged.poll_backoff_stopmonitor = stop;
        }
        if let Some(dir) = user.output_dir.as_deref() {
            if !dir.is_empty() {
                merged.output_dir = Some(PathBuf::from(dir));
            }
        }
        if let Some(verbose) = user.verbose {
            merged.verbose = verbose;
        }

        Ok(merged)
    }
}

/// Serde adapter printing durations as humantime strings ("90s", "3m").
pub(crate) mod human_duration {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }
}

/// Serde adapter parsing optional humantime duration fields.
pub(crate) mod human_duration_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(text) => humantime::parse_duration(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
