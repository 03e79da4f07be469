//! Notification agents: the contract and the external-script implementation.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{human_duration, human_duration_opt, Device};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, RunCommandConfig};
use crate::signal::Signal;
use crate::snapshot::ChangeReport;

const EXECUTABLE_MODE_MASK: u32 = 0o111;

/// Contract for a notification agent attached to a device monitor.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        shutdown: &Signal,
        device: &Device,
        message: &str,
        extra: Option<&ChangeReport>,
    ) -> Result<()>;

    fn name(&self) -> &'static str;

    /// Printable configuration summary for startup logging.
    fn config(&self) -> String;
}

/// User-supplied notifier configuration; absent fields fall back to defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifierOverrides {
    /// How often to attempt a notification (must be > 0).
    #[serde(default)]
    pub notify_attempts: Option<u32>,

    /// How long a notification attempt can take (multiplies with attempts).
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub notify_attempt_timeout: Option<Duration>,

    /// How long to wait between notification attempts (in case of failure).
    #[serde(default, deserialize_with = "human_duration_opt::deserialize")]
    pub notify_attempt_interval: Option<Duration>,
}

/// Effective notifier settings: the user overrides merged onto the defaults.
#[derive(Debug, Clone, Serialize)]
pub struct NotifierSettings {
    pub notify_attempts: u32,
    #[serde(serialize_with = "human_duration::serialize")]
    pub notify_attempt_timeout: Duration,
    #[serde(serialize_with = "human_duration::serialize")]
    pub notify_attempt_interval: Duration,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            notify_attempts: 3,
            notify_attempt_timeout: Duration::from_secs(15),
            notify_attempt_interval: Duration::from_secs(15),
        }
    }
}

impl NotifierSettings {
    /// Merges user-provided overrides onto the defaults, validating ranges.
    pub fn merge(user: Option<&NotifierOverrides>) -> Result<Self> {
        let mut merged = Self::default();
        let Some(user) = user else {
            return Ok(merged);
        };

        if let Some(attempts) = user.notify_attempts {
            if attempts == 0 {
                return Err(Error::invalid_argument("notify_attempts must be > 0"));
            }
            merged.notify_attempts = attempts;
        }
        if let Some(timeout) = user.notify_attempt_timeout {
            merged.notify_attempt_timeout = timeout;
        }
        if let Some(interval) = user.notify_attempt_interval {
            merged.notify_attempt_interval = interval;
        }

        Ok(merged)
    }
}

/// A [`Notifier`] executing a user-defined script.
///
/// The script receives these positional arguments:
///   - `$1`: device path (e.g. /dev/sg25)
///   - `$2`: SAS address (e.g. 0x500a098012345678)
///   - `$3`: device description
///   - `$4`: notification message text
///   - `$5`: change report as compact JSON (where applicable)
pub struct ScriptNotifier {
    script: PathBuf,
    cfg: NotifierSettings,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ScriptNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptNotifier")
            .field("script", &self.script)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl ScriptNotifier {
    /// Validates the script (exists, any executable bit) and merges the
    /// notifier configuration.
    pub fn new(
        script: &str,
        cfg: Option<&NotifierOverrides>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        if script.is_empty() {
            return Err(Error::invalid_argument("no script provided"));
        }

        let meta = fs::metadata(script)
            .map_err(|err| Error::io(format!("{script:?}: stat script failure: {err}")))?;
        if meta.permissions().mode() & EXECUTABLE_MODE_MASK == 0 {
            return Err(Error::NotExecutable {
                path: script.to_string(),
            });
        }

        let cfg = NotifierSettings::merge(cfg)?;

        Ok(Self {
            script: PathBuf::from(script),
            cfg,
            runner,
        })
    }
}

#[async_trait]
impl Notifier for ScriptNotifier {
    async fn notify(
        &self,
        shutdown: &Signal,
        device: &Device,
        message: &str,
        extra: Option<&ChangeReport>,
    ) -> Result<()> {
        let script = self.script.display();

        let mut args = vec![
            device.path.clone(),
            device.address.clone(),
            device.description.clone(),
            message.to_string(),
        ];
        if let Some(report) = extra {
            let encoded = serde_json::to_string(report).map_err(|err| {
                Error::Generic(format!("{script}: failure marshalling extra to JSON: {err}"))
            })?;
            args.push(encoded);
        }

        self.runner
            .run(
                shutdown,
                RunCommandConfig {
                    description: format!("{:?}", self.script),
                    command: self.script.display().to_string(),
                    args,
                    attempts: self.cfg.notify_attempts,
                    attempt_timeout: self.cfg.notify_attempt_timeout,
                    attempt_interval: self.cfg.notify_attempt_interval,
                    expect_json: false,
                    print_errors: true,
                },
            )
            .await
            .map_err(|err| Error::Generic(format!("{script}: {err}")))?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "script_notifier"
    }

    fn config(&self) -> String {
        let cfg_json =
            serde_json::to_string(&self.cfg).unwrap_or_else(|_| "n/a".to_string());
        format!("{:?}:{}", self.script, cfg_json)
    }
}
