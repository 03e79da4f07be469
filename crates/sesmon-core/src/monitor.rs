//! Per-device monitoring: poll, diff, alert, back off.

use std::fs;
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Device, MonitorOverrides, MonitorSettings, SourceKind};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, RunCommandConfig};
use crate::notify::Notifier;
use crate::parse::{self, ResultMap};
use crate::retry::with_retries;
use crate::signal::{self, Signal, Trigger};
use crate::snapshot::{ChangeReport, DeviceSnapshot, SnapshotWriter};
use crate::task;

/// Owns the monitoring of one enclosure.
///
/// The polling loop runs on its own task; all mutable monitor state lives
/// inside that task. The outside world interacts through [`Self::start`],
/// the idempotent [`Self::stop`] and the awaitable [`Self::done`].
pub struct DeviceMonitor {
    device: Device,
    cfg: MonitorSettings,
    runner: Arc<dyn CommandRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    stop: Trigger,
    stop_signal: Signal,
    done: Trigger,
    done_signal: Signal,
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("device", &self.device)
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl DeviceMonitor {
    /// Validates the device and configuration and builds the monitor.
    pub fn new(
        device: Device,
        cfg: Option<&MonitorOverrides>,
        runner: Arc<dyn CommandRunner>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Result<Self> {
        if device.path.is_empty() {
            return Err(Error::invalid_argument("no device provided"));
        }
        fs::metadata(&device.path)
            .map_err(|err| Error::invalid_argument(format!("stat device failure: {err}")))?;

        let cfg = MonitorSettings::merge(cfg)?;

        let (stop, stop_signal) = signal::channel();
        let (done, done_signal) = signal::channel();

        Ok(Self {
            device,
            cfg,
            runner,
            notifier,
            stop,
            stop_signal,
            done,
            done_signal,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.cfg
    }

    /// Signals the polling loop to exit as soon as possible. Idempotent.
    pub fn stop(&self) {
        if self.stop.trigger() {
            info!(
                device = %self.device.path,
                address = %self.device.address,
                "monitoring for this device is shutting down"
            );
        }
    }

    /// A signal raised once the polling loop has fully exited.
    pub fn done(&self) -> Signal {
        self.done_signal.clone()
    }

    pub async fn wait_done(&self) {
        self.done_signal.raised().await;
    }

    /// Starts the polling loop on its own task and returns immediately.
    pub fn start(&self, shutdown: &Signal) {
        let span = info_span!(
            "monitor",
            device = %self.device.path,
            address = %self.device.address,
        );

        {
            let _guard = span.enter();
            let cfg_json = serde_json::to_string(&self.cfg).unwrap_or_else(|_| "n/a".into());
            match &self.notifier {
                None => info!(
                    "monitoring [{}:{}] with configuration [{}]; and no notification agent",
                    self.device.path, self.device.address, cfg_json
                ),
                Some(notifier) => info!(
                    "monitoring [{}:{}] with configuration [{}]; \
                     and notification agent [{}] with configuration [{}]",
                    self.device.path,
                    self.device.address,
                    cfg_json,
                    notifier.name(),
                    notifier.config()
                ),
            }
        }

        let mut poll_loop = PollLoop {
            device: self.device.clone(),
            cfg: self.cfg.clone(),
            runner: Arc::clone(&self.runner),
            notifier: self.notifier.clone(),
            writer: self.cfg.output_dir.clone().map(SnapshotWriter::new),
            shutdown: shutdown.clone(),
            stop: self.stop.clone(),
            stop_signal: self.stop_signal.clone(),
            previous: None,
            last_alert_hash: String::new(),
            poll_failures: 0,
        };

        let inner = tokio::spawn(async move { poll_loop.run().await }.instrument(span.clone()));

        let stop = self.stop.clone();
        let done = self.done.clone();
        tokio::spawn(
            async move {
                if let Err(err) = inner.await {
                    if err.is_panic() {
                        error!("(monitor) panic recovered: {}", task::panic_message(err));
                    }
                }
                if stop.trigger() {
                    info!("monitoring for this device is shutting down");
                }
                done.trigger();
            }
            .instrument(span),
        );
    }
}

/// The loop-owned state and collaborators of one running monitor.
struct PollLoop {
    device: Device,
    cfg: MonitorSettings,
    runner: Arc<dyn CommandRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    writer: Option<SnapshotWriter>,
    shutdown: Signal,
    stop: Trigger,
    stop_signal: Signal,

    previous: Option<ResultMap>,
    last_alert_hash: String,
    poll_failures: u32,
}

impl PollLoop {
    async fn run(&mut self) {
        if let Err(err) = self.poll().await {
            self.poll_failure(err).await;
        }

        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick

        let shutdown = self.shutdown.clone();
        let stop = self.stop_signal.clone();
        loop {
            tokio::select! {
                _ = shutdown.raised() => return,
                _ = stop.raised() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll().await {
                        self.poll_failure(err).await;
                    }
                }
            }
        }
    }

    /// One full poll: fetch, parse, persist, diff, alert.
    async fn poll(&mut self) -> Result<()> {
        let raw = self
            .fetch()
            .await
            .map_err(|err| Error::Generic(format!("failure fetching from device: {err}")))?;

        let current = parse::parse_ses(&raw)
            .map_err(|err| Error::Generic(format!("failure parsing fetched data: {err}")))?;

        if let Some(writer) = &self.writer {
            self.write_current(writer, &raw, &current);
        }

        let Some(previous) = self.previous.take() else {
            info!(
                "retrieved {} initial elements from SES-capable device",
                current.len()
            );
            self.previous = Some(current);
            return Ok(());
        };
        if self.cfg.verbose {
            info!(
                "retrieved batch of {} elements from SES-capable device",
                current.len()
            );
        }

        let mut changes = parse::diff_results(&previous, &current);
        if changes.is_empty() {
            if self.cfg.verbose {
                info!("no changes detected comparing previous vs. current results");
            }
            self.previous = Some(current);
            return Ok(());
        }
        if self.cfg.verbose {
            info!(
                "{} changes detected comparing previous vs. current results",
                changes.len()
            );
        }

        let lines = parse::changes_as_text(&mut changes);
        let message = parse::build_message(&lines);
        let hash = hex_sha256(message.as_bytes());

        let report = ChangeReport {
            device: self.device.clone(),
            detected_at: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            changes,
        };

        if !self.last_alert_hash.is_empty() && self.last_alert_hash == hash {
            info!("alert changes match the previous alert - skipping notification");
        } else {
            self.handle_alert(hash, message, report);
        }

        self.previous = Some(current);
        Ok(())
    }

    /// Fetches the raw SES dump, with retries, from file or device.
    async fn fetch(&self) -> Result<Vec<u8>> {
        match self.device.source {
            SourceKind::File => {
                let path = self.device.path.clone();
                let attempts = self.cfg.poll_attempts;

                let (attempt, result) = with_retries(
                    &self.shutdown,
                    || {
                        let path = path.clone();
                        async move {
                            let data = tokio::fs::read(&path).await.map_err(|err| {
                                Error::io(format!("failure reading from file: {err}"))
                            })?;
                            if serde_json::from_slice::<serde_json::Value>(&data).is_err() {
                                return Err(Error::InvalidJson(
                                    "file contents are not valid JSON".into(),
                                ));
                            }
                            Ok(data)
                        }
                    },
                    |attempt, err| warn!("[{attempt}/{attempts}] {err}"),
                    attempts,
                    self.cfg.poll_attempt_interval,
                )
                .await;

                result.map_err(|err| Error::transient(attempt, attempts, err))
            }
            SourceKind::Device => {
                let output = self
                    .runner
                    .run(
                        &self.shutdown,
                        RunCommandConfig {
                            description: "\"sg_ses\"".to_string(),
                            command: "sg_ses".to_string(),
                            args: vec![
                                "--all".to_string(),
                                "--json".to_string(),
                                self.device.path.clone(),
                            ],
                            attempts: self.cfg.poll_attempts,
                            attempt_timeout: self.cfg.poll_attempt_timeout,
                            attempt_interval: self.cfg.poll_attempt_interval,
                            expect_json: true,
                            print_errors: true,
                        },
                    )
                    .await
                    .map_err(|err| Error::Generic(format!("\"sg_ses\": {err}")))?;

                Ok(output.stdout.into_bytes())
            }
        }
    }

    /// Persists the raw and canonical parsed snapshots. Failures are logged
    /// and never count as poll failures.
    fn write_current(&self, writer: &SnapshotWriter, raw: &[u8], parsed: &ResultMap) {
        let captured_at = Local::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        match serde_json::from_slice::<serde_json::Value>(raw) {
            Ok(value) => {
                let snapshot = DeviceSnapshot {
                    device: self.device.clone(),
                    captured_at: captured_at.clone(),
                    raw: value,
                };
                if let Err(err) = writer.write_device_snapshot(&snapshot, "current.json") {
                    warn!("error writing device snapshot to file: {err}");
                }
            }
            Err(err) => warn!("error decoding raw snapshot as JSON: {err}"),
        }

        match serde_json::to_value(parsed) {
            Ok(value) => {
                let snapshot = DeviceSnapshot {
                    device: self.device.clone(),
                    captured_at,
                    raw: value,
                };
                if let Err(err) = writer.write_device_snapshot(&snapshot, "current_parsed.json") {
                    warn!("error writing parsed device snapshot to file: {err}");
                }
            }
            Err(err) => warn!("error marshalling parsed device snapshot to JSON: {err}"),
        }
    }

    /// Emits the alert, dispatches the notifier on an isolated task, writes
    /// the change report and records the alert hash.
    fn handle_alert(&mut self, hash: String, message: String, report: ChangeReport) {
        warn!("Alert: {message}");

        self.last_alert_hash = hash;

        if let Some(notifier) = &self.notifier {
            let notifier = Arc::clone(notifier);
            let shutdown = self.shutdown.clone();
            let device = self.device.clone();
            let report_copy = report.clone();
            task::spawn_logged("alert-notifier", async move {
                if let Err(err) = notifier
                    .notify(&shutdown, &device, &message, Some(&report_copy))
                    .await
                {
                    warn!("alert notification agent error: {err}");
                }
            });
        }

        if let Some(writer) = &self.writer {
            if let Err(err) = writer.write_change_report(&report) {
                warn!("error writing change report to file: {err}");
            }
        }
    }

    /// Failure accounting after one failed poll (retries included).
    async fn poll_failure(&mut self, err: Error) {
        if self.shutdown.is_raised() || self.stop_signal.is_raised() {
            return;
        }

        self.poll_failures += 1;

        if self.poll_failures < self.cfg.poll_backoff_after {
            warn!(
                "error polling device [{}/{}]: {err}",
                self.poll_failures, self.cfg.poll_backoff_after
            );
            return;
        }

        let message = if self.cfg.poll_backoff_stopmonitor {
            format!(
                "Error polling device [{}/{}] (stopping device monitor): {err}",
                self.poll_failures, self.cfg.poll_backoff_after
            )
        } else {
            format!(
                "Error polling device [{}/{}] (entering {} back-off): {err}",
                self.poll_failures,
                self.cfg.poll_backoff_after,
                humantime::format_duration(self.cfg.poll_backoff_time)
            )
        };
        error!("{message}");

        if self.cfg.poll_backoff_notify {
            if let Some(notifier) = &self.notifier {
                let notifier = Arc::clone(notifier);
                let shutdown = self.shutdown.clone();
                let device = self.device.clone();
                task::spawn_logged("failure-notifier", async move {
                    if let Err(err) = notifier.notify(&shutdown, &device, &message, None).await {
                        warn!("alert notification agent error: {err}");
                    }
                });
            }
        }

        if self.cfg.poll_backoff_stopmonitor {
            if self.stop.trigger() {
                info!("monitoring for this device is shutting down");
            }
            return;
        }

        let shutdown = self.shutdown.clone();
        let stop = self.stop_signal.clone();
        let waited = tokio::select! {
            _ = shutdown.raised() => false,
            _ = stop.raised() => false,
            _ = tokio::time::sleep(self.cfg.poll_backoff_time) => true,
        };

        if waited {
            self.poll_failures = 0;
        }
    }
}

/// Hex-encoded SHA-256 over the exact alert message bytes.
fn hex_sha256(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
