//! Multi-device supervision: configuration to monitors, start/stop/done.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, Device, DeviceEntry};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, RetryCommandRunner};
use crate::monitor::DeviceMonitor;
use crate::notify::{Notifier, ScriptNotifier};
use crate::resolve::{DeviceLookup, DeviceResolver};
use crate::signal::{self, Signal, Trigger};
use crate::task;

/// Owns one [`DeviceMonitor`] per enabled, resolved device entry.
#[derive(Debug)]
pub struct Supervisor {
    monitors: HashMap<String, Arc<DeviceMonitor>>,
    done: Trigger,
    done_signal: Signal,
}

impl Supervisor {
    /// Builds every monitor from the configuration, in source order.
    ///
    /// Any entry failing validation, identity resolution or construction
    /// fails the whole supervisor; there is no partial start. When no
    /// lookup is supplied, a [`DeviceResolver`] over the standard sysfs
    /// location is attempted; without one, address-only entries fail.
    pub fn new(
        config: &Config,
        lookup: Option<&dyn DeviceLookup>,
        runner: Option<Arc<dyn CommandRunner>>,
    ) -> Result<Self> {
        if config.devices.is_empty() {
            return Err(Error::NoDevices);
        }

        let runner: Arc<dyn CommandRunner> =
            runner.unwrap_or_else(|| Arc::new(RetryCommandRunner::new()));

        let built_resolver;
        let lookup: Option<&dyn DeviceLookup> = match lookup {
            Some(lookup) => Some(lookup),
            None => match DeviceResolver::new() {
                Ok(resolver) => {
                    built_resolver = resolver;
                    Some(&built_resolver)
                }
                Err(err) => {
                    warn!(
                        "address lookup table not available: {err} (will not be able to \
                         monitor devices only defined by SAS address)"
                    );
                    None
                }
            },
        };

        let mut monitors: HashMap<String, Arc<DeviceMonitor>> = HashMap::new();
        let mut seen_output_dirs: HashSet<PathBuf> = HashSet::new();

        for (index, entry) in config.devices.iter().enumerate() {
            if !entry.enabled {
                continue;
            }

            let mut entry = entry.clone();

            if entry.device.is_empty() && entry.address.is_empty() {
                return Err(Error::invalid_argument(format!(
                    "[config:{index}] missing device and address \
                     (needs to have at least one to be monitorable)"
                )));
            }

            if let Some(dir) = entry.config.as_ref().and_then(|c| c.output_dir.as_deref()) {
                if !dir.is_empty() && !seen_output_dirs.insert(PathBuf::from(dir)) {
                    return Err(Error::invalid_argument(format!(
                        "[config:{index}] cannot use same output directory [{dir}] \
                         for multiple devices"
                    )));
                }
            }

            resolve_identity(&mut entry, lookup).map_err(|err| match err {
                Error::DeviceLookupFailed(msg) => {
                    Error::DeviceLookupFailed(format!("[config:{index}] {msg}"))
                }
                other => other,
            })?;

            if monitors.contains_key(&entry.device) {
                return Err(Error::invalid_argument(format!(
                    "[config:{index}] cannot monitor [{}:{}] multiple times",
                    entry.device, entry.address
                )));
            }

            let monitor = build_monitor(&entry, Arc::clone(&runner)).map_err(|err| {
                Error::Generic(format!(
                    "[config:{index}:{}:{}] {err}",
                    entry.device, entry.address
                ))
            })?;

            monitors.insert(entry.device.clone(), Arc::new(monitor));
        }

        let (done, done_signal) = signal::channel();

        Ok(Self {
            monitors,
            done,
            done_signal,
        })
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Starts every monitor concurrently. The supervisor's done signal is
    /// raised only after every monitor's done signal has fired.
    pub fn start(&self, shutdown: &Signal) {
        let mut waiters = JoinSet::new();
        for monitor in self.monitors.values() {
            monitor.start(shutdown);

            let monitor = Arc::clone(monitor);
            waiters.spawn(async move { monitor.wait_done().await });
        }

        let done = self.done.clone();
        tokio::spawn(async move {
            while let Some(result) = waiters.join_next().await {
                if let Err(err) = result {
                    if err.is_panic() {
                        error!("(supervisor) panic recovered: {}", task::panic_message(err));
                    }
                }
            }
            done.trigger();
        });
    }

    /// Broadcasts stop to every monitor. Safe to call multiple times.
    pub fn stop(&self) {
        for monitor in self.monitors.values() {
            monitor.stop();
        }
    }

    /// A signal raised once every monitor has stopped.
    pub fn done(&self) -> Signal {
        self.done_signal.clone()
    }

    pub async fn wait_done(&self) {
        self.done_signal.raised().await;
    }
}

/// Completes a device entry's path/address pair via the lookup table.
///
/// Resolution rules: a configured address wins and resolves to the device
/// path; an unresolvable address falls back to the configured path (clearing
/// the address) or fails the entry; a path-only entry is enriched with its
/// address when the lookup knows it.
fn resolve_identity(entry: &mut DeviceEntry, lookup: Option<&dyn DeviceLookup>) -> Result<()> {
    if !entry.address.is_empty() {
        match lookup {
            Some(lookup) => {
                if let Some(path) = lookup.find_device(&entry.address) {
                    info!(
                        "SAS address [{}] was resolved to device [{path}]",
                        entry.address
                    );
                    entry.device = path;
                } else if entry.device.is_empty() {
                    return Err(Error::DeviceLookupFailed(format!(
                        "SAS address [{}] is not resolvable (not found)",
                        entry.address
                    )));
                } else {
                    warn!(
                        "SAS address [{}] is not resolvable (not found), \
                         using provided device path instead",
                        entry.address
                    );
                    entry.address.clear();
                }
            }
            None => {
                if entry.device.is_empty() {
                    return Err(Error::DeviceLookupFailed(format!(
                        "SAS address [{}] is not resolvable (no lookup table)",
                        entry.address
                    )));
                }
                warn!(
                    "SAS address [{}] is not resolvable (no lookup table), \
                     using provided device path instead",
                    entry.address
                );
                entry.address.clear();
            }
        }
    } else if !entry.device.is_empty() {
        if let Some(lookup) = lookup {
            if let Some(address) = lookup.find_address(&entry.device) {
                info!(
                    "device [{}] was resolved to SAS address [{address}] - consider \
                     [address: {address:?}] instead of [device: {:?}] for your \
                     configuration (more stable across reboots)",
                    entry.device, entry.device
                );
                entry.address = address;
            }
        }
    }

    Ok(())
}

/// Builds the notifier (if configured) and the monitor for one entry.
fn build_monitor(entry: &DeviceEntry, runner: Arc<dyn CommandRunner>) -> Result<DeviceMonitor> {
    let notifier: Option<Arc<dyn Notifier>> = match &entry.script_notifier {
        None => None,
        Some(script_cfg) => {
            let notifier = ScriptNotifier::new(
                &script_cfg.script,
                script_cfg.config.as_ref(),
                Arc::clone(&runner),
            )
            .map_err(|err| {
                Error::Generic(format!("failure creating notification agent: {err}"))
            })?;
            Some(Arc::new(notifier))
        }
    };

    let device = Device {
        source: entry.source,
        path: entry.device.clone(),
        address: entry.address.clone(),
        description: entry.description.clone(),
    };

    DeviceMonitor::new(device, entry.config.as_ref(), runner, notifier)
        .map_err(|err| Error::Generic(format!("failure creating monitoring agent: {err}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;

    struct StubLookup {
        by_address: HashMap<String, String>,
        by_path: HashMap<String, String>,
    }

    impl StubLookup {
        fn new(pairs: &[(&str, &str)]) -> Self {
            let mut by_address = HashMap::new();
            let mut by_path = HashMap::new();
            for (address, path) in pairs {
                by_address.insert(address.to_string(), path.to_string());
                by_path.insert(path.to_string(), address.to_string());
            }
            Self {
                by_address,
                by_path,
            }
        }
    }

    impl DeviceLookup for StubLookup {
        fn find_device(&self, address: &str) -> Option<String> {
            self.by_address.get(address).cloned()
        }

        fn find_address(&self, device_path: &str) -> Option<String> {
            self.by_path.get(device_path).cloned()
        }
    }

    fn seed_file_device(dir: &std::path::Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(
            &path,
            r#"{"join_of_diagnostic_pages":{"element_list":[]}}"#,
        )
        .expect("write device fixture");
        path.to_str().expect("utf8 path").to_string()
    }

    fn file_device_yaml(path: &str) -> String {
        format!(
            "devices:\n  - device: {path}\n    type: 1\n    enabled: true\n"
        )
    }

    fn build(yaml: &str, lookup: Option<&dyn DeviceLookup>) -> Result<Supervisor> {
        let config = Config::from_yaml(yaml)?;
        Supervisor::new(&config, lookup, None)
    }

    #[test]
    fn empty_device_list_is_rejected() {
        let err = build("devices: []\n", None).expect_err("no devices");
        assert!(matches!(err, Error::NoDevices));
    }

    #[test]
    fn disabled_entries_are_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let yaml = format!(
            "devices:\n  - device: {path}\n    type: 1\n    enabled: true\n  - device: /nonexistent\n    type: 1\n    enabled: false\n"
        );

        let supervisor = build(&yaml, None).expect("disabled entry never constructed");
        assert_eq!(supervisor.monitor_count(), 1);
    }

    #[test]
    fn all_disabled_builds_an_idle_supervisor() {
        let yaml = "devices:\n  - device: /dev/sg0\n    enabled: false\n";
        let supervisor = build(yaml, None).expect("nothing to construct");
        assert_eq!(supervisor.monitor_count(), 0);
    }

    #[test]
    fn entry_without_device_and_address_is_rejected() {
        let yaml = "devices:\n  - description: nameless\n    enabled: true\n";
        let err = build(yaml, None).expect_err("missing identity");
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("[config:0]"));
    }

    #[test]
    fn duplicate_output_dirs_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = seed_file_device(tmp.path(), "a.json");
        let b = seed_file_device(tmp.path(), "b.json");
        let yaml = format!(
            "devices:\n  - device: {a}\n    type: 1\n    enabled: true\n    config:\n      output_dir: /tmp/same\n  - device: {b}\n    type: 1\n    enabled: true\n    config:\n      output_dir: /tmp/same\n"
        );

        let err = build(&yaml, None).expect_err("same output dir twice");
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("same output directory"));
        assert!(err.to_string().contains("[config:1]"));
    }

    #[test]
    fn duplicate_device_paths_are_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let yaml = format!(
            "devices:\n  - device: {path}\n    type: 1\n    enabled: true\n  - device: {path}\n    type: 1\n    enabled: true\n"
        );

        let err = build(&yaml, None).expect_err("same device twice");
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("multiple times"));
    }

    #[test]
    fn address_resolves_to_the_device_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let lookup = StubLookup::new(&[("0xabc", path.as_str())]);
        let yaml = "devices:\n  - address: \"0xabc\"\n    type: 1\n    enabled: true\n";
        let supervisor = build(yaml, Some(&lookup)).expect("resolvable address");
        assert_eq!(supervisor.monitor_count(), 1);

        let monitor = supervisor.monitors.get(&path).expect("keyed by resolved path");
        assert_eq!(monitor.device().address, "0xabc", "address is retained");
    }

    #[test]
    fn unresolvable_address_falls_back_to_the_device_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let lookup = StubLookup::new(&[]);
        let yaml = format!(
            "devices:\n  - device: {path}\n    address: \"0xdead\"\n    type: 1\n    enabled: true\n"
        );

        let supervisor = build(&yaml, Some(&lookup)).expect("fallback path");
        let monitor = supervisor.monitors.get(&path).expect("keyed by fallback path");
        assert_eq!(monitor.device().address, "", "stale address is cleared");
    }

    #[test]
    fn unresolvable_address_without_fallback_fails() {
        let lookup = StubLookup::new(&[]);
        let yaml = "devices:\n  - address: \"0xdead\"\n    type: 1\n    enabled: true\n";

        let err = build(yaml, Some(&lookup)).expect_err("no fallback");
        assert!(matches!(err, Error::DeviceLookupFailed(_)));
        assert!(err.to_string().contains("[config:0]"));
        assert!(err.to_string().contains("0xdead"));
    }

    #[test]
    fn address_without_lookup_table_or_fallback_fails() {
        let mut entry = DeviceEntry {
            address: "0xdead".into(),
            enabled: true,
            ..DeviceEntry::default()
        };
        let err = resolve_identity(&mut entry, None).expect_err("no table, no fallback");
        assert!(matches!(err, Error::DeviceLookupFailed(_)));
    }

    #[test]
    fn address_without_lookup_table_uses_the_fallback_path() {
        let mut entry = DeviceEntry {
            device: "/dev/sg7".into(),
            address: "0xdead".into(),
            enabled: true,
            ..DeviceEntry::default()
        };
        resolve_identity(&mut entry, None).expect("fallback without table");
        assert_eq!(entry.device, "/dev/sg7");
        assert_eq!(entry.address, "");
    }

    #[test]
    fn path_only_entries_are_enriched_with_the_address() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let lookup = StubLookup::new(&[("0xbeef", path.as_str())]);
        let yaml = format!("devices:\n  - device: {path}\n    type: 1\n    enabled: true\n");

        let supervisor = build(&yaml, Some(&lookup)).expect("path resolves");
        let monitor = supervisor.monitors.get(&path).expect("keyed by path");
        assert_eq!(monitor.device().address, "0xbeef");
    }

    #[test]
    fn path_only_entries_without_a_known_address_keep_an_empty_one() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let lookup = StubLookup::new(&[]);
        let yaml = format!("devices:\n  - device: {path}\n    type: 1\n    enabled: true\n");

        let supervisor = build(&yaml, Some(&lookup)).expect("path kept");
        let monitor = supervisor.monitors.get(&path).expect("keyed by path");
        assert_eq!(monitor.device().address, "");
    }

    #[test]
    fn notifier_construction_failures_abort_the_supervisor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = seed_file_device(tmp.path(), "ses.json");
        let script = tmp.path().join("alert.sh");
        fs::write(&script, "#!/bin/sh\n").expect("write script");
        // deliberately not executable

        let yaml = format!(
            "devices:\n  - device: {path}\n    type: 1\n    enabled: true\n    script_notifier:\n      script: {}\n",
            script.display()
        );

        let err = build(&yaml, None).expect_err("non-executable notifier script");
        let text = err.to_string();
        assert!(text.contains("failure creating notification agent"), "in: {text}");
        assert!(text.contains("not executable"), "in: {text}");
    }

    #[test]
    fn monitor_construction_failures_carry_the_entry_context() {
        let yaml = "devices:\n  - device: /nonexistent/sesmon-device\n    type: 1\n    enabled: true\n";

        let err = build(yaml, None).expect_err("missing device node");
        let text = err.to_string();
        assert!(text.contains("[config:0:"), "in: {text}");
        assert!(text.contains("failure creating monitoring agent"), "in: {text}");
    }

    #[tokio::test]
    async fn start_stop_raises_done_after_every_monitor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = seed_file_device(tmp.path(), "a.json");
        let b = seed_file_device(tmp.path(), "b.json");
        let yaml = format!(
            "devices:\n  - device: {a}\n    type: 1\n    enabled: true\n  - device: {b}\n    type: 1\n    enabled: true\n"
        );

        let supervisor = build(&yaml, None).expect("two file monitors");
        assert_eq!(supervisor.monitor_count(), 2);

        let (_shutdown_trigger, shutdown) = signal::channel();
        supervisor.start(&shutdown);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!supervisor.done().is_raised(), "monitors are still running");

        supervisor.stop();
        supervisor.stop();

        tokio::time::timeout(Duration::from_secs(5), supervisor.wait_done())
            .await
            .expect("done after broadcast stop");
    }

    #[tokio::test]
    async fn context_cancellation_stops_every_monitor() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = seed_file_device(tmp.path(), "a.json");
        let yaml = file_device_yaml(&a);

        let supervisor = build(&yaml, None).expect("one file monitor");

        let (shutdown_trigger, shutdown) = signal::channel();
        supervisor.start(&shutdown);
        shutdown_trigger.trigger();

        tokio::time::timeout(Duration::from_secs(5), supervisor.wait_done())
            .await
            .expect("done after cancellation");
    }

    #[tokio::test]
    async fn supervisor_with_no_monitors_finishes_immediately() {
        let yaml = "devices:\n  - device: /dev/sg0\n    enabled: false\n";
        let supervisor = build(yaml, None).expect("idle supervisor");

        let (_shutdown_trigger, shutdown) = signal::channel();
        supervisor.start(&shutdown);

        tokio::time::timeout(Duration::from_secs(5), supervisor.wait_done())
            .await
            .expect("done fires with zero monitors");
    }
}
