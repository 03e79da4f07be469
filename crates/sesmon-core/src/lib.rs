pub mod config;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod notify;
pub mod parse;
pub mod resolve;
pub mod retry;
pub mod signal;
pub mod snapshot;
pub mod supervisor;
pub mod task;

pub use config::{Config, Device, DeviceEntry, MonitorOverrides, MonitorSettings, SourceKind};
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, RetryCommandRunner, RunCommandConfig};
pub use monitor::DeviceMonitor;
pub use notify::{Notifier, NotifierOverrides, NotifierSettings, ScriptNotifier};
pub use parse::{parse_ses, Change, ElementResult, ResultMap};
pub use resolve::{DeviceLookup, DeviceResolver};
pub use snapshot::{ChangeReport, DeviceSnapshot, SnapshotWriter};
pub use supervisor::Supervisor;
