//! SAS address resolution from the SCSI generic sysfs class.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};

/// Default sysfs class directory exposing SCSI generic devices.
const SCSI_GENERIC_CLASS: &str = "/sys/class/scsi_generic";

/// Contract for bidirectional SAS address / device path resolution.
pub trait DeviceLookup: Send + Sync {
    /// Resolves a SAS address to a device path.
    fn find_device(&self, address: &str) -> Option<String>;

    /// Resolves a device path back to a SAS address.
    fn find_address(&self, device_path: &str) -> Option<String>;
}

/// The principal [`DeviceLookup`]: a one-shot index over sysfs.
///
/// Built at startup by reading `sg*/device/sas_address` below the class
/// directory. Addresses are trimmed and lowercased; an address observed on
/// more than one device node is ambiguous and dropped from the index with a
/// warning so it can never resolve to the wrong device.
#[derive(Debug)]
pub struct DeviceResolver {
    devices: HashMap<String, String>,
}

impl DeviceResolver {
    /// Builds the index from the standard sysfs location.
    pub fn new() -> Result<Self> {
        Self::with_root(Path::new(SCSI_GENERIC_CLASS))
    }

    /// Builds the index from an alternative class directory.
    pub fn with_root(root: &Path) -> Result<Self> {
        let entries = fs::read_dir(root)
            .map_err(|err| Error::io(format!("failure listing {}: {err}", root.display())))?;

        let mut devices: HashMap<String, String> = HashMap::new();
        let mut ambiguous: Vec<String> = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with("sg") {
                continue;
            }

            let Ok(raw) = fs::read_to_string(root.join(name).join("device").join("sas_address"))
            else {
                continue;
            };
            let address = raw.trim().to_ascii_lowercase();
            if address.is_empty() {
                continue;
            }

            let node = format!("/dev/{name}");
            if devices.insert(address.clone(), node).is_some() && !ambiguous.contains(&address) {
                ambiguous.push(address);
            }
        }

        for address in ambiguous {
            warn!(
                "SAS address [{address}] came up for multiple devices \
                 (ignoring it for address lookups)"
            );
            devices.remove(&address);
        }

        Ok(Self { devices })
    }

    /// Number of resolvable addresses in the index.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceLookup for DeviceResolver {
    fn find_device(&self, address: &str) -> Option<String> {
        self.devices.get(address).cloned()
    }

    fn find_address(&self, device_path: &str) -> Option<String> {
        self.devices
            .iter()
            .find(|(_, node)| node.as_str() == device_path)
            .map(|(address, _)| address.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_sg(root: &Path, name: &str, sas_address: &str) {
        let device_dir = root.join(name).join("device");
        fs::create_dir_all(&device_dir).expect("create sysfs fixture dirs");
        fs::write(device_dir.join("sas_address"), sas_address).expect("write sas_address");
    }

    #[test]
    fn resolves_a_single_device_both_ways() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "0x500a098012345678\n");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert_eq!(resolver.len(), 1);
        assert_eq!(
            resolver.find_device("0x500a098012345678").as_deref(),
            Some("/dev/sg0")
        );
        assert_eq!(
            resolver.find_address("/dev/sg0").as_deref(),
            Some("0x500a098012345678")
        );
    }

    #[test]
    fn resolves_multiple_distinct_devices() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "0xaaa\n");
        seed_sg(tmp.path(), "sg1", "0xbbb\n");
        seed_sg(tmp.path(), "sg25", "0xccc\n");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert_eq!(resolver.len(), 3);
        assert_eq!(resolver.find_device("0xbbb").as_deref(), Some("/dev/sg1"));
        assert_eq!(resolver.find_device("0xccc").as_deref(), Some("/dev/sg25"));
    }

    #[test]
    fn normalizes_case_and_whitespace() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "  0x500A098012345678\t\n");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert_eq!(
            resolver.find_device("0x500a098012345678").as_deref(),
            Some("/dev/sg0")
        );
        assert_eq!(resolver.find_device("0x500A098012345678"), None);
    }

    #[test]
    fn ambiguous_addresses_are_dropped_from_the_index() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "0xabc\n");
        seed_sg(tmp.path(), "sg1", "0xabc\n");
        seed_sg(tmp.path(), "sg2", "0xdef\n");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.find_device("0xabc"), None);
        assert_eq!(resolver.find_address("/dev/sg0"), None);
        assert_eq!(resolver.find_address("/dev/sg1"), None);
        assert_eq!(resolver.find_device("0xdef").as_deref(), Some("/dev/sg2"));
    }

    #[test]
    fn empty_addresses_and_foreign_entries_are_skipped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "   \n");
        seed_sg(tmp.path(), "nvme0", "0xaaa\n");
        fs::create_dir_all(tmp.path().join("sg9").join("device")).expect("sg9 without address");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert!(resolver.is_empty());
    }

    #[test]
    fn missing_class_directory_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("does-not-exist");
        let err = DeviceResolver::with_root(&missing).expect_err("must fail");
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn unknown_lookups_return_none() {
        let tmp = tempfile::tempdir().expect("tempdir");
        seed_sg(tmp.path(), "sg0", "0xaaa\n");

        let resolver = DeviceResolver::with_root(tmp.path()).expect("build index");
        assert_eq!(resolver.find_device("0xzzz"), None);
        assert_eq!(resolver.find_address("/dev/sg7"), None);
    }
}
