//! Device records and the on-disk device database

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A device as the link manager sees it.
///
/// This is the record shape the surrounding daemon hands to the linker
/// and persists in the database; the linker never talks to sysfs itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Kernel device path (for diagnostics)
    pub devpath: String,
    /// Subsystem; anything but "block" is treated as a character device
    pub subsystem: Option<String>,
    /// Absolute path of the device node (e.g. /dev/sda)
    pub devname: Option<PathBuf>,
    /// Major number
    pub major: u32,
    /// Minor number
    pub minor: u32,
    /// Claim priority for stable links; higher wins
    #[serde(default)]
    pub devlink_priority: i32,
    /// Stable link paths this device claims, all under the device root
    #[serde(default)]
    pub devlinks: Vec<PathBuf>,
    /// True once the database record for this device is durable
    #[serde(skip)]
    pub is_initialized: bool,
}

impl Device {
    /// Stable identifier: `b<major>:<minor>` for block devices,
    /// `c<major>:<minor>` for everything else. Used as the claim file
    /// name and the database key.
    pub fn device_id(&self) -> String {
        let kind = if self.is_block() { 'b' } else { 'c' };
        format!("{}{}:{}", kind, self.major, self.minor)
    }

    /// Combined device number
    pub fn devnum(&self) -> libc::dev_t {
        nix::sys::stat::makedev(self.major as u64, self.minor as u64)
    }

    pub fn is_block(&self) -> bool {
        self.subsystem.as_deref() == Some("block")
    }

    /// The device node path, required by every linker operation
    pub fn node_path(&self) -> Result<&Path> {
        self.devname.as_deref().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("device {} has no node", self.devpath),
            ))
        })
    }
}

/// Directory of JSON device records, keyed by device id.
///
/// Records are written to a staging name and renamed into place, so a
/// concurrent reader sees either the previous record or the new one,
/// never a torn write. A device whose record is present here counts as
/// initialized.
#[derive(Debug, Clone)]
pub struct DeviceDb {
    data_dir: PathBuf,
}

impl DeviceDb {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }

    /// Look up a device snapshot by id
    pub fn get(&self, id: &str) -> Result<Device> {
        let content = std::fs::read_to_string(self.record_path(id))?;
        let mut device: Device = serde_json::from_str(&content)?;
        device.is_initialized = true;
        Ok(device)
    }

    /// Persist a record, making the device initialized for later lookups
    pub fn store(&self, device: &Device) -> Result<()> {
        let id = device.device_id();
        let path = self.record_path(&id);
        let staging = self.data_dir.join(format!(".#{}.tmp", id));

        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::write(&staging, serde_json::to_vec_pretty(device)?)?;
        if let Err(e) = std::fs::rename(&staging, &path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }

        debug!("Stored device record {}", id);
        Ok(())
    }

    /// Drop a record; missing is not an error
    pub fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.record_path(id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(major: u32, minor: u32) -> Device {
        Device {
            devpath: format!("/devices/virtual/block/sd{}", minor),
            subsystem: Some("block".into()),
            devname: Some(PathBuf::from(format!("/dev/sd{}", minor))),
            major,
            minor,
            devlink_priority: 0,
            devlinks: Vec::new(),
            is_initialized: false,
        }
    }

    #[test]
    fn test_device_id() {
        assert_eq!(disk(8, 0).device_id(), "b8:0");

        let mut tty = disk(4, 64);
        tty.subsystem = Some("tty".into());
        assert_eq!(tty.device_id(), "c4:64");

        let mut bare = disk(10, 1);
        bare.subsystem = None;
        assert_eq!(bare.device_id(), "c10:1");
    }

    #[test]
    fn test_db_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let db = DeviceDb::new(tmp.path().join("data"));

        let mut dev = disk(8, 0);
        dev.devlink_priority = 5;
        dev.devlinks.push(PathBuf::from("/dev/disk/by-label/ROOT"));
        db.store(&dev).unwrap();

        let loaded = db.get("b8:0").unwrap();
        assert!(loaded.is_initialized);
        assert_eq!(loaded.devlink_priority, 5);
        assert_eq!(loaded.devname.as_deref(), Some(Path::new("/dev/sd0")));

        db.remove("b8:0").unwrap();
        assert!(!db.contains("b8:0"));
        db.remove("b8:0").unwrap();
    }

    #[test]
    fn test_priority_defaults_when_absent() {
        let record = r#"{
            "devpath": "/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda",
            "subsystem": "block",
            "devname": "/dev/sda",
            "major": 8,
            "minor": 0
        }"#;
        let dev: Device = serde_json::from_str(record).unwrap();
        assert_eq!(dev.devlink_priority, 0);
        assert!(dev.devlinks.is_empty());
    }
}
