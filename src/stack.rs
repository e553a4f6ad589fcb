//! Claim index and priority arbitration
//!
//! Every stable link name owns a directory under `<run>/links/`, holding
//! one empty file per claiming device. The directory is the authoritative
//! set of live claims; racing workers coordinate through it and nothing
//! else.

use crate::config::LinkerConfig;
use crate::device::{Device, DeviceDb};
use crate::error::{Error, Result};
use crate::escape::escape_path;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Claim index directory for a stable link.
///
/// The link must live under the device root; its path with the root
/// replaced by a single leading `/` is escaped into one directory
/// component, so `/dev/disk/by-label/ROOT` indexes as
/// `\x2fdisk\x2fby-label\x2fROOT`.
pub fn claim_dir(config: &LinkerConfig, slink: &Path) -> Result<PathBuf> {
    let rel = slink
        .strip_prefix(&config.dev_dir)
        .map_err(|_| Error::BadPath(slink.to_path_buf()))?;
    let rel = rel.to_str().ok_or_else(|| Error::BadPath(slink.to_path_buf()))?;
    if rel.is_empty() {
        return Err(Error::BadPath(slink.to_path_buf()));
    }

    let escaped = escape_path(&format!("/{}", rel), libc::PATH_MAX as usize);
    if escaped.is_empty() {
        return Err(Error::BadPath(slink.to_path_buf()));
    }

    Ok(config.links_dir().join(escaped))
}

/// Assert `dev`'s claim on `slink`. Returns the claim file path so the
/// caller can undo the claim if publication fails.
pub fn add_claim(config: &LinkerConfig, dev: &Device, slink: &Path) -> Result<PathBuf> {
    let dir = claim_dir(config, slink)?;
    let file = dir.join(dev.device_id());

    loop {
        match crate::path::mkdir_parents(&file, 0o755) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o444)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(&file)
        {
            Ok(_) => break,
            // the index directory was garbage-collected between the
            // mkdir and the open; re-create it
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(file)
}

/// Drop `dev`'s claim on `slink` (missing claim is fine) and
/// garbage-collect the index directory if that emptied it.
pub fn remove_claim(config: &LinkerConfig, dev: &Device, slink: &Path) -> Result<()> {
    let dir = claim_dir(config, slink)?;
    let file = dir.join(dev.device_id());

    match std::fs::remove_file(&file) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&dir);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Pick the device node that should own a stable link.
///
/// On add, `dev` seeds the candidate set with its own node and priority;
/// claimants found in the index only displace the current candidate with
/// a strictly higher priority, so the seeding device wins its own ties
/// and an established winner survives later equal claims. Claimants
/// whose database record cannot be resolved are skipped; they are either
/// not yet durable or already gone.
///
/// Returns [`Error::NoClaimant`] when neither seed nor index produced a
/// winner, which the updater takes to mean "retire the link".
pub fn find_prioritized(
    db: &DeviceDb,
    dev: &Device,
    add: bool,
    stackdir: &Path,
) -> Result<PathBuf> {
    let mut best: Option<(PathBuf, i32)> = None;

    if add {
        best = Some((dev.node_path()?.to_path_buf(), dev.devlink_priority));
    }

    let entries = match std::fs::read_dir(stackdir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return best.map(|(target, _)| target).ok_or(Error::NoClaimant);
        }
        Err(e) => return Err(e.into()),
    };

    let self_id = dev.device_id();

    for entry in entries {
        let Ok(entry) = entry else { break };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if name.is_empty() || name.starts_with('.') {
            continue;
        }
        // our own claim file never counts twice
        if name == self_id {
            continue;
        }

        debug!("Found '{}' claiming '{}'", name, stackdir.display());

        let Ok(claimant) = db.get(name) else { continue };
        let Some(devname) = claimant.devname else {
            continue;
        };

        match &best {
            Some((_, current)) if claimant.devlink_priority <= *current => {}
            _ => {
                debug!(
                    "Device {} claims priority {} for '{}'",
                    name,
                    claimant.devlink_priority,
                    stackdir.display()
                );
                best = Some((devname, claimant.devlink_priority));
            }
        }
    }

    best.map(|(target, _)| target).ok_or(Error::NoClaimant)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Path) -> LinkerConfig {
        LinkerConfig {
            dev_dir: root.join("dev"),
            run_dir: root.join("run"),
        }
    }

    fn disk(config: &LinkerConfig, minor: u32, priority: i32) -> Device {
        Device {
            devpath: format!("/devices/virtual/block/sd{}", minor),
            subsystem: Some("block".into()),
            devname: Some(config.dev_dir.join(format!("sd{}", minor))),
            major: 8,
            minor,
            devlink_priority: priority,
            devlinks: Vec::new(),
            is_initialized: true,
        }
    }

    #[test]
    fn test_claim_dir_escaping() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let dir = claim_dir(&config, &config.dev_dir.join("disk/by-label/ROOT")).unwrap();
        assert_eq!(
            dir.file_name().unwrap().to_str().unwrap(),
            r"\x2fdisk\x2fby-label\x2fROOT"
        );
    }

    #[test]
    fn test_claim_dir_rejects_foreign_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        assert!(matches!(
            claim_dir(&config, Path::new("/tmp/sneaky")),
            Err(Error::BadPath(_))
        ));
        assert!(matches!(
            claim_dir(&config, &config.dev_dir),
            Err(Error::BadPath(_))
        ));
    }

    #[test]
    fn test_claim_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let dev = disk(&config, 0, 0);
        let slink = config.dev_dir.join("disk/by-label/ROOT");

        let file = add_claim(&config, &dev, &slink).unwrap();
        assert!(file.is_file());
        assert_eq!(file.file_name().unwrap().to_str().unwrap(), "b8:0");

        // claims are idempotent
        add_claim(&config, &dev, &slink).unwrap();

        remove_claim(&config, &dev, &slink).unwrap();
        assert!(!file.exists());
        assert!(!file.parent().unwrap().exists());

        // removing an absent claim is fine
        remove_claim(&config, &dev, &slink).unwrap();
    }

    #[test]
    fn test_selector_prefers_strictly_higher_priority() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let db = DeviceDb::new(config.data_dir());
        let slink = config.dev_dir.join("disk/by-label/ROOT");

        let low = disk(&config, 0, 0);
        let high = disk(&config, 16, 10);
        db.store(&low).unwrap();
        db.store(&high).unwrap();
        add_claim(&config, &low, &slink).unwrap();
        add_claim(&config, &high, &slink).unwrap();

        let stackdir = claim_dir(&config, &slink).unwrap();

        // adding the low-priority device still yields the high claimant
        let winner = find_prioritized(&db, &low, true, &stackdir).unwrap();
        assert_eq!(winner, high.devname.clone().unwrap());

        // equal priority keeps the seeding device
        let rival = disk(&config, 32, 10);
        let winner = find_prioritized(&db, &rival, true, &stackdir).unwrap();
        assert_eq!(winner, rival.devname.clone().unwrap());
    }

    #[test]
    fn test_selector_without_seed() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let db = DeviceDb::new(config.data_dir());
        let slink = config.dev_dir.join("disk/by-label/ROOT");

        let gone = disk(&config, 16, 10);
        let stackdir = claim_dir(&config, &slink).unwrap();

        assert!(matches!(
            find_prioritized(&db, &gone, false, &stackdir),
            Err(Error::NoClaimant)
        ));

        let survivor = disk(&config, 0, 0);
        db.store(&survivor).unwrap();
        add_claim(&config, &survivor, &slink).unwrap();

        let winner = find_prioritized(&db, &gone, false, &stackdir).unwrap();
        assert_eq!(winner, survivor.devname.clone().unwrap());
    }

    #[test]
    fn test_selector_skips_unresolvable_claimants() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let db = DeviceDb::new(config.data_dir());
        let slink = config.dev_dir.join("disk/by-label/ROOT");

        // claim present, record never written
        let phantom = disk(&config, 48, 99);
        add_claim(&config, &phantom, &slink).unwrap();

        let adder = disk(&config, 0, 0);
        let stackdir = claim_dir(&config, &slink).unwrap();
        let winner = find_prioritized(&db, &adder, true, &stackdir).unwrap();
        assert_eq!(winner, adder.devname.clone().unwrap());
    }
}
