//! Device node finalization and the top-level add/remove operations

use crate::config::LinkerConfig;
use crate::device::{Device, DeviceDb};
use crate::error::Result;
use crate::path::proc_self_fd;
use crate::seclabel;
use crate::symlink::node_symlink;
use crate::update::link_update;
use nix::unistd::{Gid, Uid};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Requested ownership, mode, and security labels for a device node
#[derive(Debug, Clone, Default)]
pub struct NodeAttrs {
    /// Re-apply security labels even when mode and ownership already match
    pub apply_mac: bool,
    /// Permission bits; `None` preserves the current bits
    pub mode: Option<u32>,
    /// Owning user; `None` preserves the current owner
    pub uid: Option<u32>,
    /// Owning group; `None` preserves the current group
    pub gid: Option<u32>,
    /// Explicit per-module security labels as (module, label) pairs
    pub seclabels: Vec<(String, String)>,
}

/// Apply ownership, permission bits, and security labels to `dev`'s node
/// and refresh its timestamp.
///
/// The node is opened `O_PATH|O_NOFOLLOW` and verified to still be the
/// device we were dispatched for (file type and device number): events
/// race removals, and a node that disappeared or was already replaced by
/// another device must be left alone.
pub fn node_permissions_apply(dev: &Device, attrs: &NodeAttrs) -> Result<()> {
    let devnode = dev.node_path()?;
    let kind = if dev.is_block() {
        libc::S_IFBLK
    } else {
        libc::S_IFCHR
    };

    let node = match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_PATH | libc::O_NOFOLLOW | libc::O_CLOEXEC)
        .open(devnode)
    {
        Ok(node) => node,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(
                "Device node {} is missing, skipping handling",
                devnode.display()
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let md = node.metadata()?;
    // the type bits only take part in the identity check when a mode was
    // requested; without one the device number alone decides
    if (attrs.mode.is_some() && md.mode() & libc::S_IFMT != kind) || md.rdev() != dev.devnum() {
        debug!(
            "Found node '{}' with non-matching devnum {}, skipping handling",
            devnode.display(),
            dev.device_id()
        );
        return Ok(());
    }

    let apply_mode = attrs.mode.is_some_and(|m| md.mode() & 0o777 != m & 0o777);
    let apply_uid = attrs.uid.is_some_and(|u| md.uid() != u);
    let apply_gid = attrs.gid.is_some_and(|g| md.gid() != g);

    if apply_mode || apply_uid || apply_gid || attrs.apply_mac {
        let door = proc_self_fd(node.as_raw_fd());

        if apply_mode || apply_uid || apply_gid {
            debug!(
                "Setting permissions {}, uid={}, gid={}, mode={:o}",
                devnode.display(),
                attrs.uid.unwrap_or_else(|| md.uid()),
                attrs.gid.unwrap_or_else(|| md.gid()),
                attrs.mode.unwrap_or_else(|| md.mode() & 0o777),
            );
            if let Err(e) = chmod_and_chown(&door, attrs) {
                if e.kind() == io::ErrorKind::NotFound {
                    debug!("Failed to set owner/mode of {}: {}", devnode.display(), e);
                } else {
                    error!("Failed to set owner/mode of {}: {}", devnode.display(), e);
                }
            }
        } else {
            debug!(
                "Preserve permissions of {}, uid={}, gid={}, mode={:o}",
                devnode.display(),
                md.uid(),
                md.gid(),
                md.mode() & 0o777,
            );
        }

        let mut selinux = false;
        let mut smack = false;

        for (module, label) in &attrs.seclabels {
            match module.as_str() {
                "selinux" => {
                    selinux = true;
                    if let Err(e) = seclabel::selinux_apply_fd(&node, devnode, label) {
                        error!("Failed to set SELinux label '{}': {}", label, e);
                    }
                }
                "smack" => {
                    smack = true;
                    if let Err(e) = seclabel::smack_apply_fd(&node, Some(label)) {
                        error!("Failed to set SMACK label '{}': {}", label, e);
                    } else {
                        debug!("Set SMACK label '{}'", label);
                    }
                }
                _ => error!(
                    "Unknown security label module, ignoring '{}'='{}'",
                    module, label
                ),
            }
        }

        // unaddressed backends fall back to their defaults
        if !selinux {
            let _ = seclabel::selinux_fix_fd(&node, devnode);
        }
        if !smack {
            let _ = seclabel::smack_apply_fd(&node, None);
        }
    }

    // always update the timestamp when a node is re-used, so consumers
    // notice re-processing (media change events)
    if let Err(e) = touch_node(&proc_self_fd(node.as_raw_fd())) {
        debug!(
            "Failed to adjust timestamp of node {}: {}",
            devnode.display(),
            e
        );
        return Err(e.into());
    }

    Ok(())
}

/// Canonical per-device link: `<dev>/{block,char}/<major>:<minor>`
pub fn dev_num_path(config: &LinkerConfig, dev: &Device) -> PathBuf {
    let kind = if dev.is_block() { "block" } else { "char" };
    config
        .dev_dir
        .join(kind)
        .join(format!("{}:{}", dev.major, dev.minor))
}

/// Finalize a device node and publish all of its stable links.
///
/// Per-link failures are logged and do not stop the remaining links.
pub fn add_node(
    config: &LinkerConfig,
    db: &DeviceDb,
    dev: &Device,
    attrs: &NodeAttrs,
) -> Result<()> {
    let devnode = dev.node_path()?.to_path_buf();
    debug!(
        "Handling device node '{}', devnum={}",
        devnode.display(),
        dev.device_id()
    );

    node_permissions_apply(dev, attrs)?;

    // the canonical number link always points at the node
    let canonical = dev_num_path(config, dev);
    if let Err(e) = node_symlink(dev, &devnode, &canonical) {
        debug!(
            "Failed to update '{}': {}",
            canonical.display(),
            e
        );
    }

    for link in &dev.devlinks {
        if let Err(e) = link_update(config, db, dev, link, true) {
            warn!(
                "Failed to update device symlink '{}', ignoring: {}",
                link.display(),
                e
            );
        }
    }

    Ok(())
}

/// Retire a device's stable links and its canonical number link
pub fn remove_node(config: &LinkerConfig, db: &DeviceDb, dev: &Device) -> Result<()> {
    for link in &dev.devlinks {
        if let Err(e) = link_update(config, db, dev, link, false) {
            warn!(
                "Failed to update device symlink '{}', ignoring: {}",
                link.display(),
                e
            );
        }
    }

    let canonical = dev_num_path(config, dev);
    match std::fs::remove_file(&canonical) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// chown before chmod so a group change cannot strip bits we are about
/// to set anyway
fn chmod_and_chown(door: &Path, attrs: &NodeAttrs) -> io::Result<()> {
    if attrs.uid.is_some() || attrs.gid.is_some() {
        nix::unistd::chown(
            door,
            attrs.uid.map(Uid::from_raw),
            attrs.gid.map(Gid::from_raw),
        )
        .map_err(io::Error::from)?;
    }
    if let Some(mode) = attrs.mode {
        std::fs::set_permissions(door, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

fn touch_node(door: &Path) -> io::Result<()> {
    let c_path = CString::new(door.as_os_str().as_bytes())?;
    let r = unsafe { libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), std::ptr::null(), 0) };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
