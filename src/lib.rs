//! # Tether
//!
//! Device node link manager for DaemonOS - the subsystem of the device
//! manager that materializes, arbitrates, and retires the stable
//! symlinks device rules request under `/dev`.
//!
//! ## Features
//!
//! - **Claim Index**: On-disk stack of devices contending for a link
//! - **Priority Arbitration**: Highest devlink priority wins, self wins ties
//! - **Atomic Publication**: Staged rename, never a torn or absolute link
//! - **Fixpoint Loop**: Re-publishes until the claim index is quiescent
//! - **Node Finalization**: Ownership, mode, security labels, timestamps
//!
//! All coordination state lives in the filesystem; worker processes
//! cooperate purely through the claim index and atomic renames.

pub mod config;
pub mod device;
pub mod error;
pub mod escape;
pub mod node;
pub mod path;
pub mod seclabel;
pub mod stack;
pub mod symlink;
pub mod update;

pub use config::LinkerConfig;
pub use device::{Device, DeviceDb};
pub use error::{Error, Result};
pub use node::{add_node, node_permissions_apply, remove_node, NodeAttrs};
pub use symlink::{node_symlink, LinkOutcome};
pub use update::{link_update, update_old_links, LINK_UPDATE_MAX_RETRIES};
