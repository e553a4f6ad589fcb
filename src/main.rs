//! Tether worker binary
//!
//! One-shot worker invoked by the device manager (or by hand) to apply
//! or retire a device's node and stable links. Device records are JSON
//! documents; applying one makes it durable in the runtime database so
//! later workers can arbitrate against it.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tether::{
    add_node, remove_node, update_old_links, Device, DeviceDb, LinkerConfig, NodeAttrs,
};
use tracing::info;

/// Tether - Device Node Link Manager
#[derive(Parser, Debug)]
#[command(name = "tether", version, about)]
struct Args {
    /// Device filesystem root
    #[arg(long)]
    dev_dir: Option<PathBuf>,

    /// Runtime state directory
    #[arg(long)]
    run_dir: Option<PathBuf>,

    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Finalize a device node and publish its stable links
    Apply {
        /// JSON device record
        record: PathBuf,
        /// Permission bits (octal)
        #[arg(short, long)]
        mode: Option<String>,
        /// Owning user (name or uid)
        #[arg(short, long)]
        owner: Option<String>,
        /// Owning group (name or gid)
        #[arg(short, long)]
        group: Option<String>,
        /// Security label as module=label (repeatable)
        #[arg(long = "seclabel")]
        seclabels: Vec<String>,
        /// Re-apply security labels even when permissions already match
        #[arg(long)]
        apply_mac: bool,
        /// Do not persist the record; the device stays provisional
        #[arg(long)]
        provisional: bool,
    },
    /// Retire a device's stable links and drop its record
    Remove {
        /// JSON device record, or a stored device id (e.g. b8:0)
        device: String,
    },
    /// Retire links held by an old revision of a device that the new
    /// revision no longer declares
    Reconcile {
        /// Current JSON device record
        record: PathBuf,
        /// Previous JSON device record
        old_record: PathBuf,
    },
    /// Show a stored device record
    Info { id: String },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let mut config = match &args.config {
        Some(path) => LinkerConfig::load(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => LinkerConfig::default(),
    };
    if let Some(dir) = args.dev_dir {
        config.dev_dir = dir;
    }
    if let Some(dir) = args.run_dir {
        config.run_dir = dir;
    }

    std::fs::create_dir_all(&config.run_dir)?;
    let db = DeviceDb::new(config.data_dir());

    match args.command {
        Commands::Apply {
            record,
            mode,
            owner,
            group,
            seclabels,
            apply_mac,
            provisional,
        } => {
            let mut device = load_record(&record)?;
            let id = device.device_id();

            if provisional {
                device.is_initialized = db.contains(&id);
            } else {
                db.store(&device)?;
                device.is_initialized = true;
            }

            let attrs = NodeAttrs {
                apply_mac,
                mode: mode.as_deref().map(parse_mode).transpose()?,
                uid: owner.as_deref().map(resolve_user).transpose()?,
                gid: group.as_deref().map(resolve_group).transpose()?,
                seclabels: seclabels
                    .iter()
                    .map(|s| parse_seclabel(s))
                    .collect::<Result<_>>()?,
            };

            add_node(&config, &db, &device, &attrs)?;
            info!("Applied device {}", id);
        }

        Commands::Remove { device } => {
            let device = if Path::new(&device).is_file() {
                load_record(Path::new(&device))?
            } else {
                db.get(&device)?
            };

            remove_node(&config, &db, &device)?;
            db.remove(&device.device_id())?;
            info!("Removed device {}", device.device_id());
        }

        Commands::Reconcile { record, old_record } => {
            let mut device = load_record(&record)?;
            let old = load_record(&old_record)?;
            device.is_initialized = db.contains(&device.device_id());

            update_old_links(&config, &db, &device, &old)?;
            info!("Reconciled links of device {}", device.device_id());
        }

        Commands::Info { id } => {
            let device = db.get(&id)?;
            println!("Id:        {}", device.device_id());
            println!("Path:      {}", device.devpath);
            println!("Subsystem: {}", device.subsystem.as_deref().unwrap_or("-"));
            println!(
                "Node:      {}",
                device
                    .devname
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".into())
            );
            println!("Priority:  {}", device.devlink_priority);
            if !device.devlinks.is_empty() {
                println!("Links:");
                for link in &device.devlinks {
                    println!("  {}", link.display());
                }
            }
        }
    }

    Ok(())
}

fn load_record(path: &Path) -> Result<Device> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading device record {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("parsing device record {}", path.display()))
}

fn parse_mode(s: &str) -> Result<u32> {
    u32::from_str_radix(s, 8).map_err(|_| anyhow!("Invalid mode: {}", s))
}

fn parse_seclabel(s: &str) -> Result<(String, String)> {
    let (module, label) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid security label (want module=label): {}", s))?;
    Ok((module.to_string(), label.to_string()))
}

/// Lookup user by name or UID
fn resolve_user(name: &str) -> Result<u32> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }

    let user = nix::unistd::User::from_name(name)?
        .ok_or_else(|| anyhow!("User not found: {}", name))?;
    Ok(user.uid.as_raw())
}

/// Lookup group by name or GID
fn resolve_group(name: &str) -> Result<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }

    let group = nix::unistd::Group::from_name(name)?
        .ok_or_else(|| anyhow!("Group not found: {}", name))?;
    Ok(group.gid.as_raw())
}
