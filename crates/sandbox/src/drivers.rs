//! Binder and ashmem driver probing and node selection.
//!
//! Each binder role (binder, vndbinder, hwbinder) has an ordered candidate
//! list; the first node present under `/dev` wins. When a role has no node
//! at all we ask the kernel for them, either as module parameters to
//! `binder_linux` or, on binderfs kernels, by allocating the nodes through
//! the control device and linking them into `/dev`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;

use waydroid_core::{Config, Error};

use crate::binderfs::BinderfsInstance;

pub const BINDER_DRIVERS: &[&str] = &["anbox-binder", "puddlejumper", "binder"];
pub const VNDBINDER_DRIVERS: &[&str] = &["anbox-vndbinder", "vndpuddlejumper", "vndbinder"];
pub const HWBINDER_DRIVERS: &[&str] = &["anbox-hwbinder", "hwpuddlejumper", "hwbinder"];

/// The three nodes the container runs on, plus where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverSelection {
    pub binder: String,
    pub vndbinder: String,
    pub hwbinder: String,
}

impl DriverSelection {
    pub fn binder_device(&self) -> PathBuf {
        Path::new("/dev").join(&self.binder)
    }

    /// Reload the names persisted by init.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let w = &cfg.waydroid;
        if w.binder.is_empty() || w.vndbinder.is_empty() || w.hwbinder.is_empty() {
            return Err(Error::DriverUnavailable("binder".into()).into());
        }
        Ok(Self {
            binder: w.binder.clone(),
            vndbinder: w.vndbinder.clone(),
            hwbinder: w.hwbinder.clone(),
        })
    }
}

fn dev_exists(name: &str) -> bool {
    Path::new("/dev").join(name).exists()
}

fn first_existing(candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|name| dev_exists(name))
        .map(|name| name.to_string())
}

/// Whether the kernel knows the binder filesystem (`/proc/filesystems`).
pub fn is_binderfs_loaded() -> bool {
    let text = match fs::read_to_string("/proc/filesystems") {
        Ok(t) => t,
        Err(_) => return false,
    };
    binderfs_in(&text)
}

fn binderfs_in(filesystems: &str) -> bool {
    filesystems
        .lines()
        .any(|line| line.split_whitespace().next_back() == Some("binder"))
}

fn modprobe(module: &str, args: &[String]) {
    let output = Command::new("modprobe").arg(module).args(args).output();
    match output {
        Ok(out) if !out.status.success() => {
            tracing::error!(
                "failed to load {module}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Err(err) => tracing::error!("failed to run modprobe {module}: {err}"),
        _ => {}
    }
}

/// Make sure every binder role has at least one node, loading the driver or
/// allocating binderfs nodes as needed. Missing nodes after this are a
/// selection-time error, not a probe-time one.
pub fn probe_binder_driver() -> Result<()> {
    let mut wanted = Vec::new();
    for candidates in [BINDER_DRIVERS, VNDBINDER_DRIVERS, HWBINDER_DRIVERS] {
        if first_existing(candidates).is_none() {
            wanted.push(candidates[0].to_string());
        }
    }
    if wanted.is_empty() {
        return Ok(());
    }

    if !is_binderfs_loaded() {
        modprobe(
            "binder_linux",
            &[format!("devices=\"{}\"", wanted.join(","))],
        );
    }

    if is_binderfs_loaded() {
        let instance = BinderfsInstance::ensure_mounted()?;
        for name in &wanted {
            if !instance.device_path(name).exists() {
                instance.allocate(name)?;
            }
        }
        instance.link_into_dev()?;
        Ok(())
    } else {
        Err(Error::DriverUnavailable(wanted.remove(0)).into())
    }
}

/// Quiet ashmem probe. Absence is not fatal: the container config flips
/// `sys.use_memfd` instead.
pub fn probe_ashmem_driver() -> bool {
    if !Path::new("/dev/ashmem").exists() {
        modprobe("ashmem_linux", &[]);
    }
    Path::new("/dev/ashmem").exists()
}

/// Pick the three binder nodes for the given vendor type. MAINLINE may
/// allocate nodes of its own; Halium hosts only ever reuse existing nodes
/// and must not touch the plain `binder`/`vndbinder`/`hwbinder` names,
/// which belong to the host's own Android.
pub fn setup_binder_nodes(vendor_type: &str) -> Result<DriverSelection> {
    let mainline = vendor_type == "MAINLINE";
    if mainline {
        probe_binder_driver()?;
    }

    let pick = |candidates: &[&str], role: &str| -> Result<String> {
        let candidates = if mainline {
            candidates
        } else {
            &candidates[..candidates.len() - 1]
        };
        first_existing(candidates)
            .ok_or_else(|| Error::DriverUnavailable(role.to_string()).into())
    };

    Ok(DriverSelection {
        binder: pick(BINDER_DRIVERS, "binder")?,
        vndbinder: pick(VNDBINDER_DRIVERS, "vndbinder")?,
        hwbinder: pick(HWBINDER_DRIVERS, "hwbinder")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binderfs_detected_in_proc_filesystems() {
        let with = "nodev\tsysfs\nnodev\tbinder\n\text4\n";
        let without = "nodev\tsysfs\n\text4\n";
        assert!(binderfs_in(with));
        assert!(!binderfs_in(without));
    }

    #[test]
    fn candidate_lists_put_canonical_names_last() {
        assert_eq!(*BINDER_DRIVERS.last().unwrap(), "binder");
        assert_eq!(*VNDBINDER_DRIVERS.last().unwrap(), "vndbinder");
        assert_eq!(*HWBINDER_DRIVERS.last().unwrap(), "hwbinder");
        assert_eq!(BINDER_DRIVERS.len(), VNDBINDER_DRIVERS.len());
        assert_eq!(BINDER_DRIVERS.len(), HWBINDER_DRIVERS.len());
    }

    #[test]
    fn selection_from_config_requires_all_three() {
        let mut cfg = Config::default();
        assert!(DriverSelection::from_config(&cfg).is_err());

        cfg.waydroid.binder = "binder".into();
        cfg.waydroid.vndbinder = "vndbinder".into();
        cfg.waydroid.hwbinder = "hwbinder".into();
        let sel = DriverSelection::from_config(&cfg).unwrap();
        assert_eq!(sel.binder_device(), PathBuf::from("/dev/binder"));
    }
}
