//! binderfs node allocation.
//!
//! When the kernel exposes binder as a filesystem, missing device nodes are
//! allocated through the `binder-control` ioctl and symlinked into `/dev`
//! where both the container config and the host-side RPC layer expect them.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::mount::{MsFlags, mount};

pub const BINDERFS_MOUNT_POINT: &str = "/dev/binderfs";
const CONTROL_NODE: &str = "binder-control";

const BINDERFS_MAX_NAME: usize = 255;

/// Kernel's `struct binderfs_device`: a fixed 256-byte name buffer followed
/// by the allocated major/minor pair, 264 bytes total.
#[repr(C)]
struct BinderfsDevice {
    name: [u8; BINDERFS_MAX_NAME + 1],
    major: u32,
    minor: u32,
}

impl BinderfsDevice {
    fn new(name: &str) -> Result<Self> {
        if name.len() > BINDERFS_MAX_NAME {
            bail!("binder device name too long: {name}");
        }
        let mut dev = Self {
            name: [0u8; BINDERFS_MAX_NAME + 1],
            major: 0,
            minor: 0,
        };
        dev.name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(dev)
    }
}

nix::ioctl_readwrite!(binder_ctl_add, b'b', 1, BinderfsDevice);

/// A mounted binderfs instance. Mounting is idempotent; the instance is
/// left mounted on drop since the nodes stay in use by the container.
pub struct BinderfsInstance {
    mount_point: PathBuf,
}

impl BinderfsInstance {
    /// Mount binderfs at the well-known mount point, creating it if needed.
    pub fn ensure_mounted() -> Result<Self> {
        let mount_point = PathBuf::from(BINDERFS_MOUNT_POINT);
        fs::create_dir_all(&mount_point)
            .with_context(|| format!("failed to create {}", mount_point.display()))?;

        if !mount_point.join(CONTROL_NODE).exists() {
            mount(
                Some("binder"),
                &mount_point,
                Some("binder"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .with_context(|| format!("failed to mount binderfs at {}", mount_point.display()))?;
            tracing::info!("mounted binderfs at {}", mount_point.display());
        }

        Ok(Self { mount_point })
    }

    pub fn device_path(&self, name: &str) -> PathBuf {
        self.mount_point.join(name)
    }

    /// Allocate a binder node, returning its (major, minor). Allocating a
    /// name that already exists fails with EEXIST; callers check first.
    pub fn allocate(&self, name: &str) -> Result<(u32, u32)> {
        let control = fs::File::open(self.mount_point.join(CONTROL_NODE))
            .with_context(|| format!("failed to open {}/{CONTROL_NODE}", self.mount_point.display()))?;

        let mut dev = BinderfsDevice::new(name)?;
        unsafe { binder_ctl_add(control.as_raw_fd(), &mut dev) }
            .with_context(|| format!("failed to allocate binder node {name}"))?;

        tracing::info!(
            "allocated binder node {name} ({}:{})",
            dev.major,
            dev.minor
        );
        Ok((dev.major, dev.minor))
    }

    /// Symlink every node of this instance into `/dev` so consumers can use
    /// the canonical `/dev/<name>` paths.
    pub fn link_into_dev(&self) -> Result<()> {
        for entry in fs::read_dir(&self.mount_point)? {
            let entry = entry?;
            let name = entry.file_name();
            if name == CONTROL_NODE {
                continue;
            }
            let link = Path::new("/dev").join(&name);
            if link.exists() {
                continue;
            }
            symlink(entry.path(), &link)
                .with_context(|| format!("failed to symlink {}", link.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_is_the_264_byte_kernel_layout() {
        assert_eq!(std::mem::size_of::<BinderfsDevice>(), 264);
    }

    #[test]
    fn descriptor_carries_nul_terminated_name() {
        let dev = BinderfsDevice::new("anbox-binder").unwrap();
        assert_eq!(&dev.name[..12], b"anbox-binder");
        assert_eq!(dev.name[12], 0);
        assert_eq!(dev.major, 0);
        assert_eq!(dev.minor, 0);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let name = "x".repeat(BINDERFS_MAX_NAME + 1);
        assert!(BinderfsDevice::new(&name).is_err());
    }
}
