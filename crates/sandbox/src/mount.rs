//! Mount layer. Every mount performed on behalf of a container start is
//! recorded in a [`MountLedger`] so a failed start can be reversed in
//! reverse order, and `umount_all` can clear whatever a crashed run left
//! behind by walking `/proc/mounts`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::mount::{MsFlags, mount, umount};

use waydroid_core::Error;
use waydroid_core::version::kernel_version;

/// Mountpoints performed so far, oldest first. Rollback pops from the end.
#[derive(Debug, Default)]
pub struct MountLedger {
    entries: Vec<PathBuf>,
}

impl MountLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, mountpoint: impl Into<PathBuf>) {
        self.entries.push(mountpoint.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget recorded mounts after an out-of-band teardown cleared them.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Undo every recorded mount, newest first. Failures are logged and
    /// skipped; teardown always makes as much progress as it can.
    pub fn rollback(&mut self) {
        while let Some(mountpoint) = self.entries.pop() {
            if !is_mounted(&mountpoint) {
                continue;
            }
            if let Err(err) = umount(&mountpoint) {
                tracing::warn!("failed to unmount {}: {err}", mountpoint.display());
            }
        }
    }
}

/// `ismount()` that also recognizes bind mounts: `/proc/mounts` is the
/// source of truth, and both sides are canonicalized before comparing.
pub fn is_mounted(path: &Path) -> bool {
    let path = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(_) => path.to_path_buf(),
    };
    let mounts = match fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(_) => return false,
    };
    mounts_contain(&mounts, &path)
}

fn mounts_contain(proc_mounts: &str, path: &Path) -> bool {
    for line in proc_mounts.lines() {
        let mut words = line.split_whitespace();
        let source = words.next();
        let mountpoint = words.next();
        if let Some(mp) = mountpoint
            && unescape_mount_path(mp) == *path
        {
            return true;
        }
        if let Some(src) = source
            && Path::new(src) == path
        {
            return true;
        }
    }
    false
}

/// `/proc/mounts` escapes whitespace octally (`\040`); a mountpoint whose
/// backing directory vanished grows a literal `\040(deleted)` suffix.
fn unescape_mount_path(raw: &str) -> PathBuf {
    let raw = raw.strip_suffix("\\040(deleted)").unwrap_or(raw);
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3
                && let Ok(code) = u8::from_str_radix(&digits, 8)
            {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    PathBuf::from(out)
}

/// Bind-mount a directory, creating both endpoints when missing, and verify
/// the mount actually took effect.
pub fn bind(src: &Path, dst: &Path, ledger: &mut MountLedger) -> Result<()> {
    if is_mounted(dst) {
        return Ok(());
    }
    for dir in [src, dst] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }
    mount(Some(src), dst, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("bind {} -> {}", src.display(), dst.display()))?;
    verify(src, dst)?;
    ledger.record(dst);
    Ok(())
}

/// Bind-mount a single file, creating an empty destination file first.
pub fn bind_file(src: &Path, dst: &Path, ledger: &mut MountLedger) -> Result<()> {
    if is_mounted(dst) {
        return Ok(());
    }
    if !dst.exists() {
        if let Some(dir) = dst.parent()
            && !dir.is_dir()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        fs::File::create(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    }
    mount(Some(src), dst, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("bind {} -> {}", src.display(), dst.display()))?;
    ledger.record(dst);
    Ok(())
}

/// Loop-mount a filesystem image read-only. Loop device allocation is left
/// to mount(8); teardown goes through the regular umount path.
pub fn mount_image(image: &Path, dst: &Path, ledger: &mut MountLedger) -> Result<()> {
    if is_mounted(dst) {
        umount_all(dst)?;
    }
    if !dst.exists() {
        fs::create_dir_all(dst).with_context(|| format!("failed to create {}", dst.display()))?;
    }
    let output = std::process::Command::new("mount")
        .arg("-o")
        .arg("loop,ro")
        .arg(image)
        .arg(dst)
        .output()
        .context("failed to run mount")?;
    if !output.status.success() {
        tracing::error!(
            "mount {} failed: {}",
            image.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    verify(image, dst)?;
    ledger.record(dst);
    Ok(())
}

/// Compose an overlayfs from ordered lower directories (first entry is the
/// topmost layer), with an optional read-write upper + work pair.
pub fn mount_overlay(
    lowers: &[&Path],
    dst: &Path,
    upper: Option<&Path>,
    work: Option<&Path>,
    ledger: &mut MountLedger,
) -> Result<()> {
    let mut dirs: Vec<&Path> = lowers.to_vec();
    let lowerdir = lowers
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":");
    let mut options = format!("lowerdir={lowerdir}");

    if let (Some(upper), Some(work)) = (upper, work) {
        dirs.push(upper);
        dirs.push(work);
        options.push_str(&format!(
            ",upperdir={},workdir={}",
            upper.display(),
            work.display()
        ));
    }
    // xino confuses Android's installd on some filesystems; the option only
    // exists on 4.17+.
    if kernel_version() >= (4, 17) {
        options.push_str(",xino=off");
    }

    for dir in dirs.iter().chain(std::iter::once(&dst)) {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }

    mount(
        Some("overlay"),
        dst,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .with_context(|| format!("overlay on {}", dst.display()))?;
    verify(Path::new("overlay"), dst)?;
    ledger.record(dst);
    Ok(())
}

fn verify(src: &Path, dst: &Path) -> Result<()> {
    if !is_mounted(dst) {
        return Err(Error::MountFailure {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        }
        .into());
    }
    Ok(())
}

/// Mountpoints under `prefix`, deepest first, ready for unmounting.
fn umount_all_list(proc_mounts: &str, prefix: &Path) -> Result<Vec<PathBuf>> {
    let mut ret = Vec::new();
    for line in proc_mounts.lines() {
        let mut words = line.split_whitespace();
        let _source = words.next();
        let Some(mountpoint) = words.next() else {
            bail!("failed to parse /proc/mounts line: {line}");
        };
        let mountpoint = unescape_mount_path(mountpoint);
        if mountpoint.starts_with(prefix) {
            ret.push(mountpoint);
        }
    }
    ret.sort();
    ret.reverse();
    Ok(ret)
}

/// Unmount everything mounted at or below `prefix`. Any mountpoint still
/// present afterwards is an error; callers on the teardown path downgrade
/// it to a log line.
pub fn umount_all(prefix: &Path) -> Result<()> {
    let prefix = match fs::canonicalize(prefix) {
        Ok(p) => p,
        Err(_) => prefix.to_path_buf(),
    };
    let mounts = fs::read_to_string("/proc/mounts").context("failed to read /proc/mounts")?;
    let list = umount_all_list(&mounts, &prefix)?;
    for mountpoint in &list {
        if let Err(err) = umount(mountpoint) {
            tracing::warn!("umount {}: {err}", mountpoint.display());
        }
    }
    for mountpoint in &list {
        if is_mounted(mountpoint) {
            bail!("failed to umount: {}", mountpoint.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_MOUNTS: &str = "\
/dev/loop7 /var/lib/waydroid/rootfs ext4 ro,relatime 0 0
/dev/loop8 /var/lib/waydroid/rootfs/vendor ext4 ro,relatime 0 0
tmpfs /run/user/1000 tmpfs rw,nosuid,nodev 0 0
overlay /var/lib/waydroid/rootfs/vendor/waydroid.prop overlay ro 0 0
/dev/sda2 /home/with\\040space ext4 rw 0 0
tmpfs /var/lib/waydroid/stale\\040(deleted) tmpfs rw 0 0
";

    #[test]
    fn umount_list_is_deepest_first() {
        let list =
            umount_all_list(PROC_MOUNTS, Path::new("/var/lib/waydroid")).unwrap();
        assert_eq!(
            list,
            vec![
                PathBuf::from("/var/lib/waydroid/stale"),
                PathBuf::from("/var/lib/waydroid/rootfs/vendor/waydroid.prop"),
                PathBuf::from("/var/lib/waydroid/rootfs/vendor"),
                PathBuf::from("/var/lib/waydroid/rootfs"),
            ]
        );
    }

    #[test]
    fn deleted_suffix_is_stripped() {
        assert_eq!(
            unescape_mount_path("/var/lib/waydroid/x\\040(deleted)"),
            PathBuf::from("/var/lib/waydroid/x")
        );
    }

    #[test]
    fn octal_escapes_are_decoded() {
        assert_eq!(
            unescape_mount_path("/home/with\\040space"),
            PathBuf::from("/home/with space")
        );
        assert_eq!(unescape_mount_path("/plain"), PathBuf::from("/plain"));
    }

    #[test]
    fn mounts_contain_matches_mountpoint_and_source() {
        assert!(mounts_contain(
            PROC_MOUNTS,
            Path::new("/var/lib/waydroid/rootfs")
        ));
        assert!(mounts_contain(PROC_MOUNTS, Path::new("/home/with space")));
        // Source column match, for files bound from a mount source.
        assert!(mounts_contain(PROC_MOUNTS, Path::new("/dev/loop7")));
        assert!(!mounts_contain(PROC_MOUNTS, Path::new("/var/lib/other")));
    }

    #[test]
    fn ledger_rollback_pops_everything() {
        let mut ledger = MountLedger::new();
        ledger.record("/tmp/waydroid-test-not-mounted-a");
        ledger.record("/tmp/waydroid-test-not-mounted-b");
        assert!(!ledger.is_empty());
        // Nothing in the ledger is actually mounted, so rollback just drains.
        ledger.rollback();
        assert!(ledger.is_empty());
    }
}
