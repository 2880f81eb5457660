//! The container state machine. All privileged mutation of mounts, device
//! permissions and the LXC runtime goes through this one value; the bus
//! object in [`crate::dbus`] only ever calls into here.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use waydroid_binder::protocol;
use waydroid_core::{Config, ContainerStatus, Paths, SessionDescriptor};
use waydroid_sandbox::drivers::DriverSelection;
use waydroid_sandbox::mount::{self, MountLedger};

use crate::{config, lxc, net};

/// Nodes opened directly by Android HALs; chmod'd wide open on start.
const PERMISSION_NODES: &[&str] = &[
    "/dev/ashmem",
    "/dev/sw_sync",
    "/sys/kernel/debug/sync/sw_sync",
    "/dev/Vcodec",
    "/dev/MTK_SMI",
    "/dev/mdp_sync",
    "/dev/mtk_cmdq",
    "/dev/mtk_mdp",
    "/dev/dri",
    "/dev/graphics",
    "/dev/pvr_sync",
    "/dev/ion",
    "/dev/dma_heap",
    "/dev/kgsl-3d0",
    "/dev/mali0",
    "/dev/dxg",
    "/dev/uhid",
    "/sys/class/leds/vibrator",
    "/sys/class/timed_output/vibrator",
];

fn chmod(path: &str, mode: &str) {
    if !Path::new(path).exists() {
        return;
    }
    match Command::new("chmod").args([mode, "-R", path]).output() {
        Ok(out) if !out.status.success() => {
            tracing::debug!("chmod {mode} {path}: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        Err(err) => tracing::debug!("chmod {mode} {path}: {err}"),
        _ => {}
    }
}

fn glob(dir: &str, prefix: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n.starts_with(prefix))
                .map(|n| format!("{dir}/{n}"))
                .collect()
        })
        .unwrap_or_default()
}

pub struct ContainerManager {
    paths: Paths,
    session: Option<SessionDescriptor>,
    ledger: MountLedger,
}

impl ContainerManager {
    pub fn new(paths: Paths) -> Self {
        Self { paths, session: None, ledger: MountLedger::new() }
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn status(&self) -> ContainerStatus {
        lxc::status(&self.paths)
    }

    pub fn session(&self) -> Option<&SessionDescriptor> {
        self.session.as_ref()
    }

    /// Session descriptor plus its live state, in the bus dictionary form.
    /// Empty when no session is tracked.
    pub fn session_map(&self) -> HashMap<String, String> {
        match &self.session {
            None => HashMap::new(),
            Some(session) => {
                let mut map = session.to_map();
                map.insert("state".into(), self.status().as_str().into());
                map
            }
        }
    }

    /// Make the binder nodes and the HAL device allowlist reachable from
    /// inside the container.
    pub fn apply_device_permissions(&self, selection: &DriverSelection) {
        for node in [&selection.binder, &selection.vndbinder, &selection.hwbinder] {
            chmod(&format!("/dev/{node}"), "666");
        }
        for node in PERMISSION_NODES {
            chmod(node, "777");
        }
        for node in glob("/dev", "fb").iter().chain(glob("/dev", "video").iter()) {
            chmod(node, "777");
        }
    }

    /// Bring the container up for `session`. Refuses when a session is
    /// already tracked; any failure reverses the mounts performed so far.
    pub fn start(&mut self, session: SessionDescriptor) -> Result<()> {
        if self.session.is_some() {
            bail!("already tracking a session");
        }

        let mut cfg = Config::load(&self.paths)?;
        let selection = DriverSelection::from_config(&cfg)?;

        net::start()?;

        // schedtune confuses Android's libprocessgroup; detach it quietly.
        if mount::is_mounted(Path::new("/sys/fs/cgroup/schedtune")) {
            let _ = Command::new("umount")
                .args(["-l", "/sys/fs/cgroup/schedtune"])
                .output();
        }

        self.apply_device_permissions(&selection);

        config::generate_session_config(&self.paths, &session)?;
        config::make_session_props(&self.paths, &cfg, &session)?;

        let result = self
            .mount_rootfs(&mut cfg)
            .and_then(|()| protocol::set_aidl_version(&self.paths, &mut cfg))
            .and_then(|()| lxc::start(&self.paths));

        if let Err(err) = result {
            tracing::error!("container start failed, rolling back mounts: {err:#}");
            self.ledger.rollback();
            net::stop();
            return Err(err);
        }

        self.session = Some(session);
        Ok(())
    }

    fn mount_rootfs(&mut self, cfg: &mut Config) -> Result<()> {
        let images = cfg.waydroid.images_path.clone();
        let rootfs = self.paths.rootfs();

        mount::mount_image(&images.join("system.img"), &rootfs, &mut self.ledger)?;
        self.stack_overlay(cfg, "system", &rootfs)?;

        let vendor = rootfs.join("vendor");
        mount::mount_image(&images.join("vendor.img"), &vendor, &mut self.ledger)?;
        self.stack_overlay(cfg, "vendor", &vendor)?;

        for egl in ["/vendor/lib/egl", "/vendor/lib64/egl"] {
            let host = Path::new(egl);
            if host.is_dir() {
                mount::bind(
                    host,
                    &rootfs.join(egl.trim_start_matches('/')),
                    &mut self.ledger,
                )?;
            }
        }

        // Host ODM tree, for extension libraries referenced by the props.
        if mount::is_mounted(Path::new("/odm")) {
            mount::bind(Path::new("/odm"), &rootfs.join("odm_extra"), &mut self.ledger)?;
        } else if Path::new("/vendor/odm").is_dir() {
            mount::bind(
                Path::new("/vendor/odm"),
                &rootfs.join("odm_extra"),
                &mut self.ledger,
            )?;
        }

        mount::bind_file(
            &self.paths.session_props(),
            &rootfs.join("vendor/waydroid.prop"),
            &mut self.ledger,
        )?;
        Ok(())
    }

    /// Stack the read-write overlay for one branch. The first failure
    /// disables overlays persistently and the start continues bare.
    fn stack_overlay(&mut self, cfg: &mut Config, branch: &str, dst: &Path) -> Result<()> {
        if !cfg.waydroid.mount_overlays {
            return Ok(());
        }
        let lower = match branch {
            "system" => self.paths.overlay(),
            _ => self.paths.overlay().join(branch),
        };
        let upper = self.paths.overlay_rw().join(branch);
        let work = self.paths.overlay_work().join(branch);

        let result = mount::mount_overlay(
            &[&lower, dst],
            dst,
            Some(&upper),
            Some(&work),
            &mut self.ledger,
        );
        if let Err(err) = result {
            tracing::warn!("overlay for {branch} failed, disabling overlays: {err:#}");
            cfg.waydroid.mount_overlays = false;
            cfg.save(&self.paths)?;
        }
        Ok(())
    }

    /// Stop the container and undo the session plumbing. Idempotent, and
    /// teardown failures are logged rather than raised.
    pub fn stop(&mut self, quit_session: bool) {
        if self.status() != ContainerStatus::Stopped
            && let Err(err) = lxc::stop(&self.paths)
        {
            tracing::warn!("lxc stop: {err:#}");
        }

        net::stop();

        if let Err(err) = mount::umount_all(&self.paths.rootfs()) {
            tracing::warn!("rootfs teardown: {err:#}");
        }
        // Legacy data bind from pre-session configs.
        if let Err(err) = mount::umount_all(&self.paths.data()) {
            tracing::debug!("data teardown: {err:#}");
        }
        self.ledger.clear();

        if let Some(session) = self.session.take()
            && quit_session
        {
            // SIGUSR1 tells the session manager to tear itself down
            // without calling back into us.
            if let Err(err) = kill(Pid::from_raw(session.pid as i32), Signal::SIGUSR1) {
                tracing::debug!("session pid {} already gone: {err}", session.pid);
            }
        }
    }

    pub fn freeze(&mut self) -> Result<()> {
        match self.status() {
            ContainerStatus::Running => lxc::freeze(&self.paths),
            other => {
                tracing::error!("container is {other}");
                Ok(())
            }
        }
    }

    pub fn unfreeze(&mut self) -> Result<()> {
        match self.status() {
            ContainerStatus::Frozen => lxc::unfreeze(&self.paths),
            _ => Ok(()),
        }
    }

    pub fn restart(&mut self) -> Result<()> {
        match self.status() {
            ContainerStatus::Running => {
                lxc::stop(&self.paths)?;
                lxc::start(&self.paths)
            }
            other => {
                tracing::error!("container is {other}");
                Ok(())
            }
        }
    }

    fn require_running(&self) -> Result<()> {
        let status = self.status();
        if status != ContainerStatus::Running {
            bail!("container is {status}");
        }
        Ok(())
    }

    pub fn getprop(&self, name: &str) -> Result<String> {
        self.require_running()?;
        lxc::getprop(&self.paths, name)
    }

    pub fn setprop(&self, name: &str, value: &str) -> Result<()> {
        self.require_running()?;
        lxc::setprop(&self.paths, name, value)
    }

    /// Blocking; bus callers run this off the dispatch task.
    pub fn watch_prop(&self, name: &str) -> Result<String> {
        self.require_running()?;
        lxc::watch_prop(&self.paths, name)
    }

    /// Bind the session's Android shared folder into the host home.
    pub fn mount_shared_folder(&mut self) -> Result<()> {
        let session = self.session.as_ref().context("no session is tracked")?;
        let guest = session.waydroid_data.join("media/0/Host");
        let host = session.host_user.join("Android");
        mount::bind(&guest, &host, &mut self.ledger)?;
        chmod(&host.to_string_lossy(), "777");
        Ok(())
    }

    pub fn unmount_shared_folder(&mut self) -> Result<()> {
        let session = self.session.as_ref().context("no session is tracked")?;
        let host = session.host_user.join("Android");
        if mount::is_mounted(&host) {
            mount::umount_all(&host)?;
            std::fs::remove_dir(&host).ok();
        }
        Ok(())
    }

    /// Replace images from already-downloaded archives and restart. This
    /// is the IHardware `upgrade` path; image files must have been placed
    /// by a caller that verified them.
    pub fn replace_images_and_restart(
        &mut self,
        system_zip: &str,
        system_time: i64,
        vendor_zip: &str,
        vendor_time: i64,
    ) -> Result<()> {
        let mut cfg = Config::load(&self.paths)?;
        if self.status() != ContainerStatus::Stopped {
            lxc::stop(&self.paths)?;
        }
        if let Err(err) = mount::umount_all(&self.paths.rootfs()) {
            tracing::warn!("rootfs teardown: {err:#}");
        }
        self.ledger.clear();

        for (zip, time, key) in [
            (system_zip, system_time, "system"),
            (vendor_zip, vendor_time, "vendor"),
        ] {
            if zip.is_empty() || !Path::new(zip).exists() {
                continue;
            }
            extract_zip(Path::new(zip), &cfg.waydroid.images_path)
                .with_context(|| format!("failed to extract {zip}"))?;
            match key {
                "system" => cfg.waydroid.system_datetime = time,
                _ => cfg.waydroid.vendor_datetime = time,
            }
            cfg.save(&self.paths)?;
        }

        self.mount_rootfs(&mut cfg)?;
        lxc::start(&self.paths)
    }
}

/// Unpack an image archive into the images directory.
fn extract_zip(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .with_context(|| format!("failed to open {}", archive.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("not a zip archive")?;
    std::fs::create_dir_all(dest)?;
    zip.extract(dest)
        .with_context(|| format!("failed to extract into {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_tracks_nothing() {
        let manager = ContainerManager::new(Paths::new("/tmp/waydroid-test-work"));
        assert!(manager.session().is_none());
        assert!(manager.session_map().is_empty());
    }

    #[test]
    fn start_requires_an_initialized_config() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = ContainerManager::new(Paths::new(tmp.path()));
        let session = SessionDescriptor {
            user_name: "alice".into(),
            user_id: 1000,
            group_id: 1000,
            host_user: "/home/alice".into(),
            pid: 1,
            xdg_data_home: "/home/alice/.local/share".into(),
            xdg_runtime_dir: "/run/user/1000".into(),
            wayland_display: "wayland-0".into(),
            pulse_runtime_path: "/run/user/1000/pulse".into(),
            waydroid_data: "/home/alice/.local/share/waydroid/data".into(),
            lcd_density: 0,
            background_start: false,
        };
        let err = manager.start(session).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<waydroid_core::Error>(),
            Some(waydroid_core::Error::ConfigMissing(_))
        ));
        assert!(manager.session().is_none());
    }

    #[test]
    fn second_session_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = ContainerManager::new(Paths::new(tmp.path()));
        let session = SessionDescriptor {
            user_name: "alice".into(),
            user_id: 1000,
            group_id: 1000,
            host_user: "/home/alice".into(),
            pid: 1,
            xdg_data_home: "/home/alice/.local/share".into(),
            xdg_runtime_dir: "/run/user/1000".into(),
            wayland_display: "wayland-0".into(),
            pulse_runtime_path: "/run/user/1000/pulse".into(),
            waydroid_data: "/home/alice/.local/share/waydroid/data".into(),
            lcd_density: 0,
            background_start: false,
        };
        manager.session = Some(session.clone());
        let err = manager.start(session).unwrap_err();
        assert!(err.to_string().contains("already tracking a session"));
    }

    #[test]
    fn session_map_carries_live_state() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = ContainerManager::new(Paths::new(tmp.path()));
        manager.session = Some(SessionDescriptor {
            user_name: "alice".into(),
            user_id: 1000,
            group_id: 1000,
            host_user: "/home/alice".into(),
            pid: 1,
            xdg_data_home: "/home/alice/.local/share".into(),
            xdg_runtime_dir: "/run/user/1000".into(),
            wayland_display: "wayland-0".into(),
            pulse_runtime_path: "/run/user/1000/pulse".into(),
            waydroid_data: "/home/alice/.local/share/waydroid/data".into(),
            lcd_density: 0,
            background_start: false,
        });
        let map = manager.session_map();
        // No LXC on the test host, so the authoritative answer is STOPPED.
        assert_eq!(map.get("state").map(String::as_str), Some("STOPPED"));
        assert_eq!(map.get("user_id").map(String::as_str), Some("1000"));
    }
}
