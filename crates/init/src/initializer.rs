//! `waydroid init`: detect the host, pick an image source, download and
//! verify images, select driver nodes, and write every config artifact the
//! container manager consumes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use waydroid_container::config as lxc_config;
use waydroid_core::config::PREINSTALLED_IMAGE_PATHS;
use waydroid_core::{Channels, Config, ContainerStatus, Paths, SessionDescriptor, arch, props};
use waydroid_sandbox::{drivers, gpu};
use waydroid_session::ipc::ContainerManagerProxyBlocking;

use crate::{CancelToken, images};

#[derive(Debug, Default, Clone)]
pub struct InitOptions {
    pub force: bool,
    pub images_path: Option<PathBuf>,
    pub system_channel: Option<String>,
    pub vendor_channel: Option<String>,
    pub rom_type: Option<String>,
    pub system_type: Option<String>,
}

/// Progress sink for the remote initializer; plain init just logs.
pub type ProgressFn = dyn Fn(&str) + Send + Sync;

pub fn is_initialized(paths: &Paths) -> bool {
    paths.config_file().is_file()
}

/// Vendor type from the host VNDK version. 19 is the mainline baseline;
/// Halium numbering tracks the Android major with a hiccup above VNDK 31,
/// and 32 is the "L" (12.1) release.
pub fn vendor_type_from_vndk(vndk: Option<u32>) -> String {
    match vndk {
        None | Some(0..=19) => "MAINLINE".to_string(),
        Some(vndk @ 20..=31) => format!("HALIUM_{}", vndk - 19),
        Some(32) => "HALIUM_12L".to_string(),
        Some(vndk) => format!("HALIUM_{}", vndk - 20),
    }
}

pub fn detect_vendor_type() -> String {
    let vndk = props::host_get("ro.vndk.version").parse().ok();
    vendor_type_from_vndk(vndk)
}

/// First preinstalled directory holding both images.
pub fn find_preinstalled() -> Option<PathBuf> {
    PREINSTALLED_IMAGE_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|dir| images::has_image_pair(dir))
}

pub(crate) struct RunningContainer {
    pub(crate) session: Option<SessionDescriptor>,
}

/// Snapshot and stop a running container through its daemon, falling back
/// to direct LXC control when no daemon answers.
pub(crate) fn stop_preserving_session(paths: &Paths) -> RunningContainer {
    if !paths.lxc_container().exists()
        || waydroid_container::lxc::status(paths) == ContainerStatus::Stopped
    {
        return RunningContainer { session: None };
    }
    tracing::info!("stopping container");

    let via_dbus = (|| -> Result<Option<SessionDescriptor>> {
        let connection = zbus::blocking::Connection::system()?;
        let proxy = ContainerManagerProxyBlocking::new(&connection)?;
        let mut map: HashMap<String, String> = proxy.get_session()?;
        map.remove("state");
        let session = if map.is_empty() {
            None
        } else {
            Some(SessionDescriptor::from_map(&map)?)
        };
        proxy.stop(false)?;
        Ok(session)
    })();

    match via_dbus {
        Ok(session) => RunningContainer { session },
        Err(err) => {
            tracing::debug!("no container daemon answered ({err:#}), stopping directly");
            if let Err(err) = waydroid_container::lxc::stop(paths) {
                tracing::warn!("lxc stop: {err:#}");
            }
            RunningContainer { session: None }
        }
    }
}

pub(crate) fn restart_with(session: SessionDescriptor) {
    tracing::info!("starting container");
    let result = (|| -> Result<()> {
        let connection = zbus::blocking::Connection::system()?;
        let proxy = ContainerManagerProxyBlocking::new(&connection)?;
        proxy.start(session.to_map())?;
        Ok(())
    })();
    if let Err(err) = result {
        tracing::error!("failed to restart the container: {err:#}");
    }
}

/// Resolve channels, derive the vendor type, select binder nodes, and
/// persist the result. Network access only happens when the image source
/// is not preinstalled.
pub fn setup_config(
    paths: &Paths,
    options: &InitOptions,
    cancel: &CancelToken,
) -> Result<Config> {
    let mut cfg = Config::load_or_default(paths)?;

    cfg.waydroid.arch = arch::host()?;

    let preinstalled = find_preinstalled();
    cfg.waydroid.images_path = match (&options.images_path, &preinstalled) {
        (Some(path), _) => path.clone(),
        (None, Some(path)) => path.clone(),
        (None, None) => paths.images(),
    };

    if preinstalled.is_some() && options.images_path.is_none() {
        tracing::info!(
            "using preinstalled images at {}",
            cfg.waydroid.images_path.display()
        );
        cfg.waydroid.vendor_type = detect_vendor_type();
        cfg.waydroid.system_ota = String::new();
        cfg.waydroid.vendor_ota = String::new();
    } else {
        let defaults = Channels::load();
        let system_channel = options
            .system_channel
            .clone()
            .unwrap_or(defaults.system_channel);
        let vendor_channel = options
            .vendor_channel
            .clone()
            .unwrap_or(defaults.vendor_channel);
        let rom_type = options.rom_type.clone().unwrap_or(defaults.rom_type);
        let system_type = options.system_type.clone().unwrap_or(defaults.system_type);

        cancel.check()?;
        let client = reqwest::blocking::Client::new();
        let system_ota = format!(
            "{system_channel}/{rom_type}/waydroid_{}/{system_type}.json",
            cfg.waydroid.arch
        );
        if !crate::http::probe(&client, &system_ota) {
            bail!("failed to get system OTA channel: {system_ota}");
        }

        // The device codename channel carries device-specific vendor
        // images; the generic vendor-type channel is the fallback.
        let device_codename = props::host_get("ro.product.device");
        let mut resolved = None;
        for candidate in [device_codename, detect_vendor_type()] {
            if candidate.is_empty() {
                continue;
            }
            let vendor_ota =
                format!("{vendor_channel}/waydroid_{}/{candidate}.json", cfg.waydroid.arch);
            if crate::http::probe(&client, &vendor_ota) {
                resolved = Some((candidate, vendor_ota));
                break;
            }
        }
        let Some((vendor_type, vendor_ota)) = resolved else {
            bail!("failed to get vendor OTA channel from {vendor_channel}");
        };

        cfg.waydroid.vendor_type = vendor_type;
        cfg.waydroid.system_ota = system_ota;
        cfg.waydroid.vendor_ota = vendor_ota;
    }

    cancel.check()?;
    let selection = drivers::setup_binder_nodes(&cfg.waydroid.vendor_type)?;
    cfg.waydroid.binder = selection.binder;
    cfg.waydroid.vndbinder = selection.vndbinder;
    cfg.waydroid.hwbinder = selection.hwbinder;

    cfg.save(paths)?;
    Ok(cfg)
}

/// Create the overlay skeleton and the other directories the mount layer
/// expects to find.
pub fn create_dir_layout(paths: &Paths) -> Result<()> {
    for dir in [
        paths.rootfs(),
        paths.overlay(),
        paths.overlay().join("vendor"),
        paths.overlay_rw().join("system"),
        paths.overlay_rw().join("vendor"),
        paths.overlay_work().join("system"),
        paths.overlay_work().join("vendor"),
        paths.data(),
        paths.images(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

/// Write every synthesized artifact: base LXC config, node mounts, base
/// props, host permissions.
pub fn write_configuration(paths: &Paths, cfg: &Config) -> Result<()> {
    let selection = waydroid_sandbox::DriverSelection::from_config(cfg)?;
    let dri = gpu::dri_node(cfg)?;
    let has_ashmem = drivers::probe_ashmem_driver();

    lxc_config::setup_host_perms(paths)?;
    lxc_config::write_base_config(paths, &cfg.waydroid.arch)?;
    lxc_config::generate_nodes_config(paths, &selection, &cfg.waydroid.vendor_type, dri.as_ref())?;
    lxc_config::make_base_props(paths, cfg, dri.as_ref(), has_ashmem)?;
    Ok(())
}

/// The one-shot bootstrap.
pub fn init(
    paths: &Paths,
    options: &InitOptions,
    cancel: &CancelToken,
    progress: Option<&ProgressFn>,
) -> Result<()> {
    let report = |line: &str| {
        tracing::info!("{line}");
        if let Some(progress) = progress {
            progress(line);
        }
    };

    if is_initialized(paths) && !options.force {
        report("already initialized");
        return Ok(());
    }

    let running = stop_preserving_session(paths);
    if let Err(err) = waydroid_sandbox::mount::umount_all(&paths.rootfs()) {
        tracing::debug!("rootfs teardown: {err:#}");
    }

    report("detecting host configuration");
    let mut cfg = setup_config(paths, options, cancel)?;

    if find_preinstalled().is_none() || options.images_path.is_some() {
        report("downloading images");
        images::get(paths, &mut cfg, cancel)?;
    }

    cancel.check()?;
    report("writing container configuration");
    create_dir_layout(paths)?;
    write_configuration(paths, &cfg)?;

    if let Some(session) = running.session {
        restart_with(session);
    }
    report("initialization done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_type_mapping_matches_the_table() {
        assert_eq!(vendor_type_from_vndk(Some(19)), "MAINLINE");
        assert_eq!(vendor_type_from_vndk(Some(20)), "HALIUM_1");
        assert_eq!(vendor_type_from_vndk(Some(31)), "HALIUM_12");
        assert_eq!(vendor_type_from_vndk(Some(32)), "HALIUM_12L");
        assert_eq!(vendor_type_from_vndk(Some(33)), "HALIUM_13");
        assert_eq!(vendor_type_from_vndk(None), "MAINLINE");
    }

    #[test]
    fn dir_layout_creates_the_overlay_skeleton() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        create_dir_layout(&paths).unwrap();
        assert!(paths.rootfs().is_dir());
        assert!(paths.overlay().join("vendor").is_dir());
        assert!(paths.overlay_rw().join("system").is_dir());
        assert!(paths.overlay_work().join("vendor").is_dir());
    }

    #[test]
    fn reinit_without_force_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        Config::default().save(&paths).unwrap();
        let before = fs::read_to_string(paths.config_file()).unwrap();

        init(&paths, &InitOptions::default(), &CancelToken::new(), None).unwrap();
        let after = fs::read_to_string(paths.config_file()).unwrap();
        assert_eq!(before, after);
    }
}
