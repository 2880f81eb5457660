//! `waydroid upgrade`: re-fetch images (unless offline or preinstalled),
//! rewrite every synthesized config, run version migrations, and put a
//! running session back the way it was.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use anyhow::Result;

use waydroid_core::version::{self, TOOLS_VERSION};
use waydroid_core::{Config, Paths, props};

use crate::{CancelToken, images, initializer};

/// Tools version recorded in the base props written by the previous run,
/// empty on a pre-props-file installation.
fn recorded_tools_version(paths: &Paths) -> String {
    props::file_get(&paths.base_props(), "waydroid.tools_version")
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Version-conditional fixups applied when upgrading over an older
/// installation.
fn migrate(paths: &Paths, cfg: &mut Config, from_version: &str) -> Result<()> {
    if from_version == TOOLS_VERSION {
        return Ok(());
    }
    tracing::info!(
        "migrating from tools {} to {TOOLS_VERSION}",
        if from_version.is_empty() { "(unversioned)" } else { from_version }
    );

    // The config used to be world-readable; it can carry property
    // overrides users consider private.
    if let Ok(meta) = fs::metadata(paths.config_file()) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o077 != 0 {
            perms.set_mode(0o600);
            fs::set_permissions(paths.config_file(), perms)?;
        }
    }

    // Pre-1.0 session state file, superseded by the bus-held descriptor.
    let legacy_session = paths.work().join("session.cfg");
    if legacy_session.exists() {
        fs::remove_file(&legacy_session)?;
    }

    // Overlays arrived after 0.1; installs migrated from before get the
    // current default instead of inheriting a missing key as "off".
    if from_version.is_empty()
        || version::compare(from_version, "0.1.0") == std::cmp::Ordering::Less
    {
        cfg.waydroid.mount_overlays = true;
    }
    Ok(())
}

pub fn upgrade(paths: &Paths, offline: bool, cancel: &CancelToken) -> Result<()> {
    let mut cfg = Config::load(paths)?;

    let running = super::initializer::stop_preserving_session(paths);
    if let Err(err) = waydroid_sandbox::mount::umount_all(&paths.rootfs()) {
        tracing::debug!("rootfs teardown: {err:#}");
    }

    if !offline {
        if cfg.images_preinstalled() {
            tracing::info!(
                "upgrade refused because a pre-installed image is detected at {}",
                cfg.waydroid.images_path.display()
            );
        } else {
            images::get(paths, &mut cfg, cancel)?;
        }
    }

    let from_version = recorded_tools_version(paths);
    migrate(paths, &mut cfg, &from_version)?;
    cfg.save(paths)?;

    cancel.check()?;
    initializer::create_dir_layout(paths)?;
    initializer::write_configuration(paths, &cfg)?;

    if let Some(session) = running.session {
        super::initializer::restart_with(session);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_is_a_noop_on_the_current_version() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let mut cfg = Config::default();
        cfg.waydroid.mount_overlays = false;
        migrate(&paths, &mut cfg, TOOLS_VERSION).unwrap();
        assert!(!cfg.waydroid.mount_overlays);
    }

    #[test]
    fn migration_tightens_config_mode_and_removes_legacy_files() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let mut cfg = Config::default();
        cfg.save(&paths).unwrap();
        let mut perms = fs::metadata(paths.config_file()).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(paths.config_file(), perms).unwrap();
        fs::write(paths.work().join("session.cfg"), "legacy").unwrap();

        migrate(&paths, &mut cfg, "0.0.9").unwrap();

        let mode = fs::metadata(paths.config_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!paths.work().join("session.cfg").exists());
        assert!(cfg.waydroid.mount_overlays);
    }
}
