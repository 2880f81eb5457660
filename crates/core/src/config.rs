//! Persisted configuration and the work-directory layout.
//!
//! `waydroid.cfg` is a TOML document with two tables: `[waydroid]` for the
//! general settings written by `waydroid init`, and `[properties]` for
//! free-form Android property overrides that are appended verbatim to the
//! synthesized property file.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_WORK_DIR: &str = "/var/lib/waydroid";

/// Image locations probed before falling back to `<work>/images`.
pub const PREINSTALLED_IMAGE_PATHS: &[&str] = &[
    "/etc/waydroid-extra/images",
    "/usr/share/waydroid-extra/images",
];

pub const CHANNELS_CONFIG_PATH: &str = "/usr/share/waydroid-extra/channels.cfg";

/// Well-known locations under the work directory.
#[derive(Debug, Clone)]
pub struct Paths {
    work: PathBuf,
}

impl Paths {
    pub fn new(work: impl Into<PathBuf>) -> Self {
        Self { work: work.into() }
    }

    pub fn work(&self) -> &Path {
        &self.work
    }

    pub fn config_file(&self) -> PathBuf {
        self.work.join("waydroid.cfg")
    }

    pub fn base_props(&self) -> PathBuf {
        self.work.join("waydroid_base.prop")
    }

    pub fn session_props(&self) -> PathBuf {
        self.work.join("waydroid.prop")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.work.join("rootfs")
    }

    pub fn overlay(&self) -> PathBuf {
        self.work.join("overlay")
    }

    pub fn overlay_rw(&self) -> PathBuf {
        self.work.join("overlay_rw")
    }

    pub fn overlay_work(&self) -> PathBuf {
        self.work.join("overlay_work")
    }

    /// Legacy bind target for Android /data.
    pub fn data(&self) -> PathBuf {
        self.work.join("data")
    }

    pub fn lxc(&self) -> PathBuf {
        self.work.join("lxc")
    }

    pub fn lxc_container(&self) -> PathBuf {
        self.lxc().join("waydroid")
    }

    pub fn host_perms(&self) -> PathBuf {
        self.work.join("host-permissions")
    }

    pub fn images(&self) -> PathBuf {
        self.work.join("images")
    }

    pub fn http_cache(&self) -> PathBuf {
        self.work.join("cache_http")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new(DEFAULT_WORK_DIR)
    }
}

/// What to do with the container when Android asks the host to suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SuspendAction {
    /// Freeze the cgroup; the UI can reconnect to a warm container.
    #[default]
    Freeze,
    /// Full stop. A UI holding a session will observe STOPPED and has to
    /// start over; see DESIGN.md before changing the default.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct General {
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_images_path")]
    pub images_path: PathBuf,
    #[serde(default = "default_vendor_type")]
    pub vendor_type: String,
    #[serde(default)]
    pub system_datetime: i64,
    #[serde(default)]
    pub vendor_datetime: i64,
    #[serde(default)]
    pub suspend_action: SuspendAction,
    #[serde(default = "default_true")]
    pub mount_overlays: bool,
    #[serde(default)]
    pub auto_adb: bool,
    #[serde(default)]
    pub binder: String,
    #[serde(default)]
    pub vndbinder: String,
    #[serde(default)]
    pub hwbinder: String,
    #[serde(default)]
    pub system_ota: String,
    #[serde(default)]
    pub vendor_ota: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binder_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_manager_protocol: Option<String>,
    /// Pin a specific DRI render node instead of probing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drm_device: Option<PathBuf>,
}

fn default_arch() -> String {
    "arm64".into()
}

fn default_images_path() -> PathBuf {
    PathBuf::from(DEFAULT_WORK_DIR).join("images")
}

fn default_vendor_type() -> String {
    "MAINLINE".into()
}

fn default_true() -> bool {
    true
}

impl Default for General {
    fn default() -> Self {
        Self {
            arch: default_arch(),
            images_path: default_images_path(),
            vendor_type: default_vendor_type(),
            system_datetime: 0,
            vendor_datetime: 0,
            suspend_action: SuspendAction::default(),
            mount_overlays: true,
            auto_adb: false,
            binder: String::new(),
            vndbinder: String::new(),
            hwbinder: String::new(),
            system_ota: String::new(),
            vendor_ota: String::new(),
            binder_protocol: None,
            service_manager_protocol: None,
            drm_device: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub waydroid: General,
    /// Free-form Android property overrides, appended last so they win.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Config {
    /// Load the config, failing with [`Error::ConfigMissing`] when the work
    /// directory has not been initialized.
    pub fn load(paths: &Paths) -> Result<Self> {
        let file = paths.config_file();
        if !file.is_file() {
            return Err(Error::ConfigMissing(file).into());
        }
        let text = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let cfg: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse {}", file.display()))?;
        Ok(cfg)
    }

    /// Load the config if present, otherwise start from defaults. Used by
    /// the initializer, which is allowed to run before the first save.
    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        if paths.config_file().is_file() {
            Self::load(paths)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, paths: &Paths) -> Result<()> {
        let file = paths.config_file();
        if let Some(dir) = file.parent()
            && !dir.exists()
        {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(&file, text).with_context(|| format!("failed to write {}", file.display()))?;
        tracing::debug!("saved config: {}", file.display());
        Ok(())
    }

    pub fn images_preinstalled(&self) -> bool {
        PREINSTALLED_IMAGE_PATHS
            .iter()
            .any(|p| Path::new(p) == self.waydroid.images_path)
    }
}

/// OTA channel selection, optionally overridden by a distribution file at
/// [`CHANNELS_CONFIG_PATH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Channels {
    pub system_channel: String,
    pub vendor_channel: String,
    pub rom_type: String,
    pub system_type: String,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            system_channel: "https://ota.waydro.id/system".into(),
            vendor_channel: "https://ota.waydro.id/vendor".into(),
            rom_type: "lineage".into(),
            system_type: "VANILLA".into(),
        }
    }
}

#[derive(Deserialize)]
struct ChannelsFile {
    #[serde(default)]
    channels: Channels,
}

impl Channels {
    pub fn load() -> Self {
        Self::load_from(Path::new(CHANNELS_CONFIG_PATH))
    }

    fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<ChannelsFile>(&text) {
                Ok(file) => file.channels,
                Err(err) => {
                    tracing::warn!("ignoring malformed {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_a_distinct_error() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let err = Config::load(&paths).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ConfigMissing(_))
        ));
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path().join("work"));

        let mut cfg = Config::default();
        cfg.waydroid.arch = "x86_64".into();
        cfg.waydroid.binder = "anbox-binder".into();
        cfg.waydroid.suspend_action = SuspendAction::Stop;
        cfg.properties
            .insert("persist.waydroid.multi_windows".into(), "true".into());
        cfg.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.waydroid.arch, "x86_64");
        assert_eq!(loaded.waydroid.binder, "anbox-binder");
        assert_eq!(loaded.waydroid.suspend_action, SuspendAction::Stop);
        assert_eq!(
            loaded.properties.get("persist.waydroid.multi_windows"),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: Config = toml::from_str("[waydroid]\narch = \"arm64\"\n").unwrap();
        assert!(cfg.waydroid.mount_overlays);
        assert_eq!(cfg.waydroid.suspend_action, SuspendAction::Freeze);
        assert_eq!(cfg.waydroid.vendor_type, "MAINLINE");
        assert!(cfg.properties.is_empty());
    }

    #[test]
    fn channels_fall_back_to_defaults() {
        let channels = Channels::load_from(Path::new("/nonexistent/channels.cfg"));
        assert_eq!(channels.system_channel, "https://ota.waydro.id/system");
        assert_eq!(channels.rom_type, "lineage");
    }

    #[test]
    fn paths_layout_matches_work_dir() {
        let paths = Paths::new("/var/lib/waydroid");
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/var/lib/waydroid/waydroid.cfg")
        );
        assert_eq!(
            paths.lxc_container(),
            PathBuf::from("/var/lib/waydroid/lxc/waydroid")
        );
        assert_eq!(paths.rootfs(), PathBuf::from("/var/lib/waydroid/rootfs"));
    }
}
