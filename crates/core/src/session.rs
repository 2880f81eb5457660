//! The per-user session descriptor and the container status enum.
//!
//! A session descriptor is created by the session manager, crosses the
//! system bus as a string dictionary, and is tracked by the container
//! manager for as long as the container runs on that user's behalf. The
//! dictionary form is converted at the bus boundary; unknown keys are
//! rejected there instead of being carried along silently.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::unistd::{Gid, Uid, User};

/// Authoritative container state, as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Stopped,
    Running,
    Frozen,
}

impl ContainerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContainerStatus::Stopped => "STOPPED",
            ContainerStatus::Running => "RUNNING",
            ContainerStatus::Frozen => "FROZEN",
        }
    }

    /// Anything unrecognized is treated as STOPPED; status is advisory and
    /// the runtime is re-queried before every transition.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "RUNNING" => ContainerStatus::Running,
            "FROZEN" => ContainerStatus::Frozen,
            _ => ContainerStatus::Stopped,
        }
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub user_name: String,
    pub user_id: u32,
    pub group_id: u32,
    /// Host home directory of the session owner.
    pub host_user: PathBuf,
    /// PID of the session manager process, used for caller validation and
    /// for the SIGUSR1 teardown handshake.
    pub pid: u32,
    pub xdg_data_home: PathBuf,
    pub xdg_runtime_dir: PathBuf,
    /// Socket name, or an absolute path when the compositor exported one.
    pub wayland_display: String,
    pub pulse_runtime_path: PathBuf,
    /// Android /data for this user, under XDG_DATA_HOME.
    pub waydroid_data: PathBuf,
    /// 0 means "inherit from the system image".
    pub lcd_density: u32,
    pub background_start: bool,
}

impl SessionDescriptor {
    /// Assemble a descriptor from the calling user's environment. The
    /// Wayland socket itself is validated separately by the session
    /// manager before this descriptor ever leaves the process.
    pub fn from_env() -> Result<Self> {
        let uid = Uid::current();
        let gid = Gid::current();
        let user = User::from_uid(uid)
            .context("failed to look up current user")?
            .with_context(|| format!("uid {uid} has no passwd entry"))?;

        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| user.dir.clone());
        let xdg_data_home = env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".local/share"));
        let xdg_runtime_dir = env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .context("XDG_RUNTIME_DIR is not set, cannot start a session")?;
        let wayland_display = env::var("WAYLAND_DISPLAY").unwrap_or_else(|_| {
            tracing::warn!("WAYLAND_DISPLAY is not set, defaulting to \"wayland-0\"");
            "wayland-0".into()
        });
        let pulse_runtime_path = env::var_os("PULSE_RUNTIME_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| xdg_runtime_dir.join("pulse"));

        Ok(Self {
            user_name: user.name,
            user_id: uid.as_raw(),
            group_id: gid.as_raw(),
            host_user: home,
            pid: std::process::id(),
            waydroid_data: xdg_data_home.join("waydroid/data"),
            xdg_data_home,
            xdg_runtime_dir,
            wayland_display,
            pulse_runtime_path,
            lcd_density: 0,
            background_start: false,
        })
    }

    /// Absolute path of the Wayland socket this session hands to Android.
    pub fn wayland_socket(&self) -> PathBuf {
        let display = Path::new(&self.wayland_display);
        if display.is_absolute() {
            display.to_path_buf()
        } else {
            self.xdg_runtime_dir.join(display)
        }
    }

    pub fn pulse_socket(&self) -> PathBuf {
        self.pulse_runtime_path.join("native")
    }

    /// Serialize for the `a{ss}` bus representation.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("user_name".into(), self.user_name.clone());
        map.insert("user_id".into(), self.user_id.to_string());
        map.insert("group_id".into(), self.group_id.to_string());
        map.insert("host_user".into(), path_str(&self.host_user));
        map.insert("pid".into(), self.pid.to_string());
        map.insert("xdg_data_home".into(), path_str(&self.xdg_data_home));
        map.insert("xdg_runtime_dir".into(), path_str(&self.xdg_runtime_dir));
        map.insert("wayland_display".into(), self.wayland_display.clone());
        map.insert(
            "pulse_runtime_path".into(),
            path_str(&self.pulse_runtime_path),
        );
        map.insert("waydroid_data".into(), path_str(&self.waydroid_data));
        map.insert("lcd_density".into(), self.lcd_density.to_string());
        map.insert(
            "background_start".into(),
            self.background_start.to_string(),
        );
        map
    }

    /// Parse the bus representation back into the typed record. Unknown
    /// keys and malformed numbers are rejected; a remote cannot smuggle
    /// extra state through the dictionary.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        const KNOWN: &[&str] = &[
            "user_name",
            "user_id",
            "group_id",
            "host_user",
            "pid",
            "xdg_data_home",
            "xdg_runtime_dir",
            "wayland_display",
            "pulse_runtime_path",
            "waydroid_data",
            "lcd_density",
            "background_start",
        ];
        for key in map.keys() {
            if !KNOWN.contains(&key.as_str()) {
                bail!("unknown session key: {key}");
            }
        }

        let get = |key: &str| -> Result<&String> {
            map.get(key)
                .with_context(|| format!("missing session key: {key}"))
        };
        let get_u32 = |key: &str| -> Result<u32> {
            get(key)?
                .parse()
                .with_context(|| format!("invalid session key {key}"))
        };

        Ok(Self {
            user_name: get("user_name")?.clone(),
            user_id: get_u32("user_id")?,
            group_id: get_u32("group_id")?,
            host_user: get("host_user")?.into(),
            pid: get_u32("pid")?,
            xdg_data_home: get("xdg_data_home")?.into(),
            xdg_runtime_dir: get("xdg_runtime_dir")?.into(),
            wayland_display: get("wayland_display")?.clone(),
            pulse_runtime_path: get("pulse_runtime_path")?.into(),
            waydroid_data: get("waydroid_data")?.into(),
            lcd_density: get_u32("lcd_density")?,
            background_start: get("background_start")?
                .parse()
                .context("invalid session key background_start")?,
        })
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionDescriptor {
        SessionDescriptor {
            user_name: "alice".into(),
            user_id: 1000,
            group_id: 1000,
            host_user: "/home/alice".into(),
            pid: 4242,
            xdg_data_home: "/home/alice/.local/share".into(),
            xdg_runtime_dir: "/run/user/1000".into(),
            wayland_display: "wayland-0".into(),
            pulse_runtime_path: "/run/user/1000/pulse".into(),
            waydroid_data: "/home/alice/.local/share/waydroid/data".into(),
            lcd_density: 0,
            background_start: false,
        }
    }

    #[test]
    fn map_round_trip() {
        let session = sample();
        let map = session.to_map();
        assert_eq!(map["user_id"], "1000");
        let back = SessionDescriptor::from_map(&map).unwrap();
        assert_eq!(back, session);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut map = sample().to_map();
        map.insert("state".into(), "RUNNING".into());
        let err = SessionDescriptor::from_map(&map).unwrap_err();
        assert!(err.to_string().contains("unknown session key"));
    }

    #[test]
    fn missing_key_is_rejected() {
        let mut map = sample().to_map();
        map.remove("wayland_display");
        assert!(SessionDescriptor::from_map(&map).is_err());
    }

    #[test]
    fn wayland_socket_joins_runtime_dir() {
        let session = sample();
        assert_eq!(
            session.wayland_socket(),
            PathBuf::from("/run/user/1000/wayland-0")
        );

        let mut abs = sample();
        abs.wayland_display = "/tmp/custom-wayland".into();
        assert_eq!(abs.wayland_socket(), PathBuf::from("/tmp/custom-wayland"));
    }

    #[test]
    fn status_parse_defaults_to_stopped() {
        assert_eq!(ContainerStatus::parse("RUNNING"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("FROZEN\n"), ContainerStatus::Frozen);
        assert_eq!(ContainerStatus::parse(""), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::parse("garbage"), ContainerStatus::Stopped);
    }
}
