//! Thin driver over the external LXC runtime. One well-known container
//! named `waydroid` lives under `<work>/lxc`; status queries always go to
//! `lxc-info` since our own cached state is only a hint.

use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};

use waydroid_core::{ContainerStatus, Error, Paths};

pub const CONTAINER_NAME: &str = "waydroid";

/// Bounded status poll used after every transition request.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_POLL_STEP: Duration = Duration::from_millis(100);

fn lxc_base(binary: &str, paths: &Paths) -> Command {
    let mut cmd = Command::new(binary);
    cmd.arg("-P").arg(paths.lxc()).arg("-n").arg(CONTAINER_NAME);
    cmd
}

/// Installed LXC major version, 0 when lxc-info is absent.
pub fn version() -> u32 {
    let output = Command::new("lxc-info").arg("--version").output();
    match output {
        Ok(out) => parse_version(&String::from_utf8_lossy(&out.stdout)),
        Err(_) => 0,
    }
}

fn parse_version(text: &str) -> u32 {
    text.trim()
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
        .unwrap_or(0)
}

/// Authoritative status. Every failure mode reads as STOPPED.
pub fn status(paths: &Paths) -> ContainerStatus {
    let output = lxc_base("lxc-info", paths).arg("-sH").output();
    match output {
        Ok(out) => ContainerStatus::parse(&String::from_utf8_lossy(&out.stdout)),
        Err(err) => {
            tracing::debug!("lxc-info failed: {err}");
            ContainerStatus::Stopped
        }
    }
}

fn wait_for(paths: &Paths, expected: ContainerStatus) -> Result<()> {
    let deadline = Instant::now() + STATUS_TIMEOUT;
    while Instant::now() < deadline {
        if status(paths) == expected {
            return Ok(());
        }
        std::thread::sleep(STATUS_POLL_STEP);
    }
    Err(Error::StateTransitionTimeout(expected.as_str(), STATUS_TIMEOUT).into())
}

/// Run `/init` in the container. The lxc-start process stays attached as
/// the container supervisor, so it is spawned and left running.
pub fn start(paths: &Paths) -> Result<()> {
    let child = lxc_base("lxc-start", paths)
        .arg("-F")
        .arg("--")
        .arg("/init")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn lxc-start")?;
    tracing::debug!("lxc-start running as pid {}", child.id());
    wait_for(paths, ContainerStatus::Running)
}

/// Forced stop; Android gets no shutdown animation.
pub fn stop(paths: &Paths) -> Result<()> {
    let output = lxc_base("lxc-stop", paths)
        .arg("-k")
        .output()
        .context("failed to run lxc-stop")?;
    if !output.status.success() {
        tracing::warn!(
            "lxc-stop: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    wait_for(paths, ContainerStatus::Stopped)
}

pub fn freeze(paths: &Paths) -> Result<()> {
    let output = lxc_base("lxc-freeze", paths)
        .output()
        .context("failed to run lxc-freeze")?;
    if !output.status.success() {
        bail!(
            "lxc-freeze: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    wait_for(paths, ContainerStatus::Frozen)
}

pub fn unfreeze(paths: &Paths) -> Result<()> {
    let output = lxc_base("lxc-unfreeze", paths)
        .output()
        .context("failed to run lxc-unfreeze")?;
    if !output.status.success() {
        bail!(
            "lxc-unfreeze: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    wait_for(paths, ContainerStatus::Running)
}

/// Attach tuning. The elevated modes stay off unless a caller explicitly
/// asks; they bypass the container's confinement.
#[derive(Debug, Default, Clone)]
pub struct AttachOptions {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Keep host environment out of the container process.
    pub clear_env: bool,
    /// Privileges to retain, e.g. "CGROUP|LSM" to skip the cgroup switch.
    pub elevated_privileges: Option<String>,
}

fn attach_command(paths: &Paths, options: &AttachOptions, command: &[&str]) -> Command {
    let mut cmd = lxc_base("lxc-attach", paths);
    if let Some(uid) = options.uid {
        cmd.arg("-u").arg(uid.to_string());
    }
    if let Some(gid) = options.gid {
        cmd.arg("-g").arg(gid.to_string());
    }
    if options.clear_env {
        cmd.arg("--clear-env");
    }
    if let Some(privileges) = &options.elevated_privileges {
        cmd.arg(format!("--elevated-privileges={privileges}"));
    }
    cmd.arg("--");
    cmd.args(command);
    for (key, value) in android_env(paths) {
        cmd.env(key, value);
    }
    cmd
}

/// Environment Android binaries expect when entered from outside init.
/// BOOTCLASSPATH and friends come from the classpath file the running
/// image wrote; the static entries cover images that predate it.
pub fn android_env(paths: &Paths) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "PATH".to_string(),
            "/product/bin:/apex/com.android.runtime/bin:/apex/com.android.art/bin:\
             /system_ext/bin:/system/bin:/system/xbin:/odm/bin:/vendor/bin:/vendor/xbin"
                .to_string(),
        ),
        ("ANDROID_ROOT".to_string(), "/system".to_string()),
        ("ANDROID_DATA".to_string(), "/data".to_string()),
        ("ANDROID_STORAGE".to_string(), "/storage".to_string()),
        (
            "ANDROID_ART_ROOT".to_string(),
            "/apex/com.android.art".to_string(),
        ),
        (
            "ANDROID_I18N_ROOT".to_string(),
            "/apex/com.android.i18n".to_string(),
        ),
        (
            "ANDROID_TZDATA_ROOT".to_string(),
            "/apex/com.android.tzdata".to_string(),
        ),
        ("EXTERNAL_STORAGE".to_string(), "/mnt/sdcard".to_string()),
    ];
    let classpath = paths.rootfs().join("system/etc/classpath");
    if let Ok(text) = std::fs::read_to_string(&classpath) {
        merge_classpath(&mut env, &text);
    }
    env
}

/// Merge `export KEY value` lines, the format of Android's classpath file.
fn merge_classpath(env: &mut Vec<(String, String)>, text: &str) {
    for line in text.lines() {
        let mut words = line.split_whitespace();
        if words.next() != Some("export") {
            continue;
        }
        let (Some(key), Some(value)) = (words.next(), words.next()) else {
            continue;
        };
        if let Some(existing) = env.iter_mut().find(|(k, _)| k == key) {
            existing.1 = value.to_string();
        } else {
            env.push((key.to_string(), value.to_string()));
        }
    }
}

/// Interactive shell (or a single command) inside the container.
pub fn shell(paths: &Paths, options: &AttachOptions, command: Option<&[&str]>) -> Result<()> {
    if status(paths) != ContainerStatus::Running {
        bail!("container is {}", status(paths));
    }
    let argv = command.unwrap_or(&["/system/bin/sh"]);
    let status = attach_command(paths, options, argv)
        .status()
        .context("failed to run lxc-attach")?;
    if !status.success() {
        tracing::debug!("attach command exited with {status}");
    }
    Ok(())
}

pub fn logcat(paths: &Paths) -> Result<()> {
    shell(
        paths,
        &AttachOptions::default(),
        Some(&["/system/bin/logcat"]),
    )
}

fn attach_capture(paths: &Paths, command: &[&str]) -> Result<String> {
    let output = attach_command(
        paths,
        &AttachOptions { clear_env: true, ..Default::default() },
        command,
    )
    .stderr(Stdio::null())
    .output()
    .context("failed to run lxc-attach")?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Read an Android property from the running container.
pub fn getprop(paths: &Paths, name: &str) -> Result<String> {
    attach_capture(paths, &["getprop", name])
}

pub fn setprop(paths: &Paths, name: &str, value: &str) -> Result<()> {
    attach_capture(paths, &["setprop", name, value]).map(|_| ())
}

/// Block until the property changes and return its new value. Runs the
/// in-container `propwatch` helper; the caller is expected to keep this
/// off the dispatch thread.
pub fn watch_prop(paths: &Paths, name: &str) -> Result<String> {
    attach_capture(paths, &["propwatch", name])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_major() {
        assert_eq!(parse_version("5.0.3\n"), 5);
        assert_eq!(parse_version("2.1"), 2);
        assert_eq!(parse_version(""), 0);
    }

    #[test]
    fn classpath_lines_override_and_extend() {
        let mut env = vec![("ANDROID_ROOT".to_string(), "/system".to_string())];
        merge_classpath(
            &mut env,
            "export BOOTCLASSPATH /apex/com.android.art/javalib/core-oj.jar\n\
             export ANDROID_ROOT /system\n\
             not-an-export FOO bar\n\
             export BROKEN\n",
        );
        assert_eq!(env.len(), 2);
        assert_eq!(env[1].0, "BOOTCLASSPATH");
        assert!(env[1].1.contains("core-oj.jar"));
    }

    #[test]
    fn android_env_has_the_required_roots() {
        let paths = Paths::new("/nonexistent");
        let env = android_env(&paths);
        let get = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());
        assert_eq!(get("ANDROID_ROOT").as_deref(), Some("/system"));
        assert_eq!(get("ANDROID_DATA").as_deref(), Some("/data"));
        assert!(get("PATH").unwrap().contains("/system/bin"));
    }
}
