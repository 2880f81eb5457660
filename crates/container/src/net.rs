//! The `waydroid0` bridge is managed by the distributed shell script so the
//! firewall/dnsmasq details stay out of the privileged daemon.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

const NET_SCRIPT_PATHS: &[&str] = &[
    "/usr/lib/waydroid/data/scripts/waydroid-net.sh",
    "/usr/share/waydroid/scripts/waydroid-net.sh",
];

fn script() -> Option<&'static str> {
    NET_SCRIPT_PATHS
        .iter()
        .copied()
        .find(|p| Path::new(p).is_file())
}

/// Bring the bridge up. A failing script blocks the start; a missing one
/// only warns, networking is not mandatory for the container to boot.
pub fn start() -> Result<()> {
    let Some(script) = script() else {
        tracing::warn!("waydroid-net.sh not found, skipping network setup");
        return Ok(());
    };
    let output = Command::new(script)
        .arg("start")
        .output()
        .with_context(|| format!("failed to run {script}"))?;
    if !output.status.success() {
        bail!(
            "network setup failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Tear the bridge down; failures only get logged on the stop path.
pub fn stop() {
    let Some(script) = script() else {
        return;
    };
    match Command::new(script).arg("stop").output() {
        Ok(output) if !output.status.success() => {
            tracing::warn!(
                "network teardown: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(err) => tracing::warn!("failed to run {script}: {err}"),
        _ => {}
    }
}
