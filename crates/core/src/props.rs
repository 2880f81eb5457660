//! Android property helpers: `build.prop`-style file parsing and host-side
//! `getprop`/`setprop` shell-outs (present on Halium hosts, absent on
//! mainline ones — absence simply yields empty values).

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

/// Read one key from a `key=value` property file. Comments and blank lines
/// are skipped; the first match wins.
pub fn file_get(file: &Path, key: &str) -> Result<Option<String>> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    Ok(parse_prop(&text, key))
}

fn parse_prop(text: &str, key: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=')
            && k == key
        {
            return Some(v.to_string());
        }
    }
    None
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
        })
        .unwrap_or(false)
}

/// Query a host Android property. Returns an empty string when the host has
/// no `getprop` or the property is unset, matching Android semantics.
pub fn host_get(prop: &str) -> String {
    if !which("getprop") {
        return String::new();
    }
    match Command::new("getprop").arg(prop).output() {
        Ok(out) => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        Err(err) => {
            tracing::debug!("getprop {prop} failed: {err}");
            String::new()
        }
    }
}

pub fn host_set(prop: &str, value: &str) -> Result<()> {
    if !which("setprop") {
        return Ok(());
    }
    let status = Command::new("setprop")
        .args([prop, value])
        .status()
        .context("failed to run setprop")?;
    if !status.success() {
        tracing::warn!("setprop {prop} {value} exited with {status}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_first_match_and_skips_comments() {
        let text = "\
# build fingerprint
ro.build.version.sdk=30
ro.build.version.sdk=31

ro.product.device=waydroid
";
        assert_eq!(parse_prop(text, "ro.build.version.sdk").as_deref(), Some("30"));
        assert_eq!(parse_prop(text, "ro.product.device").as_deref(), Some("waydroid"));
        assert_eq!(parse_prop(text, "ro.missing"), None);
    }

    #[test]
    fn value_may_contain_equals() {
        let text = "ro.boot.cmdline=console=ttyS0 rw\n";
        assert_eq!(
            parse_prop(text, "ro.boot.cmdline").as_deref(),
            Some("console=ttyS0 rw")
        );
    }

    #[test]
    fn file_get_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ro.vndk.version=32").unwrap();
        let value = file_get(file.path(), "ro.vndk.version").unwrap();
        assert_eq!(value.as_deref(), Some("32"));
    }
}
