//! DRI render-node selection and the kernel-driver → Vulkan ICD mapping.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use waydroid_core::{Config, props};

/// Kernel drivers we refuse to hand to the container.
const UNSUPPORTED: &[&str] = &["nvidia"];

/// Selected render node and its paired card node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriNode {
    pub render: PathBuf,
    pub card: PathBuf,
    pub kernel_driver: String,
}

fn kernel_driver_of(render_name: &str) -> Option<String> {
    let uevent = PathBuf::from(format!("/sys/class/drm/{render_name}/device/uevent"));
    props::file_get(&uevent, "DRIVER").ok().flatten()
}

fn minor_of(render_name: &str) -> Option<String> {
    let uevent = PathBuf::from(format!("/sys/class/drm/{render_name}/uevent"));
    props::file_get(&uevent, "MINOR").ok().flatten()
}

fn card_of(render_name: &str) -> PathBuf {
    let pattern = format!("/sys/class/drm/{render_name}/device/drm");
    let mut cards: Vec<_> = fs::read_dir(&pattern)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with("card"))
                .collect()
        })
        .unwrap_or_default();
    cards.sort();
    match cards.first() {
        Some(card) => Path::new("/dev/dri").join(card),
        None => PathBuf::new(),
    }
}

/// Pick the DRI render node for the container. A node pinned in the config
/// is honoured or the whole selection fails; otherwise the first render
/// node with a supported kernel driver wins. `None` means the host has no
/// usable GPU and the caller falls back to software rendering.
pub fn dri_node(cfg: &Config) -> Result<Option<DriNode>> {
    if let Some(pinned) = &cfg.waydroid.drm_device {
        if !pinned.exists() {
            bail!("the configured drm_device {} does not exist", pinned.display());
        }
        let name = pinned
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let driver = kernel_driver_of(&name).unwrap_or_default();
        if UNSUPPORTED.contains(&driver.as_str()) {
            bail!(
                "the configured drm_device {} uses unsupported driver {driver}",
                pinned.display()
            );
        }
        return Ok(Some(DriNode {
            render: pinned.clone(),
            card: card_of(&name),
            kernel_driver: driver,
        }));
    }

    let mut nodes: Vec<_> = fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with("renderD"))
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();

    for name in nodes {
        let driver = kernel_driver_of(&name).unwrap_or_default();
        if UNSUPPORTED.contains(&driver.as_str()) {
            tracing::debug!("skipping {name}: unsupported driver {driver}");
            continue;
        }
        return Ok(Some(DriNode {
            render: Path::new("/dev/dri").join(&name),
            card: card_of(&name),
            kernel_driver: driver,
        }));
    }
    Ok(None)
}

/// Map the kernel driver to the Vulkan ICD tag Android loads. i915 hardware
/// before gen 9 is only served by the hasvk ICD.
pub fn vulkan_driver(node: &DriNode) -> Option<String> {
    if node.kernel_driver == "i915"
        && let Some(generation) = i915_generation(node)
        && generation < 9
    {
        return Some("intel_hasvk".into());
    }
    map_vulkan(&node.kernel_driver).map(str::to_string)
}

fn map_vulkan(kernel_driver: &str) -> Option<&'static str> {
    match kernel_driver {
        "i915" => Some("intel"),
        "amdgpu" | "radeon" => Some("radeon"),
        "panfrost" => Some("panfrost"),
        "msm" | "msm_dpu" => Some("freedreno"),
        "vc4" => Some("broadcom"),
        "nouveau" => Some("nouveau"),
        _ => None,
    }
}

fn i915_generation(node: &DriNode) -> Option<u32> {
    let card_name = node.card.file_name()?.to_string_lossy().into_owned();
    let minor = minor_of(&card_name)?;
    let caps = fs::read_to_string(format!(
        "/sys/kernel/debug/dri/{minor}/i915_capabilities"
    ))
    .ok()?;
    parse_i915_generation(&caps)
}

fn parse_i915_generation(capabilities: &str) -> Option<u32> {
    for line in capabilities.lines() {
        let line = line.trim();
        if line.starts_with("graphics version:") || line.starts_with("gen:") {
            return line.split_whitespace().next_back()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_mapping_covers_the_known_drivers() {
        assert_eq!(map_vulkan("i915"), Some("intel"));
        assert_eq!(map_vulkan("amdgpu"), Some("radeon"));
        assert_eq!(map_vulkan("radeon"), Some("radeon"));
        assert_eq!(map_vulkan("panfrost"), Some("panfrost"));
        assert_eq!(map_vulkan("msm"), Some("freedreno"));
        assert_eq!(map_vulkan("msm_dpu"), Some("freedreno"));
        assert_eq!(map_vulkan("vc4"), Some("broadcom"));
        assert_eq!(map_vulkan("nouveau"), Some("nouveau"));
        assert_eq!(map_vulkan("vmwgfx"), None);
    }

    #[test]
    fn i915_capabilities_parse_both_formats() {
        assert_eq!(
            parse_i915_generation("platform: COFFEELAKE\ngen: 9\n"),
            Some(9)
        );
        assert_eq!(
            parse_i915_generation("graphics version: 12\nmedia version: 12\n"),
            Some(12)
        );
        assert_eq!(parse_i915_generation("platform: UNKNOWN\n"), None);
    }

    #[test]
    fn old_i915_maps_to_hasvk() {
        // Exercised through vulkan_driver only when sysfs is readable, so
        // check the decision table directly.
        assert_eq!(map_vulkan("i915"), Some("intel"));
        assert!(parse_i915_generation("gen: 8\n").unwrap() < 9);
    }
}
