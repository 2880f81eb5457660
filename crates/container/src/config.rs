//! Container configuration synthesis: the base LXC config, the shared
//! device-node mount file, the per-session mount file, and the Android
//! property seed files.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use waydroid_core::version::TOOLS_VERSION;
use waydroid_core::{Config, Paths, SessionDescriptor, props};
use waydroid_sandbox::DriverSelection;
use waydroid_sandbox::gpu::{self, DriNode};

use crate::lxc;

/// Base config for LXC 3 and newer.
const BASE_CONFIG: &str = "\
# Generated by waydroid init, do not edit.
lxc.arch = LXCARCH
lxc.rootfs.path = dir:WORKDIR/rootfs
lxc.apparmor.profile = unconfined
lxc.autodev = 0
lxc.mount.auto = proc:mixed sys:mixed cgroup:mixed
lxc.uts.name = waydroid
lxc.tty.max = 0
lxc.pty.max = 1024
lxc.net.0.type = veth
lxc.net.0.link = waydroid0
lxc.net.0.flags = up
lxc.seccomp.profile = WORKDIR/lxc/waydroid/waydroid.seccomp
lxc.include = WORKDIR/lxc/waydroid/config_nodes
lxc.include = WORKDIR/lxc/waydroid/config_session
";

/// Legacy key spellings for LXC 2 hosts.
const BASE_CONFIG_LEGACY: &str = "\
# Generated by waydroid init, do not edit.
lxc.arch = LXCARCH
lxc.rootfs = WORKDIR/rootfs
lxc.aa_profile = unconfined
lxc.autodev = 0
lxc.mount.auto = proc:mixed sys:mixed cgroup:mixed
lxc.utsname = waydroid
lxc.tty = 0
lxc.pts = 1024
lxc.network.type = veth
lxc.network.link = waydroid0
lxc.network.flags = up
lxc.seccomp = WORKDIR/lxc/waydroid/waydroid.seccomp
lxc.include = WORKDIR/lxc/waydroid/config_nodes
lxc.include = WORKDIR/lxc/waydroid/config_session
";

/// Module-loading and kexec ban, the stock LXC hardening list.
const SECCOMP_PROFILE: &str = "\
2
blacklist
reject_force_umount
[all]
kexec_load errno 1
open_by_handle_at errno 1
init_module errno 1
finit_module errno 1
delete_module errno 1
";

fn apparmor_enabled() -> bool {
    Path::new("/sys/kernel/security/apparmor").exists()
}

fn render_base_config(template: &str, arch: &str, work: &Path, apparmor: bool) -> String {
    let mut text = template
        .replace("LXCARCH", arch)
        .replace("WORKDIR", &work.to_string_lossy());
    if apparmor {
        text = text
            .replace(
                "lxc.apparmor.profile = unconfined",
                "lxc.apparmor.profile = lxc-waydroid",
            )
            .replace(
                "lxc.aa_profile = unconfined",
                "lxc.aa_profile = lxc-waydroid",
            );
    }
    text
}

/// Write the base LXC config and the seccomp profile.
pub fn write_base_config(paths: &Paths, arch: &str) -> Result<()> {
    let lxc_version = lxc::version();
    if lxc_version == 0 {
        bail!("LXC is not installed");
    }
    let template = if lxc_version <= 2 { BASE_CONFIG_LEGACY } else { BASE_CONFIG };

    let dir = paths.lxc_container();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    fs::write(
        dir.join("config"),
        render_base_config(template, arch, paths.work(), apparmor_enabled()),
    )
    .context("failed to write lxc config")?;
    fs::write(dir.join("waydroid.seccomp"), SECCOMP_PROFILE)
        .context("failed to write seccomp profile")?;
    // The session file must exist for lxc.include even before any session.
    let session_file = dir.join("config_session");
    if !session_file.exists() {
        fs::write(&session_file, "")?;
    }
    Ok(())
}

/// Builder for `lxc.mount.entry` lines.
#[derive(Default)]
struct MountEntries {
    lines: Vec<String>,
}

impl MountEntries {
    /// Append one entry. With `check` set the entry is skipped (and false
    /// returned) when the source does not exist on this host.
    fn add(&mut self, src: &str, dst: Option<&str>, fstype: &str, options: &str, check: bool) -> bool {
        if check && !Path::new(src).exists() {
            return false;
        }
        let dst = match dst {
            Some(dst) => dst.to_string(),
            None => src.trim_start_matches('/').to_string(),
        };
        self.lines
            .push(format!("lxc.mount.entry = {src} {dst} {fstype} {options}"));
        true
    }

    fn bind(&mut self, src: &str) -> bool {
        self.add(src, None, "none", "bind,create=file,optional 0 0", true)
    }

    fn bind_to(&mut self, src: &str, dst: &str, check: bool) -> bool {
        self.add(src, Some(dst), "none", "bind,create=file,optional 0 0", check)
    }

    fn bind_dir(&mut self, src: &str) -> bool {
        self.add(src, None, "none", "bind,create=dir,optional 0 0", true)
    }
}

fn glob_devices(dir: &str, prefix: &str) -> Vec<String> {
    let mut found: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(prefix))
                .map(|name| format!("{dir}/{name}"))
                .collect()
        })
        .unwrap_or_default();
    found.sort();
    found
}

/// Device and socket mounts shared by every session, written to
/// `config_nodes` at init/upgrade time.
pub fn generate_nodes_config(
    paths: &Paths,
    selection: &DriverSelection,
    vendor_type: &str,
    dri: Option<&DriNode>,
) -> Result<()> {
    let mut entries = MountEntries::default();

    // Fresh /dev, then the unconditional nodes.
    entries.add("tmpfs", Some("dev"), "tmpfs", "nosuid 0 0", false);
    entries.bind("/dev/zero");
    entries.bind("/dev/null");
    entries.bind("/dev/full");
    entries.add("/dev/ashmem", None, "none", "bind,create=file,optional 0 0", false);
    entries.bind("/dev/fuse");
    entries.bind("/dev/ion");
    entries.bind("/dev/tty");
    entries.bind_dir("/dev/char");

    // Graphics nodes.
    entries.bind("/dev/kgsl-3d0");
    entries.bind("/dev/mali0");
    entries.bind("/dev/pvr_sync");
    entries.bind("/dev/pmsg0");
    entries.bind("/dev/dxg");
    entries.bind_dir("/dev/dri");
    entries.bind_dir("/dev/dma_heap");
    if let Some(dri) = dri {
        entries.bind(&dri.render.to_string_lossy());
        if dri.card.as_os_str().is_empty() {
            tracing::debug!("render node {} has no card node", dri.render.display());
        } else {
            entries.bind(&dri.card.to_string_lossy());
        }
    }
    for node in glob_devices("/dev", "fb") {
        entries.bind(&node);
    }
    for node in glob_devices("/dev/graphics", "fb") {
        entries.bind(&node);
    }
    for node in glob_devices("/dev", "video") {
        entries.bind(&node);
    }

    // Binder family, remapped to the canonical container names.
    entries.bind_to(&format!("/dev/{}", selection.binder), "dev/binder", false);
    entries.bind_to(&format!("/dev/{}", selection.vndbinder), "dev/vndbinder", false);
    entries.bind_to(&format!("/dev/{}", selection.hwbinder), "dev/hwbinder", false);

    if vendor_type != "MAINLINE" {
        if !entries.bind_to("/dev/hwbinder", "dev/host_hwbinder", true) {
            bail!("binder node \"hwbinder\" of host not found");
        }
        entries.add("/vendor", Some("vendor_extra"), "none", "rbind,optional 0 0", false);
    }

    // adb and input plumbing.
    entries.add(
        "none",
        Some("dev/pts"),
        "devpts",
        "defaults,mode=644,ptmxmode=666,create=dir 0 0",
        false,
    );
    entries.bind("/dev/uhid");
    entries.bind("/dev/tun");

    // Low memory killer sysfs.
    entries.bind_dir("/sys/module/lowmemorykiller");

    // Android /data; the per-session file rebinds it when a session is up.
    entries.add("tmpfs", Some("mnt"), "tmpfs", "mode=0755,uid=0,gid=1000 0 0", false);
    entries.add(
        &paths.data().to_string_lossy(),
        Some("data"),
        "none",
        "bind 0 0",
        false,
    );

    // Host permission XMLs collected at init.
    entries.add(
        &paths.host_perms().to_string_lossy(),
        Some("vendor/etc/host-permissions"),
        "none",
        "bind,optional 0 0",
        false,
    );

    // HWC fencing and debugging.
    entries.bind("/dev/sw_sync");
    entries.add(
        "/sys/kernel/debug",
        None,
        "none",
        "rbind,create=dir,optional 0 0",
        true,
    );

    // Vibrator sysfs, where the host exposes one.
    entries.bind_dir("/sys/class/leds/vibrator");
    entries.bind_dir("/sys/class/timed_output/vibrator");

    // Mediatek codec nodes.
    entries.bind("/dev/Vcodec");
    entries.bind("/dev/MTK_SMI");
    entries.bind("/dev/mdp_sync");
    entries.bind("/dev/mtk_cmdq");
    entries.bind("/dev/mtk_mdp");

    // WSLg passthrough.
    entries.add("tmpfs", Some("mnt_extra"), "tmpfs", "nodev 0 0", false);
    entries.add(
        "/mnt/wslg",
        Some("mnt_extra/wslg"),
        "none",
        "rbind,create=dir,optional 0 0",
        true,
    );

    // Scratch space; session sockets are materialized under run/.
    entries.add("tmpfs", Some("tmp"), "tmpfs", "nodev 0 0", false);
    entries.add("tmpfs", Some("var"), "tmpfs", "nodev 0 0", false);
    entries.add("/var/run", None, "none", "rbind,create=dir,optional 0 0", true);
    entries.add("tmpfs", Some("run"), "tmpfs", "nodev,mode=0755 0 0", false);

    // NFC controller config, present only on hosts with one.
    entries.bind("/vendor/etc/libnfc-nci.conf");

    let file = paths.lxc_container().join("config_nodes");
    fs::create_dir_all(paths.lxc_container())?;
    fs::write(&file, entries.lines.join("\n") + "\n")
        .with_context(|| format!("failed to write {}", file.display()))?;
    Ok(())
}

/// Reject a bind source the requesting user does not own, or one that
/// could break out of the one-entry-per-line config format.
fn validate_session_source(path: &Path, uid: u32) -> Result<()> {
    let text = path
        .to_str()
        .with_context(|| format!("non-UTF-8 session path {}", path.display()))?;
    if text.contains('\n') {
        bail!("session path contains a newline: {}", path.display());
    }
    let meta = fs::metadata(path)
        .with_context(|| format!("session path does not exist: {}", path.display()))?;
    if meta.uid() != uid {
        bail!(
            "session path {} is not owned by uid {uid}",
            path.display()
        );
    }
    Ok(())
}

/// Per-session mounts: the Wayland socket, the optional Pulse socket, the
/// Android data directory, and the runtime-dir tmpfs they live in.
pub fn generate_session_config(paths: &Paths, session: &SessionDescriptor) -> Result<()> {
    let uid = session.user_id;
    let gid = session.group_id;
    let runtime_dst = format!("run/user/{uid}");

    let mut entries = MountEntries::default();
    entries.add(
        "tmpfs",
        Some(&runtime_dst),
        "tmpfs",
        &format!("nosuid,nodev,mode=0700,uid={uid},gid={gid},create=dir 0 0"),
        false,
    );

    let wayland_socket = session.wayland_socket();
    validate_session_source(&wayland_socket, uid)?;
    let display_name = wayland_socket
        .file_name()
        .context("wayland socket path has no file name")?
        .to_string_lossy();
    entries.add(
        &wayland_socket.to_string_lossy(),
        Some(&format!("{runtime_dst}/{display_name}")),
        "none",
        "bind,create=file 0 0",
        false,
    );

    let pulse_socket = session.pulse_socket();
    if pulse_socket.exists() {
        validate_session_source(&pulse_socket, uid)?;
        entries.add(
            &pulse_socket.to_string_lossy(),
            Some(&format!("{runtime_dst}/pulse/native")),
            "none",
            "bind,create=file 0 0",
            false,
        );
    } else {
        tracing::warn!("no pulse socket at {}, audio will be muted", pulse_socket.display());
    }

    validate_session_source(&session.waydroid_data, uid)?;
    entries.add(
        &session.waydroid_data.to_string_lossy(),
        Some("data"),
        "none",
        "bind 0 0",
        false,
    );

    let file = paths.lxc_container().join("config_session");
    fs::write(&file, entries.lines.join("\n") + "\n")
        .with_context(|| format!("failed to write {}", file.display()))?;
    Ok(())
}

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

/// Resolve a HAL suffix by probing the host vendor libraries the way
/// Android's HAL loader would (`<hal>.<variant>.so`).
fn find_hal(hardware: &str) -> String {
    const HARDWARE_PROPS: &[&str] = &[
        "ro.hardware.",
        "ro.hardware",
        "ro.product.board",
        "ro.arch",
        "ro.board.platform",
    ];
    for prop in HARDWARE_PROPS {
        let prop = if let Some(stripped) = prop.strip_suffix('.') {
            format!("{stripped}.{hardware}")
        } else {
            prop.to_string()
        };
        let variant = props::host_get(&prop);
        if variant.is_empty() {
            continue;
        }
        for lib in ["lib", "lib64"] {
            let hal = PathBuf::from(format!("/vendor/{lib}/hw/{hardware}.{variant}.so"));
            if let Ok(resolved) = fs::canonicalize(&hal)
                && resolved.is_file()
            {
                return variant;
            }
        }
    }
    String::new()
}

/// Synthesize `waydroid_base.prop` from host introspection. Captured once
/// at init/upgrade; the per-session file appends to it.
pub fn make_base_props(
    paths: &Paths,
    cfg: &Config,
    dri: Option<&DriNode>,
    has_ashmem: bool,
) -> Result<()> {
    let mut lines: Vec<String> = Vec::new();

    if !has_ashmem {
        lines.push("sys.use_memfd=true".into());
    }
    if !cfg.waydroid.auto_adb {
        lines.push("ro.adb.secure=1".into());
    }

    // Graphics triple: host HAL, then DRI-backed Mesa, then SwiftShader.
    let mut egl = props::host_get("ro.hardware.egl");
    let mut gralloc = find_hal("gralloc");
    if gralloc.is_empty() {
        if dri.is_some() {
            gralloc = "gbm".into();
            egl = "mesa".into();
        } else {
            gralloc = "default".into();
            egl = "swiftshader".into();
        }
        lines.push("debug.stagefright.ccodec=0".into());
    }
    lines.push(format!("ro.hardware.gralloc={gralloc}"));
    if !egl.is_empty() {
        lines.push(format!("ro.hardware.egl={egl}"));
    }

    let mut vulkan = find_hal("vulkan");
    if vulkan.is_empty()
        && let Some(dri) = dri
    {
        vulkan = gpu::vulkan_driver(dri).unwrap_or_default();
    }
    if !vulkan.is_empty() {
        lines.push(format!("ro.hardware.vulkan={vulkan}"));
    }

    let media_profiles = props::host_get("media.settings.xml");
    if !media_profiles.is_empty() {
        lines.push(format!(
            "media.settings.xml={}",
            remap_vendor_paths(&media_profiles)
        ));
    }
    let ccodec = props::host_get("debug.stagefright.ccodec");
    if !ccodec.is_empty() {
        lines.push(format!("debug.stagefright.ccodec={ccodec}"));
    }
    let ext_library = props::host_get("ro.vendor.extension_library");
    if !ext_library.is_empty() {
        lines.push(format!(
            "ro.vendor.extension_library={}",
            remap_vendor_paths(&ext_library)
        ));
    }

    let mut opengles = props::host_get("ro.opengles.version");
    if opengles.is_empty() {
        opengles = "196610".into();
    }
    lines.push(format!("ro.opengles.version={opengles}"));

    if cfg.waydroid.system_ota.is_empty() {
        lines.push("waydroid.updater.disabled=true".into());
    } else {
        lines.push(format!("waydroid.system_ota={}", cfg.waydroid.system_ota));
        lines.push(format!("waydroid.vendor_ota={}", cfg.waydroid.vendor_ota));
    }
    let fingerprint = props::host_get("ro.vendor.build.fingerprint");
    if !fingerprint.is_empty() {
        lines.push(format!("waydroid.vendor_fingerprint={fingerprint}"));
    }
    lines.push(format!("waydroid.tools_version={TOOLS_VERSION}"));

    if cfg.waydroid.vendor_type == "MAINLINE" {
        lines.push("ro.vndk.lite=true".into());
        lines.push("ro.hardware.camera=v4l2".into());
    } else if props::host_get("ro.treble.enabled") != "true" {
        // Pre-Treble vendors load the camera HAL by variant name.
        let camera = find_hal("camera");
        if !camera.is_empty() {
            lines.push(format!("ro.hardware.camera={camera}"));
        }
    }

    fs::create_dir_all(paths.work())?;
    fs::write(paths.base_props(), lines.join("\n") + "\n")
        .context("failed to write waydroid_base.prop")?;
    Ok(())
}

fn remap_vendor_paths(value: &str) -> String {
    value
        .replace("vendor/", "vendor_extra/")
        .replace("odm/", "odm_extra/")
}

/// Parse a props file back into ordered key/value pairs.
fn parse_props(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .filter_map(|l| {
            l.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Apply `[properties]` overrides: each key ends up exactly once, with the
/// override value winning over any default.
fn merge_properties(
    mut lines: Vec<(String, String)>,
    overrides: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    for (key, value) in overrides {
        lines.retain(|(k, _)| k != key);
        lines.push((key.clone(), value.clone()));
    }
    lines
}

/// Render the per-session property file (`waydroid.prop`), the one bind
/// mounted into the rootfs at `vendor/waydroid.prop`.
pub fn make_session_props(
    paths: &Paths,
    cfg: &Config,
    session: &SessionDescriptor,
) -> Result<()> {
    let base = fs::read_to_string(paths.base_props()).unwrap_or_default();
    let mut lines = parse_props(&base);

    let runtime_dir = format!("/run/user/{}", session.user_id);
    let display_name = session
        .wayland_socket()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "wayland-0".into());

    lines.push(("waydroid.host.user".into(), session.user_name.clone()));
    lines.push(("waydroid.host.uid".into(), session.user_id.to_string()));
    lines.push(("waydroid.host.gid".into(), session.group_id.to_string()));
    lines.push((
        "waydroid.host_data_path".into(),
        session.waydroid_data.to_string_lossy().into_owned(),
    ));
    lines.push((
        "waydroid.background_start".into(),
        session.background_start.to_string(),
    ));
    lines.push(("waydroid.xdg_runtime_dir".into(), runtime_dir.clone()));
    lines.push((
        "waydroid.pulse_runtime_path".into(),
        format!("{runtime_dir}/pulse"),
    ));
    lines.push(("waydroid.wayland_display".into(), display_name));

    if !which("waydroid-sensord") {
        lines.push(("waydroid.stub_sensors_hal".into(), "1".into()));
    }
    if session.lcd_density > 0 {
        lines.push((
            "ro.sf.lcd_density".into(),
            session.lcd_density.to_string(),
        ));
    }

    let lines = merge_properties(lines, &cfg.properties);
    let text: String = lines
        .into_iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect();
    fs::write(paths.session_props(), text).context("failed to write waydroid.prop")?;
    Ok(())
}

/// Copy NFC / consumer-IR permission XMLs from the host vendor/odm trees
/// into the overlay bound at `vendor/etc/host-permissions`.
pub fn setup_host_perms(paths: &Paths) -> Result<()> {
    let dest = paths.host_perms();
    fs::create_dir_all(&dest).with_context(|| format!("failed to create {}", dest.display()))?;

    let sku = props::host_get("ro.boot.product.hardware.sku");
    let mut dirs = vec![
        PathBuf::from("/vendor/etc/permissions"),
        PathBuf::from("/odm/etc/permissions"),
    ];
    if !sku.is_empty() {
        dirs.push(PathBuf::from(format!("/odm/etc/permissions/sku_{sku}")));
    }

    for dir in dirs {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("android.hardware.nfc.")
                || name == "android.hardware.consumerir.xml"
            {
                fs::copy(entry.path(), dest.join(&name))
                    .with_context(|| format!("failed to copy {}", entry.path().display()))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_config_substitutes_arch_and_workdir() {
        let text = render_base_config(BASE_CONFIG, "x86_64", Path::new("/var/lib/waydroid"), false);
        assert!(text.contains("lxc.arch = x86_64"));
        assert!(text.contains("lxc.rootfs.path = dir:/var/lib/waydroid/rootfs"));
        assert!(text.contains("lxc.include = /var/lib/waydroid/lxc/waydroid/config_nodes"));
        assert!(text.contains("lxc.apparmor.profile = unconfined"));
        assert!(!text.contains("LXCARCH"));
    }

    #[test]
    fn apparmor_profile_is_swapped_when_enabled() {
        let v3 = render_base_config(BASE_CONFIG, "arm64", Path::new("/w"), true);
        assert!(v3.contains("lxc.apparmor.profile = lxc-waydroid"));
        let v1 = render_base_config(BASE_CONFIG_LEGACY, "arm64", Path::new("/w"), true);
        assert!(v1.contains("lxc.aa_profile = lxc-waydroid"));
    }

    #[test]
    fn mount_entry_defaults_dst_to_relative_src() {
        let mut entries = MountEntries::default();
        entries.add("/dev/zero", None, "none", "bind,create=file,optional 0 0", false);
        assert_eq!(
            entries.lines[0],
            "lxc.mount.entry = /dev/zero dev/zero none bind,create=file,optional 0 0"
        );
    }

    #[test]
    fn missing_sources_are_skipped_when_checked() {
        let mut entries = MountEntries::default();
        assert!(!entries.bind("/dev/definitely-not-a-node"));
        assert!(entries.lines.is_empty());
    }

    #[test]
    fn session_sources_reject_newlines() {
        let err = validate_session_source(Path::new("/tmp/evil\npath"), 0).unwrap_err();
        assert!(err.to_string().contains("newline"));
    }

    #[test]
    fn session_sources_must_be_owned_by_the_user() {
        let tmp = tempfile::tempdir().unwrap();
        let mine = nix::unistd::Uid::current().as_raw();
        assert!(validate_session_source(tmp.path(), mine).is_ok());
        assert!(validate_session_source(tmp.path(), mine.wrapping_add(1)).is_err());
    }

    #[test]
    fn property_overrides_win_and_appear_once() {
        let defaults = vec![
            ("ro.hardware.gralloc".to_string(), "gbm".to_string()),
            ("ro.opengles.version".to_string(), "196610".to_string()),
        ];
        let mut overrides = BTreeMap::new();
        overrides.insert("ro.hardware.gralloc".to_string(), "minigbm".to_string());
        overrides.insert("persist.waydroid.multi_windows".to_string(), "true".to_string());

        let merged = merge_properties(defaults, &overrides);
        let grallocs: Vec<_> = merged.iter().filter(|(k, _)| k == "ro.hardware.gralloc").collect();
        assert_eq!(grallocs.len(), 1);
        assert_eq!(grallocs[0].1, "minigbm");
        assert!(merged.iter().any(|(k, v)| k == "persist.waydroid.multi_windows" && v == "true"));
        assert!(merged.iter().any(|(k, _)| k == "ro.opengles.version"));
    }

    #[test]
    fn parse_props_skips_comments() {
        let parsed = parse_props("# header\nro.x=1\n\nro.y=a=b\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], ("ro.y".to_string(), "a=b".to_string()));
    }

    #[test]
    fn vendor_paths_are_remapped() {
        assert_eq!(
            remap_vendor_paths("/vendor/etc/media.xml"),
            "/vendor_extra/etc/media.xml"
        );
        assert_eq!(
            remap_vendor_paths("/odm/lib64/libext.so"),
            "/odm_extra/lib64/libext.so"
        );
    }
}
