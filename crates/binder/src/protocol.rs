//! Wire-protocol selection.
//!
//! The binder parcel layout and the service-manager call convention both
//! changed across Android releases. The SDK level embedded in the mounted
//! system image decides which pair is in effect; the result is persisted to
//! the config so every process on the host agrees without re-reading the
//! image.

use anyhow::{Context, Result};

use waydroid_core::{Config, Paths, props};

/// Parcel-level conventions, by the Android generation that introduced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderProtocol {
    /// Pre-28: bare interface token.
    Aidl1,
    /// 28–29: strict-mode word before the token.
    Aidl2,
    /// 30+: strict mode + work source uid.
    Aidl3,
    /// 31–32: additionally the stability header word.
    Aidl4,
}

/// Service-manager call convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmProtocol {
    /// Classic servicemanager: replies carry the object directly.
    Aidl1,
    /// 28+: dump-priority argument on registration.
    Aidl2,
    /// 30+: AIDL-generated manager, exception word + nullable binder.
    Aidl3,
}

impl BinderProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            BinderProtocol::Aidl1 => "aidl",
            BinderProtocol::Aidl2 => "aidl2",
            BinderProtocol::Aidl3 => "aidl3",
            BinderProtocol::Aidl4 => "aidl4",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aidl" => Some(BinderProtocol::Aidl1),
            "aidl2" => Some(BinderProtocol::Aidl2),
            "aidl3" => Some(BinderProtocol::Aidl3),
            "aidl4" => Some(BinderProtocol::Aidl4),
            _ => None,
        }
    }
}

impl SmProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            SmProtocol::Aidl1 => "aidl",
            SmProtocol::Aidl2 => "aidl2",
            SmProtocol::Aidl3 => "aidl3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aidl" => Some(SmProtocol::Aidl1),
            "aidl2" => Some(SmProtocol::Aidl2),
            "aidl3" => Some(SmProtocol::Aidl3),
            _ => None,
        }
    }
}

/// The pair every stub carries alongside the device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocols {
    pub binder: BinderProtocol,
    pub sm: SmProtocol,
}

impl Protocols {
    /// Total mapping from SDK level. Unknown future levels take the newest
    /// stable pair.
    pub fn from_sdk_level(sdk: u32) -> Self {
        if sdk < 28 {
            Self { binder: BinderProtocol::Aidl1, sm: SmProtocol::Aidl1 }
        } else if sdk < 30 {
            Self { binder: BinderProtocol::Aidl2, sm: SmProtocol::Aidl2 }
        } else if sdk < 31 {
            Self { binder: BinderProtocol::Aidl3, sm: SmProtocol::Aidl3 }
        } else if sdk < 33 {
            Self { binder: BinderProtocol::Aidl4, sm: SmProtocol::Aidl3 }
        } else {
            Self { binder: BinderProtocol::Aidl3, sm: SmProtocol::Aidl3 }
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let binder = cfg
            .waydroid
            .binder_protocol
            .as_deref()
            .and_then(BinderProtocol::parse)
            .context("binder_protocol missing from config, container never started?")?;
        let sm = cfg
            .waydroid
            .service_manager_protocol
            .as_deref()
            .and_then(SmProtocol::parse)
            .context("service_manager_protocol missing from config")?;
        Ok(Self { binder, sm })
    }
}

/// Read the SDK level out of the mounted rootfs and persist the derived
/// protocol pair. Call with the rootfs mounted.
pub fn set_aidl_version(paths: &Paths, cfg: &mut Config) -> Result<()> {
    let build_prop = paths.rootfs().join("system/build.prop");
    let sdk = match props::file_get(&build_prop, "ro.build.version.sdk") {
        Ok(Some(value)) => value.parse().unwrap_or(0),
        _ => {
            tracing::error!("failed to parse android version from system.img");
            0
        }
    };
    let protocols = Protocols::from_sdk_level(sdk);
    cfg.waydroid.binder_protocol = Some(protocols.binder.as_str().to_string());
    cfg.waydroid.service_manager_protocol = Some(protocols.sm.as_str().to_string());
    cfg.save(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_mapping_is_reproduced_exactly() {
        let cases = [
            (25, BinderProtocol::Aidl1, SmProtocol::Aidl1),
            (27, BinderProtocol::Aidl1, SmProtocol::Aidl1),
            (28, BinderProtocol::Aidl2, SmProtocol::Aidl2),
            (29, BinderProtocol::Aidl2, SmProtocol::Aidl2),
            (30, BinderProtocol::Aidl3, SmProtocol::Aidl3),
            (31, BinderProtocol::Aidl4, SmProtocol::Aidl3),
            (32, BinderProtocol::Aidl4, SmProtocol::Aidl3),
            (33, BinderProtocol::Aidl3, SmProtocol::Aidl3),
            (34, BinderProtocol::Aidl3, SmProtocol::Aidl3),
        ];
        for (sdk, binder, sm) in cases {
            let p = Protocols::from_sdk_level(sdk);
            assert_eq!(p.binder, binder, "sdk {sdk}");
            assert_eq!(p.sm, sm, "sdk {sdk}");
        }
    }

    #[test]
    fn protocol_names_round_trip_through_config() {
        for p in [
            BinderProtocol::Aidl1,
            BinderProtocol::Aidl2,
            BinderProtocol::Aidl3,
            BinderProtocol::Aidl4,
        ] {
            assert_eq!(BinderProtocol::parse(p.as_str()), Some(p));
        }
        for p in [SmProtocol::Aidl1, SmProtocol::Aidl2, SmProtocol::Aidl3] {
            assert_eq!(SmProtocol::parse(p.as_str()), Some(p));
        }
        assert_eq!(BinderProtocol::parse("hidl"), None);
    }

    #[test]
    fn set_aidl_version_reads_the_image_build_prop() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::new(tmp.path());
        let system = paths.rootfs().join("system");
        std::fs::create_dir_all(&system).unwrap();
        std::fs::write(system.join("build.prop"), "ro.build.version.sdk=32\n").unwrap();

        let mut cfg = Config::default();
        set_aidl_version(&paths, &mut cfg).unwrap();
        assert_eq!(cfg.waydroid.binder_protocol.as_deref(), Some("aidl4"));
        assert_eq!(cfg.waydroid.service_manager_protocol.as_deref(), Some("aidl3"));

        let reloaded = Config::load(&paths).unwrap();
        let p = Protocols::from_config(&reloaded).unwrap();
        assert_eq!(p.binder, BinderProtocol::Aidl4);
    }
}
