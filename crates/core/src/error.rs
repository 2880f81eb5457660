use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error kinds surfaced across the control plane.
///
/// Most functions return `anyhow::Result`; these variants are attached where
/// a caller (or a test) needs to tell the failure classes apart. Teardown
/// paths log filesystem errors instead of raising them, so none of these
/// ever escape from an unmount loop.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} does not exist, did you run \"waydroid init\"?")]
    ConfigMissing(PathBuf),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("session rejected: {0}")]
    SessionMismatch(String),

    #[error("binder node \"{0}\" not found")]
    DriverUnavailable(String),

    #[error("downloaded image hash does not match, expected: {expected}")]
    ImageIntegrity { expected: String },

    #[error("mount failed: {} -> {}", src.display(), dst.display())]
    MountFailure { src: PathBuf, dst: PathBuf },

    #[error("failed to reach service \"{0}\"")]
    RpcUnavailable(String),

    #[error("container did not reach {0} within {1:?}")]
    StateTransitionTimeout(&'static str, Duration),

    #[error("not authorized to call {0}")]
    PolicyDenied(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_object() {
        let err = Error::DriverUnavailable("vndbinder".into());
        assert!(err.to_string().contains("vndbinder"));

        let err = Error::MountFailure {
            src: PathBuf::from("/var/lib/waydroid/images/system.img"),
            dst: PathBuf::from("/var/lib/waydroid/rootfs"),
        };
        assert!(err.to_string().contains("rootfs"));

        let err = Error::StateTransitionTimeout("RUNNING", Duration::from_secs(10));
        assert!(err.to_string().contains("RUNNING"));
    }
}
