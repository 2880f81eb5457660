//! Compositor liveness check run before a session descriptor ever leaves
//! the process. A missing socket is the common misconfiguration and gets a
//! precise message; a present-but-dead socket is caught by connecting.

use anyhow::{Result, bail};
use wayland_client::Display;

use waydroid_core::SessionDescriptor;

pub fn ensure_compositor(session: &SessionDescriptor) -> Result<()> {
    let socket = session.wayland_socket();
    if !socket.exists() {
        bail!(
            "Wayland socket {} does not exist, is your compositor running?",
            socket.display()
        );
    }
    // The display name handles both the bare-name and absolute-path forms.
    match Display::connect_to_name(session.wayland_display.clone()) {
        Ok(_display) => Ok(()),
        Err(err) => bail!(
            "failed to connect to Wayland display \"{}\": {err}",
            session.wayland_display
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_socket_fails_with_the_socket_path() {
        let session = SessionDescriptor {
            user_name: "alice".into(),
            user_id: 1000,
            group_id: 1000,
            host_user: "/home/alice".into(),
            pid: 1,
            xdg_data_home: "/home/alice/.local/share".into(),
            xdg_runtime_dir: "/run/user/1000".into(),
            wayland_display: "wayland-0".into(),
            pulse_runtime_path: "/run/user/1000/pulse".into(),
            waydroid_data: "/home/alice/.local/share/waydroid/data".into(),
            lcd_density: 0,
            background_start: false,
        };
        let err = ensure_compositor(&session).unwrap_err();
        assert!(err.to_string().contains("/run/user/1000/wayland-0"));
        assert!(err.to_string().contains("does not exist"));
    }
}
