//! Clipboard bridge backed by wl-clipboard. Missing tools disable the
//! service with a warning instead of failing the session.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use waydroid_binder::protocol::Protocols;
use waydroid_binder::services::clipboard::{self, ClipboardCallbacks};

use super::ActivityTracker;

fn which(binary: &str) -> bool {
    std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).any(|dir| dir.join(binary).is_file()))
        .unwrap_or(false)
}

/// wl-copy / wl-paste wrapper.
#[derive(Clone, Copy)]
pub struct WaylandClipboard;

impl WaylandClipboard {
    pub fn detect() -> Option<Self> {
        if which("wl-copy") && which("wl-paste") {
            Some(Self)
        } else {
            None
        }
    }

    pub fn copy(&self, text: &str) {
        let child = Command::new("wl-copy")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match child {
            Ok(mut child) => {
                if let Some(stdin) = child.stdin.as_mut()
                    && let Err(err) = stdin.write_all(text.as_bytes())
                {
                    tracing::debug!("wl-copy write failed: {err}");
                }
                let _ = child.wait();
            }
            Err(err) => tracing::debug!("wl-copy failed: {err}"),
        }
    }

    pub fn paste(&self) -> String {
        match Command::new("wl-paste").arg("--no-newline").output() {
            Ok(out) if out.status.success() => {
                String::from_utf8_lossy(&out.stdout).into_owned()
            }
            Ok(out) => {
                tracing::debug!("wl-paste exited with {}", out.status);
                String::new()
            }
            Err(err) => {
                tracing::debug!("wl-paste failed: {err}");
                String::new()
            }
        }
    }
}

pub fn spawn(
    device: PathBuf,
    protocols: Protocols,
    activity: Arc<ActivityTracker>,
    stop: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    let Some(handler) = WaylandClipboard::detect() else {
        tracing::warn!("wl-clipboard is not installed, clipboard sharing disabled");
        return None;
    };

    let handle = std::thread::Builder::new()
        .name("clipboard".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let activity_send = activity.clone();
                let activity_get = activity.clone();
                let callbacks = ClipboardCallbacks {
                    send: Box::new(move |text| {
                        activity_send.touch();
                        handler.copy(&text);
                    }),
                    get: Box::new(move || {
                        activity_get.touch();
                        handler.paste()
                    }),
                };
                if let Err(err) = clipboard::run(&device, protocols, callbacks, stop.clone()) {
                    tracing::warn!("clipboard service stopped: {err:#}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
        .expect("failed to spawn clipboard thread");
    Some(handle)
}
