//! User-monitor service: Android reports unlock and package changes; the
//! session manager reacts (unlock gates the rest of the session services).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use waydroid_binder::protocol::Protocols;
use waydroid_binder::services::user_monitor::{self, UserMonitorCallbacks};

use super::{ActivityTracker, SessionEvent};

pub fn spawn(
    device: PathBuf,
    protocols: Protocols,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    activity: Arc<ActivityTracker>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("user-monitor".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let events = events.clone();
                let activity_unlock = activity.clone();
                let activity_package = activity.clone();
                let callbacks = UserMonitorCallbacks {
                    user_unlocked: Box::new(move |uid| {
                        tracing::info!("Android with user {uid} is ready");
                        activity_unlock.touch();
                        let _ = events.send(SessionEvent::UserUnlocked(uid));
                    }),
                    package_state_changed: Box::new(move |state, package, uid| {
                        tracing::debug!("package {package} (uid {uid}) changed: {state:?}");
                        activity_package.touch();
                    }),
                };
                if let Err(err) = user_monitor::run(&device, protocols, callbacks, stop.clone()) {
                    tracing::warn!("user monitor stopped: {err:#}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
        .expect("failed to spawn user-monitor thread")
}
