//! Auxiliary per-session services. Each runs on its own named thread and
//! re-registers with the Android service manager whenever it reappears;
//! the session manager owns the shared stop flag.

pub mod clipboard;
pub mod gnss;
pub mod notifications;
pub mod user_monitor;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use waydroid_binder::protocol::Protocols;

/// Anything the session manager needs to hear about from the services.
#[derive(Debug)]
pub enum SessionEvent {
    UserUnlocked(i32),
}

/// Last-activity clock for the optional idle shutdown. Every serviced
/// request from Android counts as activity.
#[derive(Debug)]
pub struct ActivityTracker {
    last: Mutex<Instant>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self { last: Mutex::new(Instant::now()) }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().unwrap().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AuxServices {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl AuxServices {
    /// Start the user monitor, clipboard, notification and GNSS services.
    pub fn start(
        device: PathBuf,
        protocols: Protocols,
        events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        threads.push(user_monitor::spawn(
            device.clone(),
            protocols,
            events,
            activity.clone(),
            stop.clone(),
        ));
        if let Some(handle) =
            clipboard::spawn(device.clone(), protocols, activity.clone(), stop.clone())
        {
            threads.push(handle);
        }
        threads.push(notifications::spawn(
            device.clone(),
            protocols,
            activity,
            stop.clone(),
        ));
        threads.push(gnss::spawn(device, protocols, stop.clone()));

        Self { stop, threads }
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            if let Err(err) = handle.join() {
                tracing::warn!("service thread panicked: {err:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_tracker_rearms_on_touch() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(tracker.idle_for() >= Duration::from_millis(20));
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_millis(20));
    }
}
