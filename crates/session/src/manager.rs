//! The session manager. Runs in the host user's context, owns the
//! session-bus name (the "one session per user" lock), asks the container
//! manager to start on its behalf, and supervises the auxiliary services
//! until something — a signal, the container manager, the idle timer, or a
//! bus call — ends the session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};

use waydroid_binder::protocol::Protocols;
use waydroid_core::{Config, Error, Paths, SessionDescriptor, props};
use waydroid_sandbox::DriverSelection;

use crate::ipc::{ContainerManagerProxy, SessionManagerProxy};
use crate::services::{ActivityTracker, AuxServices, SessionEvent};
use crate::wayland;

pub const BUS_NAME: &str = "id.waydro.Session";
pub const OBJECT_PATH: &str = "/SessionManager";

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub struct SessionOptions {
    /// Announce `waydroid.background_start` so Android boots without UI.
    pub background: bool,
    /// Tear the session down after this much inactivity.
    pub idle_timeout: Option<Duration>,
    /// Invoked once the Android user is unlocked (or immediately when a
    /// session was already running).
    pub unlocked_hook: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { background: false, idle_timeout: None, unlocked_hook: None }
    }
}

struct SessionManagerObject {
    shutdown: tokio::sync::mpsc::UnboundedSender<()>,
}

#[zbus::interface(name = "id.waydro.SessionManager")]
impl SessionManagerObject {
    /// Graceful shutdown of this session and the container behind it.
    async fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Host display density: the Android property when the host has one, the
/// Ubuntu Touch grid unit as a fallback, 0 to inherit from the image.
fn lcd_density() -> u32 {
    let dpi = props::host_get("ro.sf.lcd_density");
    if let Ok(value) = dpi.parse() {
        return value;
    }
    match std::env::var("GRID_UNIT_PX").ok().and_then(|v| v.parse::<u32>().ok()) {
        Some(grid_unit) => grid_unit * 20,
        None => 0,
    }
}

pub struct SessionManager;

impl SessionManager {
    /// Run a session to completion. Returns once the session ended, by
    /// whatever path.
    pub async fn run(paths: Paths, mut options: SessionOptions) -> Result<()> {
        let mut session = SessionDescriptor::from_env()?;
        session.lcd_density = lcd_density();
        session.background_start = options.background;

        // Fail fast on the common misconfiguration, before any bus work.
        wayland::ensure_compositor(&session)?;

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel();
        let object = SessionManagerObject { shutdown: shutdown_tx };
        let connection = zbus::connection::Builder::session()?
            .serve_at(OBJECT_PATH, object)?
            .build()
            .await?;
        match connection.request_name(BUS_NAME).await {
            Ok(()) => {}
            Err(zbus::Error::NameTaken) => {
                tracing::error!("session is already running");
                if let Some(hook) = options.unlocked_hook.take() {
                    hook();
                }
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if !session.waydroid_data.is_dir() {
            std::fs::create_dir_all(&session.waydroid_data)
                .with_context(|| format!("failed to create {}", session.waydroid_data.display()))?;
        }

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        let system = zbus::Connection::system()
            .await
            .context("failed to connect to the system bus")?;
        let container = ContainerManagerProxy::new(&system).await?;
        container
            .start(session.to_map())
            .await
            .map_err(|err| match err {
                zbus::Error::MethodError(_, Some(message), _) => anyhow::anyhow!(message),
                _ => anyhow::anyhow!("container manager is not listening"),
            })?;
        tracing::info!("session started for {}", session.user_name);

        // Auxiliary services need the binder node and protocol selection
        // the container manager just persisted.
        let cfg = Config::load(&paths)?;
        let selection = DriverSelection::from_config(&cfg)?;
        let protocols = Protocols::from_config(&cfg)?;

        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let activity = Arc::new(ActivityTracker::new());
        let mut services = AuxServices::start(
            selection.binder_device(),
            protocols,
            events_tx,
            activity.clone(),
        );

        let mut idle_tick = tokio::time::interval(IDLE_CHECK_INTERVAL);
        idle_tick.tick().await; // the first tick completes immediately

        // When the container manager initiated the teardown (SIGUSR1) it
        // is already stopping the container; don't call back into it.
        let mut stop_container = true;
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    tracing::info!("SIGINT, stopping session");
                    break;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM, stopping session");
                    break;
                }
                _ = sigusr1.recv() => {
                    tracing::info!("session teardown requested by the container manager");
                    stop_container = false;
                    break;
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Stop called on the session bus");
                    break;
                }
                event = events_rx.recv() => {
                    if let Some(SessionEvent::UserUnlocked(_uid)) = event
                        && let Some(hook) = options.unlocked_hook.take()
                    {
                        hook();
                    }
                }
                _ = idle_tick.tick() => {
                    if let Some(timeout) = options.idle_timeout
                        && activity.idle_for() >= timeout
                    {
                        tracing::info!("session idle for {timeout:?}, shutting down");
                        break;
                    }
                }
            }
        }

        services.shutdown();
        if stop_container
            && let Err(err) = container.stop(false).await
        {
            tracing::warn!("container stop failed: {err}");
        }
        Ok(())
    }

    /// `waydroid session stop`: ask the running session manager to wind
    /// down; when none answers, stop the container directly.
    pub async fn stop_remote() -> Result<()> {
        if let Ok(connection) = zbus::Connection::session().await
            && let Ok(proxy) = SessionManagerProxy::new(&connection).await
            && proxy.stop().await.is_ok()
        {
            return Ok(());
        }

        let system = zbus::Connection::system()
            .await
            .context("failed to connect to the system bus")?;
        let container = ContainerManagerProxy::new(&system).await?;
        container
            .stop(true)
            .await
            .map_err(|_| Error::RpcUnavailable("container manager".into()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_prefers_grid_unit_when_host_prop_is_absent() {
        // No Android getprop on CI hosts, so the env fallback decides.
        unsafe {
            std::env::set_var("GRID_UNIT_PX", "8");
        }
        assert_eq!(lcd_density(), 160);
        unsafe {
            std::env::remove_var("GRID_UNIT_PX");
        }
        assert_eq!(lcd_density(), 0);
    }
}
