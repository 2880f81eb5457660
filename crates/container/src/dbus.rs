//! System-bus surface of the container manager.
//!
//! One well-known name (`id.waydro.Container`) doubles as the cross-process
//! "one container" lock; the object at `/ContainerManager` exposes the
//! lifecycle methods. State transitions are linearized by taking the
//! manager mutex for the duration of each call.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use zbus::fdo;
use zbus::message::Header;
use zbus::names::BusName;

use waydroid_core::{Error, SessionDescriptor};

use crate::manager::ContainerManager;

pub const BUS_NAME: &str = "id.waydro.Container";
pub const OBJECT_PATH: &str = "/ContainerManager";
pub const INTERFACE: &str = "id.waydro.ContainerManager";

pub struct ContainerManagerObject {
    manager: Arc<Mutex<ContainerManager>>,
}

fn to_fdo(err: anyhow::Error) -> fdo::Error {
    fdo::Error::Failed(format!("{err:#}"))
}

impl ContainerManagerObject {
    pub fn new(manager: Arc<Mutex<ContainerManager>>) -> Self {
        Self { manager }
    }

    /// Root may start sessions for anyone; everyone else only for
    /// themselves, and only from the process named in the descriptor.
    async fn validate_caller(
        connection: &zbus::Connection,
        header: &Header<'_>,
        session: &SessionDescriptor,
    ) -> fdo::Result<()> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed("anonymous caller".into()))?;
        let dbus = fdo::DBusProxy::new(connection).await?;
        let name = BusName::from(sender.to_owned());

        let uid = dbus.get_connection_unix_user(name.clone()).await?;
        if uid != 0 {
            if uid != session.user_id {
                return Err(fdo::Error::AccessDenied(
                    Error::SessionMismatch(
                        "cannot start a session on behalf of another user".into(),
                    )
                    .to_string(),
                ));
            }
            let pid = dbus.get_connection_unix_process_id(name).await?;
            if pid != session.pid {
                return Err(fdo::Error::AccessDenied(
                    Error::SessionMismatch("invalid session pid".into()).to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[zbus::interface(name = "id.waydro.ContainerManager")]
impl ContainerManagerObject {
    async fn start(
        &self,
        session: HashMap<String, String>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
    ) -> fdo::Result<()> {
        let descriptor = SessionDescriptor::from_map(&session).map_err(to_fdo)?;
        Self::validate_caller(connection, &header, &descriptor).await?;

        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            let mut manager = manager.blocking_lock();
            manager.start(descriptor)
        })
        .await
        .map_err(|err| fdo::Error::Failed(err.to_string()))?
        .map_err(to_fdo)
    }

    async fn stop(&self, quit_session: bool) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            manager.blocking_lock().stop(quit_session);
        })
        .await
        .map_err(|err| fdo::Error::Failed(err.to_string()))?;
        Ok(())
    }

    async fn freeze(&self) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().freeze())
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    async fn unfreeze(&self) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().unfreeze())
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    async fn restart(&self) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().restart())
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    async fn get_session(&self) -> HashMap<String, String> {
        self.manager.lock().await.session_map()
    }

    async fn getprop(&self, name: String) -> fdo::Result<String> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().getprop(&name))
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    async fn setprop(&self, name: String, value: String) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().setprop(&name, &value))
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    /// Long-poll; runs detached so unrelated calls keep being served.
    async fn watch_prop(&self, name: String) -> fdo::Result<String> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || {
            // Deliberately not holding the manager lock for the duration:
            // only the path prefix is needed and the watch can block for
            // minutes.
            let paths = manager.blocking_lock().paths().clone();
            crate::lxc::watch_prop(&paths, &name)
        })
        .await
        .map_err(|err| fdo::Error::Failed(err.to_string()))?
        .map_err(to_fdo)
    }

    async fn mount_shared_folder(&self) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().mount_shared_folder())
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    async fn unmount_shared_folder(&self) -> fdo::Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.blocking_lock().unmount_shared_folder())
            .await
            .map_err(|err| fdo::Error::Failed(err.to_string()))?
            .map_err(to_fdo)
    }

    /// Current session as a property so `GetAll` shows it to shells.
    #[zbus(property)]
    async fn session(&self) -> HashMap<String, String> {
        self.manager.lock().await.session_map()
    }
}

/// Claim the container name and export the manager object. A taken name
/// means another instance owns the container.
pub async fn connect(manager: Arc<Mutex<ContainerManager>>) -> Result<zbus::Connection> {
    let object = ContainerManagerObject::new(manager);
    let connection = zbus::connection::Builder::system()?
        .serve_at(OBJECT_PATH, object)?
        .build()
        .await?;
    match connection.request_name(BUS_NAME).await {
        Ok(()) => Ok(connection),
        Err(zbus::Error::NameTaken) => Err(Error::AlreadyRunning("container service").into()),
        Err(err) => Err(err.into()),
    }
}

/// Serve until SIGINT/SIGTERM, then stop the container without quitting
/// the session and return.
pub async fn run(manager: Arc<Mutex<ContainerManager>>, connection: zbus::Connection) -> Result<()> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => tracing::info!("SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
    }

    let manager_for_stop = manager.clone();
    tokio::task::spawn_blocking(move || manager_for_stop.blocking_lock().stop(false)).await?;
    drop(connection);
    Ok(())
}
