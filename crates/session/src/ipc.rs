//! Bus proxies for talking to the two daemons. The blocking variants are
//! what the CLI and the auxiliary threads use; the session manager itself
//! uses the async ones.

use std::collections::HashMap;

#[zbus::proxy(
    interface = "id.waydro.ContainerManager",
    default_service = "id.waydro.Container",
    default_path = "/ContainerManager"
)]
pub trait ContainerManager {
    fn start(&self, session: HashMap<String, String>) -> zbus::Result<()>;
    fn stop(&self, quit_session: bool) -> zbus::Result<()>;
    fn freeze(&self) -> zbus::Result<()>;
    fn unfreeze(&self) -> zbus::Result<()>;
    fn restart(&self) -> zbus::Result<()>;
    fn get_session(&self) -> zbus::Result<HashMap<String, String>>;
    fn getprop(&self, name: &str) -> zbus::Result<String>;
    fn setprop(&self, name: &str, value: &str) -> zbus::Result<()>;
    fn watch_prop(&self, name: &str) -> zbus::Result<String>;
    fn mount_shared_folder(&self) -> zbus::Result<()>;
    fn unmount_shared_folder(&self) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "id.waydro.SessionManager",
    default_service = "id.waydro.Session",
    default_path = "/SessionManager"
)]
pub trait SessionManager {
    fn stop(&self) -> zbus::Result<()>;
}
