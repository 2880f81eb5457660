//! Service-manager client and the host-service registration loop.
//!
//! The Android service manager is context-manager handle 0 on the binder
//! node. Presence is probed with a ping; host services re-register every
//! time the manager reappears, which happens on every Android restart.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use waydroid_core::Error;

use crate::driver::{BinderDriver, Dispatch, TransactError};
use crate::parcel::Parcel;
use crate::protocol::{Protocols, SmProtocol};

const SERVICE_MANAGER_HANDLE: u32 = 0;
const SERVICE_MANAGER_INTERFACE: &str = "android.os.IServiceManager";

/// `B_PACK_CHARS('_','P','N','G')`.
const PING_TRANSACTION: u32 = 0x5f50_4e47;
const GET_SERVICE_TRANSACTION: u32 = 1;
const CHECK_SERVICE_TRANSACTION: u32 = 2;
const ADD_SERVICE_TRANSACTION: u32 = 3;

const DUMP_FLAG_PRIORITY_DEFAULT: i32 = 0x08;

/// Bounded name-resolution retry, one second apart.
pub const LOOKUP_ATTEMPTS: u32 = 10;
/// How long `wait_until_present` keeps probing before giving up.
pub const PRESENCE_WAIT: Duration = Duration::from_secs(60);

pub struct ServiceManager {
    driver: Arc<BinderDriver>,
    protocols: Protocols,
}

impl ServiceManager {
    pub fn open(device: &Path, protocols: Protocols) -> Result<Self> {
        let driver = BinderDriver::open(device)
            .with_context(|| format!("failed to open binder node {}", device.display()))?;
        Ok(Self { driver: Arc::new(driver), protocols })
    }

    pub fn with_driver(driver: Arc<BinderDriver>, protocols: Protocols) -> Self {
        Self { driver, protocols }
    }

    pub fn driver(&self) -> Arc<BinderDriver> {
        self.driver.clone()
    }

    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    /// Ping handle 0. Any transport failure counts as "not present".
    pub fn is_present(&self) -> bool {
        let parcel = Parcel::new();
        match self
            .driver
            .transact(SERVICE_MANAGER_HANDLE, PING_TRANSACTION, &parcel, 0)
        {
            Ok(_) => true,
            Err(TransactError::DeadBinder) | Err(TransactError::Failed(_)) => false,
            Err(err) => {
                tracing::debug!("service manager ping failed: {err}");
                false
            }
        }
    }

    /// Probe once a second until the manager appears, the deadline passes,
    /// or `interrupted` is raised (signal handlers flip it).
    pub fn wait_until_present(&self, interrupted: &AtomicBool) -> bool {
        let deadline = Instant::now() + PRESENCE_WAIT;
        tracing::info!("waiting for binder service manager...");
        while Instant::now() < deadline && !interrupted.load(Ordering::Relaxed) {
            if self.is_present() {
                return true;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        self.is_present()
    }

    fn request_with_name(&self, name: &str) -> Parcel {
        let mut parcel = Parcel::new();
        parcel.write_interface_token(self.protocols.binder, SERVICE_MANAGER_INTERFACE);
        parcel.write_string16(Some(name));
        parcel
    }

    fn read_service_reply(&self, mut reply: Parcel) -> Option<u32> {
        match self.protocols.sm {
            // Classic servicemanager: the reply is the object itself.
            SmProtocol::Aidl1 | SmProtocol::Aidl2 => reply.read_object_handle().ok().flatten(),
            // AIDL manager: exception word, then a nullable binder.
            SmProtocol::Aidl3 => {
                match reply.read_i32() {
                    Ok(0) => {}
                    Ok(exception) => {
                        tracing::warn!("service manager raised exception {exception}");
                        return None;
                    }
                    Err(_) => return None,
                }
                reply.read_object_handle().ok().flatten()
            }
        }
    }

    /// Single lookup. `Ok(None)` means the manager answered but the name is
    /// not registered yet.
    pub fn get_service(&self, name: &str) -> Result<Option<u32>, TransactError> {
        let request = self.request_with_name(name);
        let reply = self
            .driver
            .transact(SERVICE_MANAGER_HANDLE, GET_SERVICE_TRANSACTION, &request, 0)?;
        let handle = self.read_service_reply(reply);
        if let Some(handle) = handle {
            self.driver.acquire(handle)?;
        }
        Ok(handle)
    }

    pub fn check_service(&self, name: &str) -> Result<Option<u32>, TransactError> {
        let request = self.request_with_name(name);
        let reply = self.driver.transact(
            SERVICE_MANAGER_HANDLE,
            CHECK_SERVICE_TRANSACTION,
            &request,
            0,
        )?;
        Ok(self.read_service_reply(reply))
    }

    /// Resolve a name with the bounded retry loop; RPC policy says the
    /// caller gets a typed error, not a panic, when Android never exports
    /// the service.
    pub fn resolve_service(&self, name: &str) -> Result<u32> {
        for attempt in 0..LOOKUP_ATTEMPTS {
            match self.get_service(name) {
                Ok(Some(handle)) => return Ok(handle),
                Ok(None) => {
                    tracing::warn!("failed to get service {name}, trying again...");
                }
                Err(err) => {
                    tracing::warn!("service lookup {name} failed: {err}");
                }
            }
            if attempt + 1 < LOOKUP_ATTEMPTS {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        Err(Error::RpcUnavailable(name.to_string()).into())
    }

    /// Register a local object under `name`.
    pub fn add_service(&self, name: &str, local_ptr: u64) -> Result<(), TransactError> {
        let mut request = self.request_with_name(name);
        request.write_local_binder(local_ptr);
        request.write_i32(0); // allow_isolated
        match self.protocols.sm {
            SmProtocol::Aidl1 => {}
            SmProtocol::Aidl2 | SmProtocol::Aidl3 => {
                request.write_i32(DUMP_FLAG_PRIORITY_DEFAULT);
            }
        }
        let mut reply = self
            .driver
            .transact(SERVICE_MANAGER_HANDLE, ADD_SERVICE_TRANSACTION, &request, 0)?;
        match reply.read_i32() {
            Ok(0) | Err(_) => Ok(()),
            Ok(status) => Err(TransactError::Failed(status)),
        }
    }
}

/// Run a host-side service: register with the service manager, dispatch
/// incoming transactions, and re-register whenever the manager reappears.
/// Returns when `stop` is raised. Each service owns its binder fd and its
/// own loop, mirroring the one-thread-per-service model.
pub fn serve<H>(
    device: &Path,
    protocols: Protocols,
    interface: &'static str,
    name: &'static str,
    mut handler: H,
    stop: Arc<AtomicBool>,
) -> Result<()>
where
    H: FnMut(u32, &mut Parcel, &Arc<BinderDriver>) -> Dispatch + Send,
{
    let sm = ServiceManager::open(device, protocols)?;
    let driver = sm.driver();
    driver.enter_looper()?;

    // Stable identity the kernel hands back on every incoming transaction.
    let token: &'static u64 = Box::leak(Box::new(0));
    let local_ptr = token as *const u64 as u64;

    let mut registered = false;
    while !stop.load(Ordering::Relaxed) {
        let present = sm.is_present();
        if present && !registered {
            match sm.add_service(name, local_ptr) {
                Ok(()) => {
                    tracing::info!("registered binder service {name}");
                    registered = true;
                }
                Err(err) => {
                    tracing::error!("failed to add service {name}: {err}");
                    std::thread::sleep(Duration::from_secs(1));
                    continue;
                }
            }
        } else if !present {
            if registered {
                tracing::info!("service manager went away, will re-register {name}");
            }
            registered = false;
            std::thread::sleep(Duration::from_secs(1));
            continue;
        }

        let handled = driver.poll_once(1000, &mut |mut incoming| {
            if incoming.target != local_ptr {
                tracing::warn!("transaction for unknown local object {:#x}", incoming.target);
                return Dispatch::Error(crate::services::STATUS_UNKNOWN_TRANSACTION);
            }
            match incoming.parcel.read_interface_token(protocols.binder) {
                Ok(Some(got)) if got == interface => {}
                Ok(other) => {
                    tracing::warn!("{name}: bad interface token {other:?}");
                }
                Err(err) => {
                    tracing::warn!("{name}: unreadable request header: {err}");
                    return Dispatch::Error(crate::services::STATUS_UNKNOWN_TRANSACTION);
                }
            }
            tracing::debug!("{name}: received transaction {}", incoming.code);
            handler(incoming.code, &mut incoming.parcel, &driver)
        });
        if let Err(err) = handled {
            tracing::error!("{name}: binder loop error: {err}");
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    driver.exit_looper();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BinderProtocol;

    #[test]
    fn ping_code_is_pack_chars_png() {
        assert_eq!(PING_TRANSACTION, u32::from_be_bytes(*b"_PNG"));
    }

    #[test]
    fn lookup_bounds_are_sane() {
        assert_eq!(LOOKUP_ATTEMPTS, 10);
        assert_eq!(PRESENCE_WAIT, Duration::from_secs(60));
    }

    #[test]
    fn add_service_request_layout_varies_with_sm_protocol() {
        // Reproduce request_with_name + add_service marshalling without a
        // kernel: the v2/v3 request carries one extra dump-priority word.
        let build = |sm: SmProtocol| {
            let mut p = Parcel::new();
            p.write_interface_token(BinderProtocol::Aidl2, SERVICE_MANAGER_INTERFACE);
            p.write_string16(Some("waydroidplatform"));
            p.write_local_binder(0x1000);
            p.write_i32(0);
            if !matches!(sm, SmProtocol::Aidl1) {
                p.write_i32(DUMP_FLAG_PRIORITY_DEFAULT);
            }
            p.data().len()
        };
        assert_eq!(build(SmProtocol::Aidl2), build(SmProtocol::Aidl1) + 4);
        assert_eq!(build(SmProtocol::Aidl3), build(SmProtocol::Aidl2));
    }
}
