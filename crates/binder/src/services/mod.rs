//! The fixed service surface exchanged with the Android userland.
//!
//! Clients (host calls Android): [`platform`], [`status_bar`].
//! Servers (Android calls host): [`clipboard`], [`notifications`],
//! [`user_monitor`], [`hardware`].

pub mod clipboard;
pub mod hardware;
pub mod notifications;
pub mod platform;
pub mod status_bar;
pub mod user_monitor;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::driver::BinderDriver;
use crate::parcel::Parcel;
use crate::protocol::{BinderProtocol, Protocols};
use crate::service_manager::ServiceManager;

/// Status outside binder's own error space; the remote surfaces it as a
/// RemoteException. Returned for transaction codes we do not implement.
pub const STATUS_UNKNOWN_TRANSACTION: i32 = -99999;
/// Malformed arguments in an otherwise known transaction.
pub const STATUS_BAD_VALUE: i32 = -22;

/// A resolved remote service plus everything needed to call it.
pub(crate) struct RemoteStub {
    driver: Arc<BinderDriver>,
    handle: u32,
    interface: &'static str,
    protocol: BinderProtocol,
}

impl RemoteStub {
    /// Wait for the service manager, resolve `service`, keep the handle.
    pub(crate) fn connect(
        device: &Path,
        protocols: Protocols,
        service: &'static str,
        interface: &'static str,
        interrupted: &AtomicBool,
    ) -> Result<Self> {
        let sm = ServiceManager::open(device, protocols)?;
        if !sm.is_present() && !sm.wait_until_present(interrupted) {
            tracing::error!("service manager never appeared");
            return Err(waydroid_core::Error::RpcUnavailable(service.to_string()).into());
        }
        let handle = sm.resolve_service(service)?;
        Ok(Self {
            driver: sm.driver(),
            handle,
            interface,
            protocol: protocols.binder,
        })
    }

    pub(crate) fn request(&self) -> Parcel {
        let mut parcel = Parcel::new();
        parcel.write_interface_token(self.protocol, self.interface);
        parcel
    }

    /// Synchronous call. Transport failures and remote exceptions are both
    /// logged and collapsed to `None`; a misbehaving Android service must
    /// not take the host down with it.
    pub(crate) fn call(&self, code: u32, request: &Parcel) -> Option<Parcel> {
        let mut reply = match self.driver.transact(self.handle, code, request, 0) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!("{}: sending request failed: {err}", self.interface);
                return None;
            }
        };
        match reply.read_i32() {
            Ok(0) => Some(reply),
            Ok(exception) => {
                tracing::error!("{}: failed with code: {exception}", self.interface);
                None
            }
            Err(err) => {
                tracing::error!("{}: unreadable reply: {err}", self.interface);
                None
            }
        }
    }

    pub(crate) fn call_oneway(&self, code: u32, request: &Parcel) {
        if let Err(err) =
            self.driver
                .transact(self.handle, code, request, crate::driver::TF_ONE_WAY)
        {
            tracing::error!("{}: oneway send failed: {err}", self.interface);
        }
    }
}
