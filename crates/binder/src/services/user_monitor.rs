//! Host-side user monitor: Android reports user unlock and package churn.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::driver::Dispatch;
use crate::parcel::Parcel;
use crate::protocol::Protocols;
use crate::service_manager::serve;
use crate::services::{STATUS_BAD_VALUE, STATUS_UNKNOWN_TRANSACTION};

pub const INTERFACE: &str = "lineageos.waydroid.IUserMonitor";
pub const SERVICE_NAME: &str = "waydroidusermonitor";

const TRANSACTION_USER_UNLOCKED: u32 = 1;
const TRANSACTION_PACKAGE_STATE_CHANGED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageState {
    Added,
    Removed,
    Updated,
}

impl PackageState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(PackageState::Added),
            1 => Some(PackageState::Removed),
            2 => Some(PackageState::Updated),
            _ => None,
        }
    }
}

pub struct UserMonitorCallbacks {
    pub user_unlocked: Box<dyn FnMut(i32) + Send>,
    pub package_state_changed: Box<dyn FnMut(PackageState, String, i32) + Send>,
}

pub fn run(
    device: &Path,
    protocols: Protocols,
    mut callbacks: UserMonitorCallbacks,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    serve(
        device,
        protocols,
        INTERFACE,
        SERVICE_NAME,
        move |code, parcel, _driver| match code {
            TRANSACTION_USER_UNLOCKED => {
                let Ok(uid) = parcel.read_i32() else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                (callbacks.user_unlocked)(uid);
                let mut reply = Parcel::new();
                reply.write_i32(0);
                Dispatch::Reply(reply)
            }
            TRANSACTION_PACKAGE_STATE_CHANGED => {
                let parsed = (|| {
                    let mode = parcel.read_i32()?;
                    let package = parcel.read_string16()?.unwrap_or_default();
                    let uid = parcel.read_i32()?;
                    Ok::<_, crate::parcel::ParcelError>((mode, package, uid))
                })();
                let Ok((mode, package, uid)) = parsed else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                match PackageState::from_code(mode) {
                    Some(state) => (callbacks.package_state_changed)(state, package, uid),
                    None => tracing::warn!("unknown package state {mode} for {package}"),
                }
                let mut reply = Parcel::new();
                reply.write_i32(0);
                Dispatch::Reply(reply)
            }
            _ => Dispatch::Error(STATUS_UNKNOWN_TRANSACTION),
        },
        stop,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_states_map_like_android() {
        assert_eq!(PackageState::from_code(0), Some(PackageState::Added));
        assert_eq!(PackageState::from_code(1), Some(PackageState::Removed));
        assert_eq!(PackageState::from_code(2), Some(PackageState::Updated));
        assert_eq!(PackageState::from_code(3), None);
    }
}
