//! Host-side hardware service: suspend/reboot/upgrade requests from the
//! Android settings UI land here.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::driver::Dispatch;
use crate::parcel::{Parcel, ParcelError};
use crate::protocol::Protocols;
use crate::service_manager::serve;
use crate::services::{STATUS_BAD_VALUE, STATUS_UNKNOWN_TRANSACTION};

pub const INTERFACE: &str = "lineageos.waydroid.IHardware";
pub const SERVICE_NAME: &str = "waydroidhardware";

const TRANSACTION_ENABLE_NFC: u32 = 1;
const TRANSACTION_ENABLE_BLUETOOTH: u32 = 2;
const TRANSACTION_SUSPEND: u32 = 3;
const TRANSACTION_REBOOT: u32 = 4;
/// Legacy encoding with 32-bit timestamps.
const TRANSACTION_UPGRADE: u32 = 5;
/// Same call with 64-bit timestamps.
const TRANSACTION_UPGRADE2: u32 = 6;

pub struct HardwareCallbacks {
    pub enable_nfc: Box<dyn FnMut(bool) -> i32 + Send>,
    pub enable_bluetooth: Box<dyn FnMut(bool) -> i32 + Send>,
    pub suspend: Box<dyn FnMut() + Send>,
    pub reboot: Box<dyn FnMut() + Send>,
    /// (system_zip, system_time, vendor_zip, vendor_time)
    pub upgrade: Box<dyn FnMut(String, i64, String, i64) + Send>,
}

fn ok_reply() -> Dispatch {
    let mut reply = Parcel::new();
    reply.write_i32(0);
    Dispatch::Reply(reply)
}

pub fn run(
    device: &Path,
    protocols: Protocols,
    mut callbacks: HardwareCallbacks,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    serve(
        device,
        protocols,
        INTERFACE,
        SERVICE_NAME,
        move |code, parcel, _driver| match code {
            TRANSACTION_ENABLE_NFC | TRANSACTION_ENABLE_BLUETOOTH => {
                let Ok(enable) = parcel.read_i32() else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                let ret = if code == TRANSACTION_ENABLE_NFC {
                    (callbacks.enable_nfc)(enable != 0)
                } else {
                    (callbacks.enable_bluetooth)(enable != 0)
                };
                let mut reply = Parcel::new();
                reply.write_i32(0);
                reply.write_i32(ret);
                Dispatch::Reply(reply)
            }
            TRANSACTION_SUSPEND => {
                (callbacks.suspend)();
                ok_reply()
            }
            TRANSACTION_REBOOT => {
                (callbacks.reboot)();
                ok_reply()
            }
            TRANSACTION_UPGRADE | TRANSACTION_UPGRADE2 => {
                let wide = code == TRANSACTION_UPGRADE2;
                let parsed = (|| {
                    let system_zip = parcel.read_string16()?.unwrap_or_default();
                    let system_time =
                        if wide { parcel.read_i64()? } else { parcel.read_i32()? as i64 };
                    let vendor_zip = parcel.read_string16()?.unwrap_or_default();
                    let vendor_time =
                        if wide { parcel.read_i64()? } else { parcel.read_i32()? as i64 };
                    Ok::<_, ParcelError>((system_zip, system_time, vendor_zip, vendor_time))
                })();
                let Ok((system_zip, system_time, vendor_zip, vendor_time)) = parsed else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                (callbacks.upgrade)(system_zip, system_time, vendor_zip, vendor_time);
                ok_reply()
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
    fn upgrade_encodings_agree_on_payload() {
        // Narrow encoding: i32 timestamps.
        let mut narrow = Parcel::new();
        narrow.write_string16(Some("/tmp/system.zip"));
        narrow.write_i32(1700000000);
        narrow.write_string16(Some("/tmp/vendor.zip"));
        narrow.write_i32(1700000001);

        assert_eq!(
            narrow.read_string16().unwrap().as_deref(),
            Some("/tmp/system.zip")
        );
        assert_eq!(narrow.read_i32().unwrap() as i64, 1_700_000_000);

        // Wide encoding: i64 timestamps that do not fit in 32 bits.
        let mut wide = Parcel::new();
        wide.write_string16(Some("/tmp/system.zip"));
        wide.write_i64(17_000_000_000);
        assert_eq!(
            wide.read_string16().unwrap().as_deref(),
            Some("/tmp/system.zip")
        );
        assert_eq!(wide.read_i64().unwrap(), 17_000_000_000);
    }
}
