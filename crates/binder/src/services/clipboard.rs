//! Host-side clipboard service consumed by the Android userland.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::driver::Dispatch;
use crate::parcel::Parcel;
use crate::protocol::Protocols;
use crate::service_manager::serve;
use crate::services::{STATUS_BAD_VALUE, STATUS_UNKNOWN_TRANSACTION};

pub const INTERFACE: &str = "lineageos.waydroid.IClipboard";
pub const SERVICE_NAME: &str = "waydroidclipboard";

const TRANSACTION_SEND_CLIPBOARD_DATA: u32 = 1;
const TRANSACTION_GET_CLIPBOARD_DATA: u32 = 2;

pub struct ClipboardCallbacks {
    /// Android pushed text the host clipboard should take over.
    pub send: Box<dyn FnMut(String) + Send>,
    /// Android wants the current host clipboard contents.
    pub get: Box<dyn FnMut() -> String + Send>,
}

/// Register and run the clipboard service until `stop` is raised.
pub fn run(
    device: &Path,
    protocols: Protocols,
    mut callbacks: ClipboardCallbacks,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    serve(
        device,
        protocols,
        INTERFACE,
        SERVICE_NAME,
        move |code, parcel, _driver| match code {
            TRANSACTION_SEND_CLIPBOARD_DATA => {
                let Ok(text) = parcel.read_string16() else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                (callbacks.send)(text.unwrap_or_default());
                let mut reply = Parcel::new();
                reply.write_i32(0);
                Dispatch::Reply(reply)
            }
            TRANSACTION_GET_CLIPBOARD_DATA => {
                let text = (callbacks.get)();
                let mut reply = Parcel::new();
                reply.write_i32(0);
                reply.write_string16(Some(&text));
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
    fn get_reply_carries_exception_word_then_text() {
        let mut reply = Parcel::new();
        reply.write_i32(0);
        reply.write_string16(Some("copied text"));

        assert_eq!(reply.read_i32(), Ok(0));
        assert_eq!(reply.read_string16(), Ok(Some("copied text".into())));
    }
}
