//! Host-side notification service plus the callback stub Android registers
//! for action invocations.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::driver::{BinderDriver, Dispatch, TF_ONE_WAY};
use crate::parcel::{Parcel, ReadResult};
use crate::protocol::{BinderProtocol, Protocols};
use crate::service_manager::serve;
use crate::services::{STATUS_BAD_VALUE, STATUS_UNKNOWN_TRANSACTION};

pub const INTERFACE: &str = "lineageos.waydroid.INotifications";
pub const SERVICE_NAME: &str = "waydroidnotifications";
pub const CALLBACK_INTERFACE: &str = "lineageos.waydroid.INotifications.INotificationCallback";

const TRANSACTION_REGISTER_LISTENER: u32 = 1;
const TRANSACTION_NOTIFY: u32 = 2;
const TRANSACTION_CLOSE_NOTIFICATION: u32 = 3;

const CALLBACK_TRANSACTION_ON_ACTION_INVOKED: u32 = 1;

/// freedesktop urgency levels carried through verbatim.
pub mod urgency {
    pub const LOW: u8 = 0;
    pub const NORMAL: u8 = 1;
    pub const CRITICAL: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: i32,
    pub height: i32,
    pub rowstride: i32,
    pub has_alpha: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub replaces_id: i32,
    pub app_name: String,
    pub package_name: String,
    pub summary: String,
    pub body: String,
    pub actions: Vec<Action>,
    pub image: Option<ImageData>,
    pub category: String,
    pub suppress_sound: bool,
    pub expire_timeout: i32,
    pub resident: bool,
    pub transient: bool,
    pub urgency: u8,
}

fn read_notification(parcel: &mut Parcel) -> ReadResult<Notification> {
    let replaces_id = parcel.read_i32()?;
    let app_name = parcel.read_string16()?.unwrap_or_default();
    let package_name = parcel.read_string16()?.unwrap_or_default();
    let summary = parcel.read_string16()?.unwrap_or_default();
    let body = parcel.read_string16()?.unwrap_or_default();

    let mut actions = Vec::new();
    let action_count = parcel.read_i32()?.max(0);
    for _ in 0..action_count {
        if parcel.read_parcelable_present()? {
            let _parcel_size = parcel.read_i32()?;
            actions.push(Action {
                id: parcel.read_string16()?.unwrap_or_default(),
                label: parcel.read_string16()?.unwrap_or_default(),
            });
        }
    }

    let image = if parcel.read_parcelable_present()? {
        let _parcel_size = parcel.read_i32()?;
        Some(ImageData {
            width: parcel.read_i32()?,
            height: parcel.read_i32()?,
            rowstride: parcel.read_i32()?,
            has_alpha: parcel.read_bool()?,
            data: parcel.read_byte_array()?.unwrap_or_default(),
        })
    } else {
        None
    };

    Ok(Notification {
        replaces_id,
        app_name,
        package_name,
        summary,
        body,
        actions,
        image,
        category: parcel.read_string16()?.unwrap_or_default(),
        suppress_sound: parcel.read_bool()?,
        expire_timeout: parcel.read_i32()?,
        resident: parcel.read_bool()?,
        transient: parcel.read_bool()?,
        urgency: parcel.read_byte()?,
    })
}

/// Android-side listener for invoked notification actions. Oneway calls;
/// a dead callback is detected on the next send and dropped by the owner.
pub struct NotificationCallback {
    driver: Arc<BinderDriver>,
    handle: u32,
    protocol: BinderProtocol,
}

impl NotificationCallback {
    pub fn on_action_invoked(&self, notification_id: i32, action_id: &str, activation_token: &str) {
        let mut request = Parcel::new();
        request.write_interface_token(self.protocol, CALLBACK_INTERFACE);
        request.write_i32(notification_id);
        request.write_string16(Some(action_id));
        request.write_string16(Some(activation_token));
        if let Err(err) = self.driver.transact(
            self.handle,
            CALLBACK_TRANSACTION_ON_ACTION_INVOKED,
            &request,
            TF_ONE_WAY,
        ) {
            tracing::warn!("notification callback lost: {err}");
        }
    }
}

pub struct NotificationCallbacks {
    pub register_listener: Box<dyn FnMut(NotificationCallback) + Send>,
    /// Returns the freedesktop notification id assigned on the host.
    pub notify: Box<dyn FnMut(Notification) -> i32 + Send>,
    pub close_notification: Box<dyn FnMut(i32) + Send>,
}

pub fn run(
    device: &Path,
    protocols: Protocols,
    mut callbacks: NotificationCallbacks,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    serve(
        device,
        protocols,
        INTERFACE,
        SERVICE_NAME,
        move |code, parcel, driver| match code {
            TRANSACTION_REGISTER_LISTENER => {
                let Ok(Some(handle)) = parcel.read_object_handle() else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                if let Err(err) = driver.acquire(handle) {
                    tracing::warn!("failed to acquire notification callback: {err}");
                }
                (callbacks.register_listener)(NotificationCallback {
                    driver: driver.clone(),
                    handle,
                    protocol: protocols.binder,
                });
                let mut reply = Parcel::new();
                reply.write_i32(0);
                Dispatch::Reply(reply)
            }
            TRANSACTION_NOTIFY => match read_notification(parcel) {
                Ok(notification) => {
                    let id = (callbacks.notify)(notification);
                    let mut reply = Parcel::new();
                    reply.write_i32(0);
                    reply.write_i32(id);
                    Dispatch::Reply(reply)
                }
                Err(err) => {
                    tracing::warn!("malformed notification: {err}");
                    Dispatch::Error(STATUS_BAD_VALUE)
                }
            },
            TRANSACTION_CLOSE_NOTIFICATION => {
                let Ok(id) = parcel.read_i32() else {
                    return Dispatch::Error(STATUS_BAD_VALUE);
                };
                (callbacks.close_notification)(id);
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
    use crate::parcel::ParcelError;

    fn write_notification(parcel: &mut Parcel, with_image: bool) {
        parcel.write_i32(0); // replaces_id
        parcel.write_string16(Some("Signal"));
        parcel.write_string16(Some("org.thoughtcrime.securesms"));
        parcel.write_string16(Some("New message"));
        parcel.write_string16(Some("hello"));
        parcel.write_i32(2); // actions
        parcel.write_parcelable_header();
        parcel.write_i32(0); // parcel size, unused by the reader
        parcel.write_string16(Some("reply"));
        parcel.write_string16(Some("Reply"));
        parcel.write_null_parcelable();
        if with_image {
            parcel.write_parcelable_header();
            parcel.write_i32(0);
            parcel.write_i32(2);
            parcel.write_i32(2);
            parcel.write_i32(8);
            parcel.write_bool(true);
            parcel.write_byte_array(Some(&[0u8; 16]));
        } else {
            parcel.write_null_parcelable();
        }
        parcel.write_string16(Some("im.received"));
        parcel.write_bool(false); // suppress_sound
        parcel.write_i32(-1); // expire_timeout
        parcel.write_bool(false); // resident
        parcel.write_bool(false); // transient
        parcel.write_byte(urgency::NORMAL);
    }

    #[test]
    fn notification_without_image_parses() {
        let mut parcel = Parcel::new();
        write_notification(&mut parcel, false);
        let n = read_notification(&mut parcel).unwrap();
        assert_eq!(n.app_name, "Signal");
        assert_eq!(n.actions.len(), 1); // the null action slot is skipped
        assert_eq!(n.actions[0].id, "reply");
        assert!(n.image.is_none());
        assert_eq!(n.urgency, urgency::NORMAL);
        assert_eq!(n.expire_timeout, -1);
    }

    #[test]
    fn notification_with_image_parses() {
        let mut parcel = Parcel::new();
        write_notification(&mut parcel, true);
        let n = read_notification(&mut parcel).unwrap();
        let image = n.image.unwrap();
        assert_eq!(image.width, 2);
        assert_eq!(image.rowstride, 8);
        assert!(image.has_alpha);
        assert_eq!(image.data.len(), 16);
    }

    #[test]
    fn truncated_notification_is_an_error() {
        let mut parcel = Parcel::new();
        parcel.write_i32(0);
        parcel.write_string16(Some("Signal"));
        assert!(matches!(
            read_notification(&mut parcel),
            Err(ParcelError::Exhausted(_))
        ));
    }
}
