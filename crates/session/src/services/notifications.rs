//! Notification forwarder: Android notifications are replayed through
//! `org.freedesktop.Notifications` (preferred over the portal because it
//! lets us attach a desktop-entry hint per package), and invoked actions
//! travel back through the registered Android-side callback.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use zbus::zvariant::Value;

use waydroid_binder::protocol::Protocols;
use waydroid_binder::services::notifications::{
    self, Notification, NotificationCallback, NotificationCallbacks,
};

use super::ActivityTracker;

#[zbus::proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    #[allow(clippy::too_many_arguments)]
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: Vec<String>,
        hints: HashMap<&str, Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;

    fn close_notification(&self, id: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn action_invoked(&self, id: u32, action_key: String) -> zbus::Result<()>;

    #[zbus(signal)]
    fn activation_token(&self, id: u32, activation_token: String) -> zbus::Result<()>;
}

#[derive(Default)]
struct Listeners {
    callbacks: Vec<NotificationCallback>,
}

fn build_hints(notification: &Notification) -> HashMap<&'static str, Value<'static>> {
    let mut hints: HashMap<&'static str, Value<'static>> = HashMap::new();
    hints.insert("urgency", Value::U8(notification.urgency));
    hints.insert(
        "desktop-entry",
        Value::from(format!("waydroid.{}", notification.package_name)),
    );
    if !notification.category.is_empty() {
        hints.insert("category", Value::from(notification.category.clone()));
    }
    if notification.suppress_sound {
        hints.insert("suppress-sound", Value::Bool(true));
    }
    if notification.transient {
        hints.insert("transient", Value::Bool(true));
    }
    if notification.resident {
        hints.insert("resident", Value::Bool(true));
    }
    if let Some(image) = &notification.image {
        let channels: i32 = if image.has_alpha { 4 } else { 3 };
        hints.insert(
            "image-data",
            Value::from((
                image.width,
                image.height,
                image.rowstride,
                image.has_alpha,
                8i32,
                channels,
                image.data.clone(),
            )),
        );
    }
    hints
}

fn flatten_actions(notification: &Notification) -> Vec<String> {
    notification
        .actions
        .iter()
        .flat_map(|action| [action.id.clone(), action.label.clone()])
        .collect()
}

/// Watch the notification daemon's signals and replay invoked actions into
/// Android. Runs detached: the iterators block on the bus and die with the
/// process.
fn spawn_signal_bridge(
    proxy: &NotificationsProxyBlocking<'static>,
    listeners: Arc<Mutex<Listeners>>,
) -> zbus::Result<()> {
    let tokens: Arc<Mutex<HashMap<u32, String>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut token_stream = proxy.receive_activation_token()?;
    {
        let tokens = tokens.clone();
        std::thread::Builder::new()
            .name("notif-tokens".into())
            .spawn(move || {
                while let Some(signal) = token_stream.next() {
                    if let Ok(args) = signal.args() {
                        tokens.lock().unwrap().insert(args.id, args.activation_token);
                    }
                }
            })
            .expect("failed to spawn notification token thread");
    }

    let mut action_stream = proxy.receive_action_invoked()?;
    std::thread::Builder::new()
        .name("notif-actions".into())
        .spawn(move || {
            while let Some(signal) = action_stream.next() {
                let Ok(args) = signal.args() else { continue };
                let token = tokens
                    .lock()
                    .unwrap()
                    .remove(&args.id)
                    .unwrap_or_default();
                for callback in &listeners.lock().unwrap().callbacks {
                    callback.on_action_invoked(args.id as i32, &args.action_key, &token);
                }
            }
        })
        .expect("failed to spawn notification action thread");
    Ok(())
}

pub fn spawn(
    device: PathBuf,
    protocols: Protocols,
    activity: Arc<ActivityTracker>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("notifications".into())
        .spawn(move || {
            let connection = match zbus::blocking::Connection::session() {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!("no session bus, notifications disabled: {err}");
                    return;
                }
            };
            let proxy: &'static NotificationsProxyBlocking<'static> = match
                NotificationsProxyBlocking::new(&connection)
            {
                // The proxy outlives every thread that uses it.
                Ok(proxy) => Box::leak(Box::new(proxy)),
                Err(err) => {
                    tracing::warn!("notification daemon unreachable: {err}");
                    return;
                }
            };

            let listeners = Arc::new(Mutex::new(Listeners::default()));
            if let Err(err) = spawn_signal_bridge(proxy, listeners.clone()) {
                tracing::warn!("notification signal bridge failed: {err}");
            }

            while !stop.load(Ordering::Relaxed) {
                let listeners_register = listeners.clone();
                let activity_notify = activity.clone();
                let callbacks = NotificationCallbacks {
                    register_listener: Box::new(move |callback| {
                        listeners_register.lock().unwrap().callbacks.push(callback);
                    }),
                    notify: Box::new(move |notification| {
                        activity_notify.touch();
                        let hints = build_hints(&notification);
                        let actions = flatten_actions(&notification);
                        match proxy.notify(
                            &notification.app_name,
                            notification.replaces_id.max(0) as u32,
                            "",
                            &notification.summary,
                            &notification.body,
                            actions,
                            hints,
                            notification.expire_timeout,
                        ) {
                            Ok(id) => id as i32,
                            Err(err) => {
                                tracing::warn!("notify failed: {err}");
                                0
                            }
                        }
                    }),
                    close_notification: Box::new(move |id| {
                        if id > 0
                            && let Err(err) = proxy.close_notification(id as u32)
                        {
                            tracing::debug!("close notification {id}: {err}");
                        }
                    }),
                };
                if let Err(err) = notifications::run(&device, protocols, callbacks, stop.clone()) {
                    tracing::warn!("notification service stopped: {err:#}");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
        .expect("failed to spawn notifications thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use waydroid_binder::services::notifications::{Action, ImageData, urgency};

    fn sample() -> Notification {
        Notification {
            replaces_id: 0,
            app_name: "Signal".into(),
            package_name: "org.thoughtcrime.securesms".into(),
            summary: "New message".into(),
            body: "hello".into(),
            actions: vec![Action { id: "reply".into(), label: "Reply".into() }],
            image: None,
            category: "im.received".into(),
            suppress_sound: false,
            expire_timeout: -1,
            resident: false,
            transient: true,
            urgency: urgency::NORMAL,
        }
    }

    #[test]
    fn actions_flatten_to_id_label_pairs() {
        assert_eq!(flatten_actions(&sample()), vec!["reply", "Reply"]);
    }

    #[test]
    fn hints_carry_urgency_category_and_desktop_entry() {
        let hints = build_hints(&sample());
        assert_eq!(hints.get("urgency"), Some(&Value::U8(urgency::NORMAL)));
        assert!(hints.contains_key("category"));
        assert!(hints.contains_key("transient"));
        assert!(!hints.contains_key("suppress-sound"));
        assert_eq!(
            hints.get("desktop-entry"),
            Some(&Value::from("waydroid.org.thoughtcrime.securesms"))
        );
    }

    #[test]
    fn image_hint_uses_the_iiibiiay_layout() {
        let mut notification = sample();
        notification.image = Some(ImageData {
            width: 2,
            height: 2,
            rowstride: 8,
            has_alpha: true,
            data: vec![0; 16],
        });
        let hints = build_hints(&notification);
        let Value::Structure(structure) = hints.get("image-data").unwrap() else {
            panic!("image-data must be a structure");
        };
        assert_eq!(structure.fields().len(), 7);
    }
}
