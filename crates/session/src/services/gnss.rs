//! GNSS bridge: a `gnssStateChanged(b)` signal on the system bus toggles a
//! GeoClue2 subscription whose fixes are pushed into Android properties
//! through the platform service.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use zbus::zvariant::OwnedObjectPath;

use waydroid_binder::protocol::Protocols;
use waydroid_binder::services::platform::Platform;

const STATE_CHANGE_INTERFACE: &str = "id.waydro.StateChange";
const GNSS_SIGNAL: &str = "gnssStateChanged";

/// GeoClue accuracy level EXACT.
const ACCURACY_EXACT: u32 = 8;

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Manager",
    default_service = "org.freedesktop.GeoClue2",
    default_path = "/org/freedesktop/GeoClue2/Manager"
)]
trait GeoClueManager {
    fn get_client(&self) -> zbus::Result<OwnedObjectPath>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Client",
    default_service = "org.freedesktop.GeoClue2"
)]
trait GeoClueClient {
    fn start(&self) -> zbus::Result<()>;
    fn stop(&self) -> zbus::Result<()>;

    #[zbus(property)]
    fn desktop_id(&self) -> zbus::Result<String>;
    #[zbus(property)]
    fn set_desktop_id(&self, value: &str) -> zbus::Result<()>;
    #[zbus(property)]
    fn requested_accuracy_level(&self) -> zbus::Result<u32>;
    #[zbus(property)]
    fn set_requested_accuracy_level(&self, value: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn location_updated(
        &self,
        old: OwnedObjectPath,
        new: OwnedObjectPath,
    ) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.GeoClue2.Location",
    default_service = "org.freedesktop.GeoClue2"
)]
trait GeoClueLocation {
    #[zbus(property)]
    fn latitude(&self) -> zbus::Result<f64>;
    #[zbus(property)]
    fn longitude(&self) -> zbus::Result<f64>;
    #[zbus(property)]
    fn altitude(&self) -> zbus::Result<f64>;
    #[zbus(property)]
    fn speed(&self) -> zbus::Result<f64>;
}

fn push_location(platform: &Platform, latitude: f64, longitude: f64, altitude: f64, speed: f64) {
    platform.set_prop("waydroid.gnss.latitude", &latitude.to_string());
    platform.set_prop("waydroid.gnss.longitude", &longitude.to_string());
    platform.set_prop("waydroid.gnss.altitude", &altitude.to_string());
    if speed >= 0.0 {
        platform.set_prop("waydroid.gnss.speed", &speed.to_string());
    }
}

fn track(device: &PathBuf, protocols: Protocols, tracking: Arc<AtomicBool>) {
    let platform = match Platform::connect(device, protocols, &tracking) {
        Ok(platform) => platform,
        Err(err) => {
            tracing::error!("gnss: platform service unavailable: {err:#}");
            return;
        }
    };
    let connection = match zbus::blocking::Connection::system() {
        Ok(connection) => connection,
        Err(err) => {
            tracing::error!("gnss: no system bus: {err}");
            return;
        }
    };

    let run = || -> zbus::Result<()> {
        let manager = GeoClueManagerProxyBlocking::new(&connection)?;
        let client_path = manager.get_client()?;
        let client = GeoClueClientProxyBlocking::builder(&connection)
            .path(client_path)?
            .build()?;
        client.set_desktop_id("waydroid")?;
        client.set_requested_accuracy_level(ACCURACY_EXACT)?;

        let mut updates = client.receive_location_updated()?;
        client.start()?;
        tracing::info!("gnss: location tracking started");

        while tracking.load(Ordering::Relaxed) {
            let Some(signal) = updates.next() else { break };
            let args = signal.args()?;
            let location = GeoClueLocationProxyBlocking::builder(&connection)
                .path(args.new.clone())?
                .build()?;
            push_location(
                &platform,
                location.latitude()?,
                location.longitude()?,
                location.altitude()?,
                location.speed()?,
            );
        }
        client.stop()?;
        Ok(())
    };
    if let Err(err) = run() {
        tracing::error!("gnss: GeoClue error: {err}");
    }
    tracing::info!("gnss: location tracking stopped");
}

pub fn spawn(device: PathBuf, protocols: Protocols, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("gnss".into())
        .spawn(move || {
            let connection = match zbus::blocking::Connection::system() {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!("gnss disabled, no system bus: {err}");
                    return;
                }
            };
            let rule = zbus::MatchRule::builder()
                .msg_type(zbus::message::Type::Signal)
                .interface(STATE_CHANGE_INTERFACE)
                .and_then(|b| b.member(GNSS_SIGNAL))
                .map(|b| b.build());
            let rule = match rule {
                Ok(rule) => rule,
                Err(err) => {
                    tracing::warn!("gnss match rule: {err}");
                    return;
                }
            };
            let iterator =
                match zbus::blocking::MessageIterator::for_match_rule(rule, &connection, None) {
                    Ok(iterator) => iterator,
                    Err(err) => {
                        tracing::warn!("gnss signal subscription failed: {err}");
                        return;
                    }
                };

            let tracking = Arc::new(AtomicBool::new(false));
            let mut tracker: Option<JoinHandle<()>> = None;

            for message in iterator {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(message) = message else { continue };
                let enabled: bool = match message.body().deserialize() {
                    Ok(enabled) => enabled,
                    Err(err) => {
                        tracing::debug!("gnss: malformed state signal: {err}");
                        continue;
                    }
                };
                if enabled && !tracking.load(Ordering::Relaxed) {
                    tracking.store(true, Ordering::Relaxed);
                    let device = device.clone();
                    let tracking = tracking.clone();
                    tracker = Some(
                        std::thread::Builder::new()
                            .name("gnss-tracker".into())
                            .spawn(move || track(&device, protocols, tracking))
                            .expect("failed to spawn gnss tracker"),
                    );
                } else if !enabled {
                    tracking.store(false, Ordering::Relaxed);
                    if let Some(handle) = tracker.take() {
                        let _ = handle.join();
                    }
                }
            }
            tracking.store(false, Ordering::Relaxed);
        })
        .expect("failed to spawn gnss thread")
}
