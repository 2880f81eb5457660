//! Host-bound IHardware service. Android's settings UI reaches the
//! container lifecycle through this: suspend honours the configured
//! suspend action, reboot restarts the container, upgrade swaps images
//! that were already downloaded and verified inside Android.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::sync::Mutex;

use waydroid_binder::protocol::Protocols;
use waydroid_binder::services::hardware::{self, HardwareCallbacks};
use waydroid_core::Config;
use waydroid_core::config::SuspendAction;
use waydroid_sandbox::DriverSelection;

use crate::manager::ContainerManager;

/// Run the IHardware binder service until `stop` is raised. Blocks; spawn
/// on a dedicated thread. Waits for the first container start to persist
/// the protocol selection before opening the binder node.
pub fn run(manager: Arc<Mutex<ContainerManager>>, stop: Arc<AtomicBool>) {
    let paths = manager.blocking_lock().paths().clone();

    let (device, protocols) = loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let ready = Config::load(&paths).ok().and_then(|cfg| {
            let selection = DriverSelection::from_config(&cfg).ok()?;
            let protocols = Protocols::from_config(&cfg).ok()?;
            Some((selection.binder_device(), protocols))
        });
        match ready {
            Some(ready) => break ready,
            None => std::thread::sleep(Duration::from_secs(5)),
        }
    };

    let callbacks = HardwareCallbacks {
        enable_nfc: Box::new(|_enable| {
            tracing::debug!("enableNFC is not implemented on this host");
            0
        }),
        enable_bluetooth: Box::new(|_enable| {
            tracing::debug!("enableBluetooth is not implemented on this host");
            0
        }),
        suspend: {
            let manager = manager.clone();
            let paths = paths.clone();
            Box::new(move || {
                let action = Config::load(&paths)
                    .map(|cfg| cfg.waydroid.suspend_action)
                    .unwrap_or_default();
                let mut manager = manager.blocking_lock();
                let result = match action {
                    SuspendAction::Freeze => manager.freeze(),
                    SuspendAction::Stop => {
                        manager.stop(false);
                        Ok(())
                    }
                };
                if let Err(err) = result {
                    tracing::error!("suspend failed: {err:#}");
                }
            })
        },
        reboot: {
            let manager = manager.clone();
            Box::new(move || {
                if let Err(err) = manager.blocking_lock().restart() {
                    tracing::error!("reboot failed: {err:#}");
                }
            })
        },
        upgrade: {
            let manager = manager.clone();
            Box::new(move |system_zip, system_time, vendor_zip, vendor_time| {
                let result = manager.blocking_lock().replace_images_and_restart(
                    &system_zip,
                    system_time,
                    &vendor_zip,
                    vendor_time,
                );
                if let Err(err) = result {
                    tracing::error!("in-place upgrade failed: {err:#}");
                }
            })
        },
    };

    if let Err(err) = hardware::run(&device, protocols, callbacks, stop) {
        tracing::error!("hardware service exited: {err:#}");
    }
}
