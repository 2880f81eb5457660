//! Client stub for the Android-side platform service.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::parcel::{Parcel, ReadResult};
use crate::protocol::Protocols;
use crate::services::RemoteStub;

pub const INTERFACE: &str = "lineageos.waydroid.IPlatform";
pub const SERVICE_NAME: &str = "waydroidplatform";

const TRANSACTION_GETPROP: u32 = 1;
const TRANSACTION_SETPROP: u32 = 2;
const TRANSACTION_GET_APPS_INFO: u32 = 3;
const TRANSACTION_GET_APP_INFO: u32 = 4;
const TRANSACTION_INSTALL_APP: u32 = 5;
const TRANSACTION_REMOVE_APP: u32 = 6;
const TRANSACTION_LAUNCH_APP: u32 = 7;
const TRANSACTION_GET_APP_NAME: u32 = 8;
const TRANSACTION_SETTINGS_PUT_STRING: u32 = 9;
const TRANSACTION_SETTINGS_GET_STRING: u32 = 10;
const TRANSACTION_SETTINGS_PUT_INT: u32 = 11;
const TRANSACTION_SETTINGS_GET_INT: u32 = 12;
const TRANSACTION_LAUNCH_INTENT: u32 = 13;

/// One launchable package as Android reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub package_name: String,
    pub action: String,
    pub launch_intent: String,
    pub component_package_name: String,
    pub component_class_name: String,
    pub categories: Vec<String>,
}

fn read_app_info(parcel: &mut Parcel) -> ReadResult<Option<AppInfo>> {
    if !parcel.read_parcelable_present()? {
        return Ok(None);
    }
    let mut info = AppInfo {
        name: parcel.read_string16()?.unwrap_or_default(),
        package_name: parcel.read_string16()?.unwrap_or_default(),
        action: parcel.read_string16()?.unwrap_or_default(),
        launch_intent: parcel.read_string16()?.unwrap_or_default(),
        component_package_name: parcel.read_string16()?.unwrap_or_default(),
        component_class_name: parcel.read_string16()?.unwrap_or_default(),
        categories: Vec::new(),
    };
    let categories = parcel.read_i32()?.max(0);
    for _ in 0..categories {
        info.categories
            .push(parcel.read_string16()?.unwrap_or_default());
    }
    Ok(Some(info))
}

pub struct Platform {
    stub: RemoteStub,
}

impl Platform {
    /// Resolve the platform service, waiting for the service manager and
    /// retrying the lookup with the shared bounds.
    pub fn connect(device: &Path, protocols: Protocols, interrupted: &AtomicBool) -> Result<Self> {
        let stub = RemoteStub::connect(device, protocols, SERVICE_NAME, INTERFACE, interrupted)?;
        Ok(Self { stub })
    }

    pub fn get_prop(&self, name: &str, default: &str) -> String {
        let mut request = self.stub.request();
        request.write_string16(Some(name));
        request.write_string16(Some(default));
        self.stub
            .call(TRANSACTION_GETPROP, &request)
            .and_then(|mut reply| reply.read_string16().ok().flatten())
            .unwrap_or_else(|| default.to_string())
    }

    pub fn set_prop(&self, name: &str, value: &str) {
        let mut request = self.stub.request();
        request.write_string16(Some(name));
        request.write_string16(Some(value));
        self.stub.call(TRANSACTION_SETPROP, &request);
    }

    /// All launchable apps; empty on any RPC failure.
    pub fn get_apps_info(&self) -> Vec<AppInfo> {
        let request = self.stub.request();
        let Some(mut reply) = self.stub.call(TRANSACTION_GET_APPS_INFO, &request) else {
            return Vec::new();
        };
        let mut apps = Vec::new();
        let count = reply.read_i32().unwrap_or(0).max(0);
        for _ in 0..count {
            match read_app_info(&mut reply) {
                Ok(Some(info)) => apps.push(info),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!("malformed app info from {SERVICE_NAME}: {err}");
                    break;
                }
            }
        }
        apps
    }

    pub fn get_app_info(&self, package_name: &str) -> Option<AppInfo> {
        let mut request = self.stub.request();
        request.write_string16(Some(package_name));
        let mut reply = self.stub.call(TRANSACTION_GET_APP_INFO, &request)?;
        read_app_info(&mut reply).ok().flatten()
    }

    pub fn install_app(&self, path: &str) -> Option<i32> {
        let mut request = self.stub.request();
        request.write_string16(Some(path));
        self.stub
            .call(TRANSACTION_INSTALL_APP, &request)
            .and_then(|mut reply| reply.read_i32().ok())
    }

    pub fn remove_app(&self, package_name: &str) -> Option<i32> {
        let mut request = self.stub.request();
        request.write_string16(Some(package_name));
        self.stub
            .call(TRANSACTION_REMOVE_APP, &request)
            .and_then(|mut reply| reply.read_i32().ok())
    }

    pub fn launch_app(&self, package_name: &str) {
        let mut request = self.stub.request();
        request.write_string16(Some(package_name));
        self.stub.call(TRANSACTION_LAUNCH_APP, &request);
    }

    pub fn launch_intent(&self, action: &str, uri: &str) -> Option<String> {
        let mut request = self.stub.request();
        request.write_string16(Some(action));
        request.write_string16(Some(uri));
        self.stub
            .call(TRANSACTION_LAUNCH_INTENT, &request)
            .and_then(|mut reply| reply.read_string16().ok().flatten())
    }

    pub fn get_app_name(&self, package_name: &str) -> Option<String> {
        let mut request = self.stub.request();
        request.write_string16(Some(package_name));
        self.stub
            .call(TRANSACTION_GET_APP_NAME, &request)
            .and_then(|mut reply| reply.read_string16().ok().flatten())
    }

    pub fn settings_put_string(&self, user: i32, key: &str, value: &str) {
        let mut request = self.stub.request();
        request.write_i32(user);
        request.write_string16(Some(key));
        request.write_string16(Some(value));
        self.stub.call(TRANSACTION_SETTINGS_PUT_STRING, &request);
    }

    pub fn settings_get_string(&self, user: i32, key: &str) -> Option<String> {
        let mut request = self.stub.request();
        request.write_i32(user);
        request.write_string16(Some(key));
        self.stub
            .call(TRANSACTION_SETTINGS_GET_STRING, &request)
            .and_then(|mut reply| reply.read_string16().ok().flatten())
    }

    pub fn settings_put_int(&self, user: i32, key: &str, value: i32) {
        let mut request = self.stub.request();
        request.write_i32(user);
        request.write_string16(Some(key));
        request.write_i32(value);
        self.stub.call(TRANSACTION_SETTINGS_PUT_INT, &request);
    }

    pub fn settings_get_int(&self, user: i32, key: &str) -> Option<i32> {
        let mut request = self.stub.request();
        request.write_i32(user);
        request.write_string16(Some(key));
        self.stub
            .call(TRANSACTION_SETTINGS_GET_INT, &request)
            .and_then(|mut reply| reply.read_i32().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_app_info(parcel: &mut Parcel, package: &str, categories: &[&str]) {
        parcel.write_parcelable_header();
        parcel.write_string16(Some("App"));
        parcel.write_string16(Some(package));
        parcel.write_string16(Some("android.intent.action.MAIN"));
        parcel.write_string16(Some(""));
        parcel.write_string16(Some(package));
        parcel.write_string16(Some("MainActivity"));
        parcel.write_i32(categories.len() as i32);
        for c in categories {
            parcel.write_string16(Some(c));
        }
    }

    #[test]
    fn app_info_round_trip() {
        let mut parcel = Parcel::new();
        write_app_info(
            &mut parcel,
            "org.example.app",
            &["android.intent.category.LAUNCHER"],
        );
        let info = read_app_info(&mut parcel).unwrap().unwrap();
        assert_eq!(info.package_name, "org.example.app");
        assert_eq!(info.component_class_name, "MainActivity");
        assert_eq!(info.categories, vec!["android.intent.category.LAUNCHER"]);
    }

    #[test]
    fn null_app_info_reads_as_none() {
        let mut parcel = Parcel::new();
        parcel.write_null_parcelable();
        assert_eq!(read_app_info(&mut parcel).unwrap(), None);
    }

    #[test]
    fn apps_list_layout_matches_server() {
        // Two entries, one of them null, as the platform service emits
        // when a package disappears mid-enumeration.
        let mut parcel = Parcel::new();
        parcel.write_i32(2);
        write_app_info(&mut parcel, "a.b.c", &[]);
        parcel.write_null_parcelable();

        let count = parcel.read_i32().unwrap();
        assert_eq!(count, 2);
        assert!(read_app_info(&mut parcel).unwrap().is_some());
        assert!(read_app_info(&mut parcel).unwrap().is_none());
    }
}
