//! Client stub for Android's status bar service.

use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::Result;

use crate::protocol::Protocols;
use crate::services::RemoteStub;

pub const INTERFACE: &str = "com.android.internal.statusbar.IStatusBarService";
pub const SERVICE_NAME: &str = "statusbar";

const TRANSACTION_EXPAND: u32 = 1;
const TRANSACTION_COLLAPSE: u32 = 2;

pub struct StatusBar {
    stub: RemoteStub,
}

impl StatusBar {
    pub fn connect(device: &Path, protocols: Protocols, interrupted: &AtomicBool) -> Result<Self> {
        let stub = RemoteStub::connect(device, protocols, SERVICE_NAME, INTERFACE, interrupted)?;
        Ok(Self { stub })
    }

    pub fn expand(&self) {
        let request = self.stub.request();
        self.stub.call(TRANSACTION_EXPAND, &request);
    }

    pub fn collapse(&self) {
        let request = self.stub.request();
        self.stub.call(TRANSACTION_COLLAPSE, &request);
    }
}
