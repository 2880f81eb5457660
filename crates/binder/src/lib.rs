//! Binder RPC between the host and the Android userland.
//!
//! The host talks to Android over the selected binder node in both
//! directions: client stubs call into Android-side services (platform,
//! status bar), and host-side services (clipboard, notifications, user
//! monitor, hardware) are registered into the Android service manager so
//! the userland can call back out.
//!
//! The wire format varies with the Android SDK level of the mounted system
//! image. The selected [`protocol::BinderProtocol`] and
//! [`protocol::SmProtocol`] are data, carried next to the node name, and
//! every marshaller branches on them.

pub mod driver;
pub mod parcel;
pub mod protocol;
pub mod service_manager;
pub mod services;

pub use driver::BinderDriver;
pub use parcel::Parcel;
pub use protocol::{BinderProtocol, Protocols, SmProtocol};
pub use service_manager::ServiceManager;
