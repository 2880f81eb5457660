//! Kernel-facing plumbing: binder/ashmem driver probing, binderfs node
//! allocation, DRI render-node selection, and the mount layer the container
//! manager builds the Android rootfs with.

pub mod binderfs;
pub mod drivers;
pub mod gpu;
pub mod mount;

pub use drivers::DriverSelection;
pub use mount::MountLedger;
