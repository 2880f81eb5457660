//! Host-user side: the session manager, its session-bus surface, and the
//! auxiliary services that bridge Android to the desktop (user monitor,
//! clipboard, notifications, GNSS).

pub mod ipc;
pub mod manager;
pub mod services;
pub mod wayland;

pub use manager::{SessionManager, SessionOptions};
