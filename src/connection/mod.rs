//! Device sessions.
//!
//! A [`DeviceConnection`] owns one [`Session`]; a background receive loop keeps
//! it alive with heartbeats, reassembles image fragments, routes parameter
//! responses and reconnects after link loss.

mod device;
mod manager;
mod session;


pub use device::DeviceConnection;
pub use session::{Session, SessionState, SessionStatus};
