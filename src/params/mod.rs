//! Parameter synchronization channel.
//!
//! Requests travel over the same session as image data and are matched to
//! their responses by request id, so replies may arrive in any order. A cache
//! stamped with the session generation enables local validation and absorbs
//! updates the device pushes on its own.

mod cache;
mod channel;
mod pending;
mod standard;

pub use cache::{CacheLookup, ParameterCache};
pub use channel::ParameterChannel;
pub use pending::PendingRequests;
pub use standard::{AutoMode, OperationMode, ids};
