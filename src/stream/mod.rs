//! Stream combinators used by the image receiver.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
