//! Delivery rate control for image set streams

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum rate at which image sets are handed to a stream consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every completed image set, as fast as the device produces them
    #[default]
    Native,

    /// At most this many image sets per second, latest wins.
    /// Falls back to Native when the device is not faster than this.
    Max(u32),
}

impl UpdateRate {
    /// Normalize against the device frame rate, if known.
    pub fn normalize(self, device_fps: Option<f64>) -> Self {
        match (self, device_fps) {
            (UpdateRate::Max(0), _) => UpdateRate::Native,
            (UpdateRate::Max(hz), Some(fps)) if hz as f64 >= fps => UpdateRate::Native,
            (rate, _) => rate,
        }
    }

    /// Interval between deliveries, `None` when no throttling applies.
    pub fn throttle_interval(self, device_fps: Option<f64>) -> Option<Duration> {
        match self.normalize(device_fps) {
            UpdateRate::Native => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faster_than_device_is_native() {
        assert_eq!(UpdateRate::Max(60).normalize(Some(30.0)), UpdateRate::Native);
        assert_eq!(UpdateRate::Max(10).normalize(Some(30.0)), UpdateRate::Max(10));
        assert_eq!(UpdateRate::Max(10).normalize(None), UpdateRate::Max(10));
        assert_eq!(UpdateRate::Max(0).normalize(None), UpdateRate::Native);
    }

    #[test]
    fn interval_matches_rate() {
        assert_eq!(UpdateRate::Max(4).throttle_interval(None), Some(Duration::from_millis(250)));
        assert_eq!(UpdateRate::Native.throttle_interval(Some(25.0)), None);
    }
}
