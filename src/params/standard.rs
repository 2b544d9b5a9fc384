//! Well-known parameter ids and typed views of their values.

use std::fmt;

use crate::types::ParameterValue;
use crate::{Result, TransferError};

/// Parameter ids every device exposes.
pub mod ids {
    pub const OPERATION_MODE: &str = "operation_mode";
    pub const TRIGGER_FREQUENCY: &str = "trigger_frequency";
    pub const AUTO_EXPOSURE_MODE: &str = "auto_exposure_mode";
    pub const MANUAL_EXPOSURE_TIME: &str = "manual_exposure_time";
    pub const MANUAL_GAIN: &str = "manual_gain";
    pub const DISPARITY_OFFSET: &str = "disparity_offset";
    pub const CONSISTENCY_CHECK_ENABLED: &str = "consistency_check_enabled";
    pub const UNIQUENESS_CHECK_ENABLED: &str = "uniqueness_check_enabled";
    pub const GAP_INTERPOLATION_ENABLED: &str = "gap_interpolation_enabled";
    pub const NOISE_REDUCTION_ENABLED: &str = "noise_reduction_enabled";
    /// Command parameter, writing `true` restarts the device
    pub const REBOOT: &str = "reboot";
}

/// What the device does with captured images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    /// Input images are passed through unmodified
    PassThrough,
    /// Rectified input images
    Rectify,
    /// Rectified left image plus disparity map
    StereoMatching,
}

/// Exposure and gain control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoMode {
    AutoExposureAndGain,
    AutoExposureManualGain,
    ManualExposureAutoGain,
    ManualExposureAndGain,
}

macro_rules! int_coded {
    ($ty:ident, $param:expr, { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl $ty {
            pub fn code(self) -> i64 {
                match self {
                    $($ty::$variant => $code,)+
                }
            }

            pub fn from_code(code: i64) -> Option<Self> {
                match code {
                    $($code => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$ty> for ParameterValue {
            fn from(value: $ty) -> Self {
                ParameterValue::Int(value.code())
            }
        }

        impl TryFrom<&ParameterValue> for $ty {
            type Error = TransferError;

            fn try_from(value: &ParameterValue) -> Result<Self> {
                let code = value.as_i64().ok_or_else(|| TransferError::TypeMismatch {
                    id: $param.to_string(),
                    expected: "int".to_string(),
                    found: value.type_name().to_string(),
                })?;
                Self::from_code(code).ok_or_else(|| TransferError::ValueOutOfRange {
                    id: $param.to_string(),
                    details: format!("unknown {} code {code}", stringify!($ty)),
                })
            }
        }
    };
}

int_coded!(OperationMode, ids::OPERATION_MODE, {
    PassThrough = 0,
    Rectify = 1,
    StereoMatching = 2,
});

int_coded!(AutoMode, ids::AUTO_EXPOSURE_MODE, {
    AutoExposureAndGain = 0,
    AutoExposureManualGain = 1,
    ManualExposureAutoGain = 2,
    ManualExposureAndGain = 3,
});

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::PassThrough => f.write_str("pass-through"),
            OperationMode::Rectify => f.write_str("rectify"),
            OperationMode::StereoMatching => f.write_str("stereo matching"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_device_values() {
        assert_eq!(OperationMode::StereoMatching.code(), 2);
        assert_eq!(AutoMode::ManualExposureAndGain.code(), 3);
        assert_eq!(OperationMode::from_code(1), Some(OperationMode::Rectify));
        assert_eq!(OperationMode::from_code(3), None);
    }

    #[test]
    fn conversion_from_values_is_strict() {
        assert_eq!(
            OperationMode::try_from(&ParameterValue::Int(0)).unwrap(),
            OperationMode::PassThrough
        );
        assert!(matches!(
            OperationMode::try_from(&ParameterValue::Double(0.0)),
            Err(TransferError::TypeMismatch { .. })
        ));
        assert!(matches!(
            AutoMode::try_from(&ParameterValue::Int(9)),
            Err(TransferError::ValueOutOfRange { .. })
        ));
    }
}
