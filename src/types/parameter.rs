//! Device parameter descriptors and values

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, TransferError};

/// Tolerance used when checking that a value lies on the increment grid.
const INCREMENT_EPSILON: f64 = 1e-6;

/// A parameter value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
    /// Row-major tensor, e.g. a calibration matrix
    Tensor { shape: Vec<u32>, data: Vec<f64> },
    /// Index into the descriptor's enum option list
    EnumIndex(u32),
}

impl ParameterValue {
    /// Numeric view of scalar values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Double(v) => Some(*v),
            ParameterValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Int(_) => "int",
            ParameterValue::Double(_) => "double",
            ParameterValue::Bool(_) => "bool",
            ParameterValue::String(_) => "string",
            ParameterValue::Tensor { .. } => "tensor",
            ParameterValue::EnumIndex(_) => "enum index",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(v) => write!(f, "{v}"),
            ParameterValue::Double(v) => write!(f, "{v}"),
            ParameterValue::Bool(v) => write!(f, "{v}"),
            ParameterValue::String(v) => write!(f, "\"{v}\""),
            ParameterValue::Tensor { shape, data } => {
                let dims: Vec<String> = shape.iter().map(u32::to_string).collect();
                write!(f, "tensor[{}] {:?}", dims.join("x"), data)
            }
            ParameterValue::EnumIndex(i) => write!(f, "#{i}"),
        }
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Double(value)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterType {
    Int,
    Double,
    Bool,
    String,
    Tensor,
    /// Write-only trigger, any write of an int or bool executes it
    Command,
}

impl ParameterType {
    pub fn name(self) -> &'static str {
        match self {
            ParameterType::Int => "int",
            ParameterType::Double => "double",
            ParameterType::Bool => "bool",
            ParameterType::String => "string",
            ParameterType::Tensor => "tensor",
            ParameterType::Command => "command",
        }
    }
}

/// Access mode granted to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Shape of a parameter's value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Scalar,
    Enum,
    Tensor,
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// One allowed value of an enum parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumOption {
    pub value: ParameterValue,
    pub description: String,
}

/// Full description of one device parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub uid: String,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub param_type: ParameterType,
    pub access: Access,
    pub range: Option<Range>,
    pub increment: Option<f64>,
    pub options: Vec<EnumOption>,
    pub current: ParameterValue,
    pub default: ParameterValue,
}

impl ParameterDescriptor {
    /// Minimal read-write descriptor whose current value is also its default.
    pub fn new(uid: impl Into<String>, param_type: ParameterType, value: ParameterValue) -> Self {
        let uid = uid.into();
        Self {
            name: uid.clone(),
            uid,
            description: String::new(),
            unit: String::new(),
            param_type,
            access: Access::ReadWrite,
            range: None,
            increment: None,
            options: Vec::new(),
            current: value.clone(),
            default: value,
        }
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(Range::new(min, max));
        self
    }

    pub fn with_increment(mut self, increment: f64) -> Self {
        self.increment = Some(increment);
        self
    }

    pub fn with_option(mut self, value: ParameterValue, description: impl Into<String>) -> Self {
        self.options.push(EnumOption { value, description: description.into() });
        self
    }

    pub fn read_only(mut self) -> Self {
        self.access = Access::ReadOnly;
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    /// Current value differs from the factory default.
    pub fn is_modified(&self) -> bool {
        self.current != self.default
    }

    pub fn kind(&self) -> ParameterKind {
        if self.param_type == ParameterType::Tensor {
            ParameterKind::Tensor
        } else if !self.options.is_empty() {
            ParameterKind::Enum
        } else {
            ParameterKind::Scalar
        }
    }

    /// Description of the enum option matching the current value.
    pub fn current_option(&self) -> Option<&EnumOption> {
        self.options.iter().find(|option| option.value == self.current)
    }

    /// Check `value` against type, access, range, increment and enum options.
    ///
    /// Returns the value as it should be sent to the device: ints written to
    /// double parameters are widened and enum indices are resolved.
    pub fn validate(&self, value: ParameterValue) -> Result<ParameterValue> {
        if !self.is_writable() {
            return Err(TransferError::NotWritable { id: self.uid.clone() });
        }

        let value = match (value, self.kind()) {
            (ParameterValue::EnumIndex(index), ParameterKind::Enum) => {
                return self
                    .options
                    .get(index as usize)
                    .map(|option| option.value.clone())
                    .ok_or_else(|| TransferError::ValueOutOfRange {
                        id: self.uid.clone(),
                        details: format!(
                            "option index {index} outside 0..{}",
                            self.options.len()
                        ),
                    });
            }
            (value, _) => self.coerce(value)?,
        };

        match self.kind() {
            ParameterKind::Enum => {
                if !self.options.iter().any(|option| option.value == value) {
                    return Err(TransferError::ValueOutOfRange {
                        id: self.uid.clone(),
                        details: format!("{value} is not one of the enum options"),
                    });
                }
            }
            ParameterKind::Tensor => self.check_tensor(&value)?,
            ParameterKind::Scalar => {
                let numeric = matches!(self.param_type, ParameterType::Int | ParameterType::Double);
                if let Some(number) = value.as_f64().filter(|_| numeric) {
                    self.check_bounds(number)?;
                }
            }
        }

        Ok(value)
    }

    fn coerce(&self, value: ParameterValue) -> Result<ParameterValue> {
        let mismatch = |found: &ParameterValue| TransferError::TypeMismatch {
            id: self.uid.clone(),
            expected: self.param_type.name().to_string(),
            found: found.type_name().to_string(),
        };

        match (self.param_type, value) {
            (ParameterType::Int, v @ ParameterValue::Int(_)) => Ok(v),
            (ParameterType::Double, v @ ParameterValue::Double(_)) => Ok(v),
            (ParameterType::Double, ParameterValue::Int(v)) => Ok(ParameterValue::Double(v as f64)),
            (ParameterType::Bool, v @ ParameterValue::Bool(_)) => Ok(v),
            (ParameterType::String, v @ ParameterValue::String(_)) => Ok(v),
            (ParameterType::Tensor, v @ ParameterValue::Tensor { .. }) => Ok(v),
            (ParameterType::Command, v @ (ParameterValue::Int(_) | ParameterValue::Bool(_))) => {
                Ok(v)
            }
            (_, other) => Err(mismatch(&other)),
        }
    }

    fn check_bounds(&self, number: f64) -> Result<()> {
        if !number.is_finite() {
            return Err(TransferError::ValueOutOfRange {
                id: self.uid.clone(),
                details: format!("{number} is not finite"),
            });
        }
        if let Some(range) = self.range.filter(|r| !r.contains(number)) {
            return Err(TransferError::ValueOutOfRange {
                id: self.uid.clone(),
                details: format!("{number} outside [{}, {}]", range.min, range.max),
            });
        }
        if let Some(increment) = self.increment.filter(|inc| *inc > 0.0) {
            let origin = self.range.map(|r| r.min).unwrap_or(0.0);
            let steps = (number - origin) / increment;
            if (steps - steps.round()).abs() > INCREMENT_EPSILON {
                return Err(TransferError::ValueOutOfRange {
                    id: self.uid.clone(),
                    details: format!("{number} is not a multiple of increment {increment}"),
                });
            }
        }
        Ok(())
    }

    fn check_tensor(&self, value: &ParameterValue) -> Result<()> {
        let ParameterValue::Tensor { shape, data } = value else {
            return Ok(());
        };
        let expected: u64 = shape.iter().map(|d| *d as u64).product();
        if expected != data.len() as u64 {
            return Err(TransferError::ValueOutOfRange {
                id: self.uid.clone(),
                details: format!("shape {shape:?} needs {expected} elements, got {}", data.len()),
            });
        }
        if let ParameterValue::Tensor { shape: current_shape, .. } = &self.current {
            if current_shape != shape {
                return Err(TransferError::ValueOutOfRange {
                    id: self.uid.clone(),
                    details: format!("shape {shape:?} differs from {current_shape:?}"),
                });
            }
        }
        data.iter().try_for_each(|element| self.check_bounds(*element))
    }
}
