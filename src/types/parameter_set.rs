//! Point-in-time parameter snapshots

use std::collections::BTreeMap;

use super::parameter::{ParameterDescriptor, ParameterValue};

/// A disconnected copy of the device parameters.
///
/// Mutating a snapshot never reaches the device; use
/// [`crate::ParameterChannel::set_parameter`] for that.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    parameters: BTreeMap<String, ParameterDescriptor>,
    version: u64,
}

impl ParameterSet {
    pub fn new(version: u64, parameters: impl IntoIterator<Item = ParameterDescriptor>) -> Self {
        Self {
            parameters: parameters.into_iter().map(|p| (p.uid.clone(), p)).collect(),
            version,
        }
    }

    /// Cache version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, uid: &str) -> Option<&ParameterDescriptor> {
        self.parameters.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut ParameterDescriptor> {
        self.parameters.get_mut(uid)
    }

    /// Current value of a parameter.
    pub fn value(&self, uid: &str) -> Option<&ParameterValue> {
        self.parameters.get(uid).map(|p| &p.current)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.parameters.contains_key(uid)
    }

    pub fn insert(&mut self, descriptor: ParameterDescriptor) -> Option<ParameterDescriptor> {
        self.parameters.insert(descriptor.uid.clone(), descriptor)
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Descriptors in uid order.
    pub fn iter(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.parameters.values()
    }

    /// Parameters whose current value differs from the default.
    pub fn modified(&self) -> impl Iterator<Item = &ParameterDescriptor> {
        self.iter().filter(|p| p.is_modified())
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a ParameterDescriptor;
    type IntoIter = std::collections::btree_map::Values<'a, String, ParameterDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.parameters.values()
    }
}
