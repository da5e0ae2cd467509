//! Method tables: the local one we advertise, and the remote one the peer advertised.

use std::collections::BTreeMap;

use crate::error::{ProtocolError, RemoteError};
use crate::protocol::{MethodDescriptor, ResultShape};

/// Name-keyed descriptor table. Immutable once the session has started.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    methods: BTreeMap<String, MethodDescriptor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from a peer's registry frame. Later duplicates win.
    pub fn from_descriptors(descriptors: Vec<MethodDescriptor>) -> Self {
        let methods = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        Self { methods }
    }

    pub fn register(&mut self, descriptor: MethodDescriptor) -> Result<(), ProtocolError> {
        if self.methods.contains_key(&descriptor.name) {
            return Err(ProtocolError::DuplicateMethod(descriptor.name));
        }
        self.methods.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    pub fn shape(&self, name: &str) -> Option<&ResultShape> {
        self.methods.get(name).map(|d| &d.shape)
    }

    /// Descriptors in name order, as advertised.
    pub fn descriptors(&self) -> Vec<MethodDescriptor> {
        self.methods.values().cloned().collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Resolve an inbound call: the method must exist and, if it declares an arity,
    /// the caller-supplied argument count must match.
    pub fn check_call(&self, name: &str, argc: usize) -> Result<&MethodDescriptor, RemoteError> {
        let descriptor = self
            .methods
            .get(name)
            .ok_or_else(|| RemoteError::NoSuchMethod(name.to_string()))?;
        match descriptor.arity {
            Some(expected) if expected != argc => Err(RemoteError::ArgumentMismatch {
                method: name.to_string(),
                expected,
                got: argc,
            }),
            _ => Ok(descriptor),
        }
    }
}
