use std::fmt;

use log::debug;

use crate::error::{GraphError, Result};

use super::{TensorAttributes, TensorUid};

/// Index of a descriptor inside a [`TensorTable`].
///
/// Handles are shared by every node whose port references the tensor; the
/// table outlives all of them, so no reference counting is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorHandle(usize);

impl TensorHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Arena of every tensor descriptor bound into a graph.
#[derive(Debug, Default, Clone)]
pub struct TensorTable {
    tensors: Vec<TensorAttributes>,
}

impl TensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a descriptor into the graph, assigning its uid.
    pub fn bind(&mut self, mut attributes: TensorAttributes) -> TensorHandle {
        attributes.assign_uid();
        let handle = TensorHandle(self.tensors.len());
        debug!(
            "Binding tensor '{}' (uid {:?}) as {}",
            attributes.name(),
            attributes.uid(),
            handle
        );
        self.tensors.push(attributes);
        handle
    }

    pub fn get(&self, handle: TensorHandle) -> Result<&TensorAttributes> {
        self.tensors.get(handle.0).ok_or_else(|| {
            GraphError::InvalidValue(format!("Tensor handle {} is not bound", handle))
        })
    }

    pub fn get_mut(&mut self, handle: TensorHandle) -> Result<&mut TensorAttributes> {
        self.tensors.get_mut(handle.0).ok_or_else(|| {
            GraphError::InvalidValue(format!("Tensor handle {} is not bound", handle))
        })
    }

    pub fn find_by_uid(&self, uid: TensorUid) -> Option<TensorHandle> {
        self.tensors
            .iter()
            .position(|t| t.uid() == Some(uid))
            .map(TensorHandle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorHandle, &TensorAttributes)> {
        self.tensors
            .iter()
            .enumerate()
            .map(|(index, tensor)| (TensorHandle(index), tensor))
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binding_assigns_unique_uids() {
        let mut table = TensorTable::new();
        let a = table.bind(TensorAttributes::new().with_name("a"));
        let b = table.bind(TensorAttributes::new().with_name("b"));
        let uid_a = table.get(a).unwrap().uid().unwrap();
        let uid_b = table.get(b).unwrap().uid().unwrap();
        assert_ne!(uid_a, uid_b);
        assert_eq!(table.find_by_uid(uid_b), Some(b));
    }

    #[test]
    fn caller_uid_is_kept() {
        let mut table = TensorTable::new();
        let q = table.bind(TensorAttributes::new().with_uid(-42));
        assert_eq!(table.get(q).unwrap().uid(), Some(-42));
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let table = TensorTable::new();
        assert!(table.get(TensorHandle(3)).is_err());
    }
}
