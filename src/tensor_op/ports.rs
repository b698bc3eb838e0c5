use std::{collections::BTreeMap, fmt::Debug};

use crate::{
    context::Context,
    error::{GraphError, Result},
    tensor::{TensorHandle, TensorTable},
};

/// Marker for the fixed set of port names an operator family declares.
pub trait PortName: Copy + Ord + Debug {}

impl<T: Copy + Ord + Debug> PortName for T {}

/// Named input and output slots of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Ports<I: PortName, O: PortName> {
    inputs: BTreeMap<I, TensorHandle>,
    outputs: BTreeMap<O, TensorHandle>,
}

impl<I: PortName, O: PortName> Default for Ports<I, O> {
    fn default() -> Self {
        Ports {
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }
}

impl<I: PortName, O: PortName> Ports<I, O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input(&mut self, port: I, tensor: TensorHandle) {
        self.inputs.insert(port, tensor);
    }

    pub fn set_output(&mut self, port: O, tensor: TensorHandle) {
        self.outputs.insert(port, tensor);
    }

    pub fn input(&self, port: I) -> Option<TensorHandle> {
        self.inputs.get(&port).copied()
    }

    pub fn output(&self, port: O) -> Option<TensorHandle> {
        self.outputs.get(&port).copied()
    }

    pub fn has_input(&self, port: I) -> bool {
        self.inputs.contains_key(&port)
    }

    pub fn has_output(&self, port: O) -> bool {
        self.outputs.contains_key(&port)
    }

    pub fn require_input(&self, port: I) -> Result<TensorHandle> {
        self.input(port)
            .ok_or_else(|| GraphError::AttributeNotSet(format!("Tensor input {:?} not set", port)))
    }

    pub fn require_output(&self, port: O) -> Result<TensorHandle> {
        self.output(port).ok_or_else(|| {
            GraphError::AttributeNotSet(format!("Tensor output {:?} not set", port))
        })
    }

    pub fn inputs(&self) -> impl Iterator<Item = (I, TensorHandle)> + '_ {
        self.inputs.iter().map(|(port, tensor)| (*port, *tensor))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (O, TensorHandle)> + '_ {
        self.outputs.iter().map(|(port, tensor)| (*port, *tensor))
    }

    pub fn input_handles(&self) -> Vec<TensorHandle> {
        self.inputs.values().copied().collect()
    }

    pub fn output_handles(&self) -> Vec<TensorHandle> {
        self.outputs.values().copied().collect()
    }

    /// Every bound input must already carry a shape and a matching stride.
    pub fn validate_inputs(&self, table: &TensorTable) -> Result<()> {
        for (port, handle) in self.inputs() {
            let tensor = table.get(handle)?;
            ensure!(
                !tensor.dims().is_empty(),
                AttributeNotSet,
                "Input {:?} ('{}') has no dims",
                port,
                tensor.name()
            );
            ensure!(
                tensor.strides().len() == tensor.dims().len(),
                AttributeNotSet,
                "Input {:?} ('{}') has stride {:?} for dims {:?}",
                port,
                tensor.name(),
                tensor.strides(),
                tensor.dims()
            );
        }
        Ok(())
    }

    /// Every bound output must be fully resolved.
    pub fn validate_outputs(&self, table: &TensorTable) -> Result<()> {
        for (port, handle) in self.outputs() {
            let tensor = table.get(handle)?;
            ensure!(
                tensor.is_fully_specified(),
                AttributeNotSet,
                "Output {:?} ('{}') is not fully specified: dims {:?}, stride {:?}, {:?}",
                port,
                tensor.name(),
                tensor.dims(),
                tensor.strides(),
                tensor.data_type()
            );
        }
        Ok(())
    }

    pub fn fill_from_context(&self, table: &mut TensorTable, context: &Context) -> Result<()> {
        for handle in self.inputs.values().chain(self.outputs.values()) {
            table.get_mut(*handle)?.fill_from_context(context);
        }
        Ok(())
    }
}

/// Reject a bound tensor whose innermost stride is not 1. Tensors without a
/// stride yet are left to post-validation.
pub(crate) fn check_unit_inner_stride<P: Debug>(
    table: &TensorTable,
    port: P,
    tensor: Option<TensorHandle>,
) -> Result<()> {
    if let Some(handle) = tensor {
        let tensor = table.get(handle)?;
        if !tensor.strides().is_empty() {
            ensure!(
                tensor.has_unit_inner_stride(),
                GraphNotSupported,
                "The stride for the last dimension should be 1 for {:?}, got {:?}",
                port,
                tensor.strides()
            );
        }
    }
    Ok(())
}
