use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValueMap},
};

use super::{
    attention::{FlashAttention, FlashAttentionBackward},
    operation_ir::OperationKind,
    primitive::{LayerNormBackward, Matmul, Pointwise, Reduction, Reshape, Rng},
    softmax::Softmax,
    Node, NodeType,
};

/// Uniform capability interface every operator family implements.
///
/// The [`Node`] driver calls the three phases in order and never twice.
pub trait NodeOperation {
    fn name(&self) -> &str;
    fn kind(&self) -> OperationKind;
    fn node_type(&self) -> NodeType;
    fn inputs(&self) -> Vec<TensorHandle>;
    fn outputs(&self) -> Vec<TensorHandle>;

    /// Structural checks on the attributes as given. Must not mutate anything.
    fn pre_validate(&self, table: &TensorTable, context: &Context) -> Result<()>;

    /// Fill unset output properties. Composite operations return the child
    /// nodes they expand into, in execution order.
    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>>;

    fn post_validate(&self, table: &TensorTable) -> Result<()>;

    /// Bytes of workspace the node needs for itself, excluding its children.
    fn workspace_size(&self) -> usize {
        0
    }

    fn pass_by_value_tensors(
        &self,
        _handle: &mut dyn ExecutionHandle,
        _device_pointers: &DevicePointerMap,
        _pass_by_value: &mut PassByValueMap,
        _workspace: DevicePtr,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Operation {
    Matmul(Matmul),
    Pointwise(Pointwise),
    Reduction(Reduction),
    Rng(Rng),
    Reshape(Reshape),
    LayerNormBackward(LayerNormBackward),
    Softmax(Softmax),
    FlashAttention(FlashAttention),
    FlashAttentionBackward(FlashAttentionBackward),
}

impl Operation {
    pub fn as_node(&self) -> &dyn NodeOperation {
        match self {
            Operation::Matmul(op) => op,
            Operation::Pointwise(op) => op,
            Operation::Reduction(op) => op,
            Operation::Rng(op) => op,
            Operation::Reshape(op) => op,
            Operation::LayerNormBackward(op) => op,
            Operation::Softmax(op) => op,
            Operation::FlashAttention(op) => op,
            Operation::FlashAttentionBackward(op) => op,
        }
    }

    pub fn as_node_mut(&mut self) -> &mut dyn NodeOperation {
        match self {
            Operation::Matmul(op) => op,
            Operation::Pointwise(op) => op,
            Operation::Reduction(op) => op,
            Operation::Rng(op) => op,
            Operation::Reshape(op) => op,
            Operation::LayerNormBackward(op) => op,
            Operation::Softmax(op) => op,
            Operation::FlashAttention(op) => op,
            Operation::FlashAttentionBackward(op) => op,
        }
    }
}

macro_rules! impl_from_operation {
    ($($variant:ident),+) => {
        $(
            impl From<$variant> for Operation {
                fn from(op: $variant) -> Self {
                    Operation::$variant(op)
                }
            }
        )+
    };
}

impl_from_operation!(
    Matmul,
    Pointwise,
    Reduction,
    Rng,
    Reshape,
    LayerNormBackward,
    Softmax,
    FlashAttention,
    FlashAttentionBackward
);
