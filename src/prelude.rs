//! Everything needed to describe and validate a graph.

pub use crate::{
    context::{Capabilities, Context, WorkspaceLimit},
    error::{ErrorCode, GraphError, Result},
    tensor::{DataType, TensorAttributes, TensorHandle, TensorKind},
    tensor_op::{
        attention::{
            FlashAttention, FlashAttentionBackward, FlashAttentionBackwardInput,
            FlashAttentionBackwardOutput, FlashAttentionInput, FlashAttentionOutput,
        },
        primitive::{LayerNormBackward, Matmul, Pointwise, Reduction, Reshape, Rng},
        softmax::Softmax,
        Graph, Node, NodeState, Operation, NodeType, OperationKind, PointwiseMode, ReductionMode,
        RngDistribution,
    },
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValue, PassByValueMap},
};
