use log::{debug, info};
use uuid::Uuid;

use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValueMap, WorkspaceCursor},
};

pub mod attention;
pub(crate) mod graph;
pub(crate) mod operation;
pub(crate) mod operation_ir;
pub(crate) mod ports;
pub mod primitive;
pub mod softmax;
pub(crate) mod subgraph;
pub(crate) mod util;

pub use graph::{Graph, SoftmaxTensors};
pub use operation::{NodeOperation, Operation};
pub use operation_ir::{OperationKind, PointwiseMode, ReductionMode, RngDistribution};

type NodeId = Uuid;

/// Whether a node maps onto one backend operation or expands into others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Primitive,
    Composite,
}

/// Pipeline phase a node has completed. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Unvalidated,
    PreValidated,
    Expanded,
    PostValidated,
}

/// One operation in the graph together with the children it expanded into.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    operation: Operation,
    state: NodeState,
    children: Vec<Node>,
}

impl Node {
    pub fn new(operation: impl Into<Operation>) -> Self {
        Node {
            id: Uuid::new_v4(),
            operation: operation.into(),
            state: NodeState::Unvalidated,
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.operation.as_node().name()
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.as_node().kind()
    }

    pub fn node_type(&self) -> NodeType {
        self.operation.as_node().node_type()
    }

    pub fn is_primitive(&self) -> bool {
        self.node_type() == NodeType::Primitive
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn inputs(&self) -> Vec<TensorHandle> {
        self.operation.as_node().inputs()
    }

    pub fn outputs(&self) -> Vec<TensorHandle> {
        self.operation.as_node().outputs()
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Drive the node through pre-validation, expansion and post-validation.
    ///
    /// Children produced by the expansion are driven through their own full
    /// cycle, in creation order, before this node is post-validated.
    pub fn validate(&mut self, table: &mut TensorTable, context: &Context) -> Result<()> {
        ensure!(
            self.state == NodeState::Unvalidated,
            InvalidState,
            "{} node '{}' was already driven to {:?}",
            self.kind(),
            self.name(),
            self.state
        );

        info!("Validating {} node {}", self.kind(), self.name());
        self.operation.as_node().pre_validate(table, context)?;
        self.state = NodeState::PreValidated;

        info!("Inferring properties for {} node {}", self.kind(), self.name());
        let children = self
            .operation
            .as_node_mut()
            .expand_and_infer_properties(table, context)?;
        if !children.is_empty() {
            debug!(
                "{} node '{}' expanded into {} children",
                self.kind(),
                self.name(),
                children.len()
            );
        }
        self.children = children;
        for child in self.children.iter_mut() {
            child.validate(table, context)?;
        }
        self.state = NodeState::Expanded;

        self.operation.as_node().post_validate(table)?;
        self.state = NodeState::PostValidated;
        Ok(())
    }

    fn ensure_post_validated(&self) -> Result<()> {
        ensure!(
            self.state == NodeState::PostValidated,
            InvalidState,
            "{} node '{}' has not been validated (state {:?})",
            self.kind(),
            self.name(),
            self.state
        );
        Ok(())
    }

    /// Workspace bytes of this node and everything it expanded into.
    pub fn workspace_size(&self) -> Result<usize> {
        self.ensure_post_validated()?;
        let mut size = self.operation.as_node().workspace_size();
        for child in &self.children {
            size += child.workspace_size()?;
        }
        Ok(size)
    }

    /// Record every pass-by-value binding of the subtree. The node's own
    /// buffers start at `workspace`; each child gets the next region.
    pub fn gather_pass_by_value(
        &self,
        handle: &mut dyn ExecutionHandle,
        device_pointers: &DevicePointerMap,
        pass_by_value: &mut PassByValueMap,
        workspace: DevicePtr,
    ) -> Result<()> {
        self.ensure_post_validated()?;
        let operation = self.operation.as_node();
        operation.pass_by_value_tensors(handle, device_pointers, pass_by_value, workspace)?;

        let mut cursor = WorkspaceCursor::new(workspace.offset(operation.workspace_size()));
        for child in &self.children {
            let region = cursor.take(child.workspace_size()?);
            child.gather_pass_by_value(handle, device_pointers, pass_by_value, region)?;
        }
        Ok(())
    }

    /// Leaves of the expansion tree, in execution order.
    pub fn primitives(&self) -> Vec<&Node> {
        if self.is_primitive() {
            return vec![self];
        }
        self.children
            .iter()
            .flat_map(|child| child.primitives())
            .collect()
    }
}
