//! Caller-facing graph: owns the tensor arena and the top-level nodes, and
//! drives them through validation and workspace accounting.

use log::info;

use crate::{
    context::Context,
    error::Result,
    tensor::{DataType, TensorAttributes, TensorHandle, TensorKind, TensorTable},
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValueMap, WorkspaceCursor},
};

use super::{
    attention::{
        FlashAttention, FlashAttentionBackward, FlashAttentionBackwardInput,
        FlashAttentionBackwardOutput, FlashAttentionInput, FlashAttentionOutput,
    },
    primitive::{
        LayerNormBackward, LayerNormBackwardInput, LayerNormBackwardOutput, Matmul, Pointwise,
        Reduction, Reshape, Rng,
    },
    softmax::Softmax,
    subgraph::Subgraph,
    Node,
};

mod traversal;
mod viz;

use traversal::check_dag;

/// Outputs bound by [`Graph::softmax`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxTensors {
    pub s: TensorHandle,
    pub stats: Option<TensorHandle>,
    pub m: Option<TensorHandle>,
    pub zinv: Option<TensorHandle>,
}

#[derive(Debug, Default)]
pub struct Graph {
    context: Context,
    tensors: TensorTable,
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new(context: Context) -> Self {
        Graph {
            context,
            tensors: TensorTable::new(),
            nodes: Vec::new(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Bind a caller-described tensor into the graph.
    pub fn tensor(&mut self, attributes: TensorAttributes) -> TensorHandle {
        self.tensors.bind(attributes)
    }

    pub fn tensor_attributes(&self, tensor: TensorHandle) -> Result<&TensorAttributes> {
        self.tensors.get(tensor)
    }

    pub fn tensor_mut(&mut self, tensor: TensorHandle) -> Result<&mut TensorAttributes> {
        self.tensors.get_mut(tensor)
    }

    pub fn tensors(&self) -> &TensorTable {
        &self.tensors
    }

    /// Top-level nodes in the order they were added.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn builder(&mut self) -> Subgraph<'_> {
        Subgraph::with_output_kind(&mut self.tensors, TensorKind::External)
    }

    fn output(&mut self, name: &str) -> TensorHandle {
        self.tensors.bind(TensorAttributes::new().with_name(name))
    }

    pub fn matmul(&mut self, a: TensorHandle, b: TensorHandle, attributes: Matmul) -> TensorHandle {
        let mut sub = self.builder();
        let c = sub.matmul(attributes, a, b);
        let nodes = sub.finish();
        self.nodes.extend(nodes);
        c
    }

    pub fn pointwise(&mut self, inputs: &[TensorHandle], attributes: Pointwise) -> TensorHandle {
        let mut sub = self.builder();
        let output = sub.pointwise_with(attributes, inputs);
        let nodes = sub.finish();
        self.nodes.extend(nodes);
        output
    }

    pub fn reduction(&mut self, x: TensorHandle, attributes: Reduction) -> TensorHandle {
        let mut sub = self.builder();
        let y = sub.reduction(attributes, x);
        let nodes = sub.finish();
        self.nodes.extend(nodes);
        y
    }

    /// The output's shape is not inferred; set it through [`Graph::tensor_mut`].
    pub fn rng(&mut self, seed: TensorHandle, offset: TensorHandle, attributes: Rng) -> TensorHandle {
        let mut sub = self.builder();
        let y = sub.rng(attributes, seed, offset);
        let nodes = sub.finish();
        self.nodes.extend(nodes);
        y
    }

    /// The output's layout must be set by the caller before validation.
    pub fn reshape(&mut self, x: TensorHandle, attributes: Reshape) -> TensorHandle {
        let mut sub = self.builder();
        let y = sub.reshape(attributes, x);
        let nodes = sub.finish();
        self.nodes.extend(nodes);
        y
    }

    pub fn softmax(&mut self, p: TensorHandle, attributes: Softmax) -> SoftmaxTensors {
        let s = self.output("S");
        let mut attributes = attributes.with_input(p).with_output(s);
        let stats = if attributes.stats_enabled() {
            let stats = self.output("Stats");
            attributes = attributes.with_stats_output(stats);
            Some(stats)
        } else {
            None
        };
        let (m, zinv) = if attributes.m_zinv_enabled() {
            let m = self.output("M");
            let zinv = self.output("Zinv");
            attributes = attributes.with_m_zinv_outputs(m, zinv);
            (Some(m), Some(zinv))
        } else {
            (None, None)
        };
        self.nodes.push(Node::new(attributes));
        SoftmaxTensors { s, stats, m, zinv }
    }

    /// Returns `[DX, DScale, DBias]`.
    pub fn layernorm_backward(
        &mut self,
        dy: TensorHandle,
        x: TensorHandle,
        scale: TensorHandle,
        mean: TensorHandle,
        inv_variance: TensorHandle,
        attributes: LayerNormBackward,
    ) -> [TensorHandle; 3] {
        use LayerNormBackwardInput::*;
        use LayerNormBackwardOutput::*;

        let dx = self.output("DX");
        let dscale = self.output("DScale");
        let dbias = self.output("DBias");
        let attributes = attributes
            .with_input(DY, dy)
            .with_input(X, x)
            .with_input(Scale, scale)
            .with_input(Mean, mean)
            .with_input(InvVariance, inv_variance)
            .with_output(DX, dx)
            .with_output(DScale, dscale)
            .with_output(DBias, dbias);
        self.nodes.push(Node::new(attributes));
        [dx, dscale, dbias]
    }

    /// Returns `O` and, for training graphs, the softmax `Stats`.
    pub fn scaled_dot_product_flash_attention(
        &mut self,
        q: TensorHandle,
        k: TensorHandle,
        v: TensorHandle,
        attributes: FlashAttention,
    ) -> (TensorHandle, Option<TensorHandle>) {
        let o = match attributes.output(FlashAttentionOutput::O) {
            Some(o) => o,
            None => self.output("O"),
        };
        let mut attributes = attributes
            .with_input(FlashAttentionInput::Q, q)
            .with_input(FlashAttentionInput::K, k)
            .with_input(FlashAttentionInput::V, v)
            .with_output(FlashAttentionOutput::O, o);
        let bound_stats = attributes.output(FlashAttentionOutput::Stats);
        let stats = match (attributes.is_inference(), bound_stats) {
            (_, Some(stats)) => Some(stats),
            (Some(false), None) => {
                let stats = self.tensors.bind(
                    TensorAttributes::new()
                        .with_name("Stats")
                        .with_data_type(DataType::Float),
                );
                attributes = attributes.with_output(FlashAttentionOutput::Stats, stats);
                Some(stats)
            }
            _ => None,
        };
        self.nodes.push(Node::new(attributes));
        (o, stats)
    }

    /// Returns `(dQ, dK, dV)`.
    #[allow(clippy::too_many_arguments)]
    pub fn scaled_dot_product_flash_attention_backward(
        &mut self,
        q: TensorHandle,
        k: TensorHandle,
        v: TensorHandle,
        o: TensorHandle,
        d_o: TensorHandle,
        stats: TensorHandle,
        attributes: FlashAttentionBackward,
    ) -> (TensorHandle, TensorHandle, TensorHandle) {
        use FlashAttentionBackwardInput as In;
        use FlashAttentionBackwardOutput as Out;

        let mut bound = |port: Out, name: &str| match attributes.output(port) {
            Some(tensor) => tensor,
            None => self.tensors.bind(TensorAttributes::new().with_name(name)),
        };
        let dq = bound(Out::DQ, "dQ");
        let dk = bound(Out::DK, "dK");
        let dv = bound(Out::DV, "dV");
        let attributes = attributes
            .with_input(In::Q, q)
            .with_input(In::K, k)
            .with_input(In::V, v)
            .with_input(In::O, o)
            .with_input(In::DO, d_o)
            .with_input(In::Stats, stats)
            .with_output(Out::DQ, dq)
            .with_output(Out::DK, dk)
            .with_output(Out::DV, dv);
        self.nodes.push(Node::new(attributes));
        (dq, dk, dv)
    }

    /// Drive every node through the pipeline, then check the expanded DAG.
    pub fn validate(&mut self) -> Result<()> {
        info!(
            "Validating graph with {} top-level nodes and {} bound tensors",
            self.nodes.len(),
            self.tensors.len()
        );
        for node in self.nodes.iter_mut() {
            node.validate(&mut self.tensors, &self.context)?;
        }
        self.check_dag()
    }

    /// Every tensor has at most one producer and the primitives form no cycle.
    pub fn check_dag(&self) -> Result<()> {
        check_dag(&self.tensors, &self.primitives())
    }

    pub fn workspace_size(&self) -> Result<usize> {
        self.nodes
            .iter()
            .try_fold(0, |total, node| Ok(total + node.workspace_size()?))
    }

    /// Collect every pass-by-value binding, copying engine-owned buffers
    /// into `workspace` on the caller's stream.
    pub fn materialize(
        &self,
        handle: &mut dyn ExecutionHandle,
        device_pointers: &DevicePointerMap,
        workspace: DevicePtr,
    ) -> Result<PassByValueMap> {
        let mut pass_by_value = PassByValueMap::new();
        let mut cursor = WorkspaceCursor::new(workspace);
        for node in &self.nodes {
            let region = cursor.take(node.workspace_size()?);
            node.gather_pass_by_value(handle, device_pointers, &mut pass_by_value, region)?;
        }
        Ok(pass_by_value)
    }

    /// The final primitive DAG in execution order.
    pub fn primitives(&self) -> Vec<&Node> {
        self.nodes.iter().flat_map(|node| node.primitives()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::ErrorCode,
        tensor_op::{OperationKind, PointwiseMode, ReductionMode},
    };

    fn context() -> Context {
        Context::default()
            .set_intermediate_data_type(DataType::Float)
            .set_io_data_type(DataType::Half)
            .set_compute_data_type(DataType::Float)
    }

    fn input(graph: &mut Graph, name: &str, dims: Vec<usize>) -> TensorHandle {
        let strides = crate::tensor_op::util::layout::row_major_strides(&dims);
        graph.tensor(
            TensorAttributes::new()
                .with_name(name)
                .with_dim(dims)
                .with_stride(strides),
        )
    }

    #[test]
    fn softmax_binds_requested_outputs() {
        let mut graph = Graph::new(context());
        let p = input(&mut graph, "P", vec![1, 2, 4, 8]);
        let outputs = graph.softmax(p, Softmax::new().has_stats(true));
        assert!(outputs.stats.is_some());
        assert!(outputs.m.is_none());
        graph.validate().unwrap();

        let kinds: Vec<OperationKind> = graph.primitives().iter().map(|n| n.kind()).collect();
        assert_eq!(kinds[0], OperationKind::Reduction(ReductionMode::Max));
        assert_eq!(
            kinds.last(),
            Some(&OperationKind::Pointwise(PointwiseMode::Div))
        );
        let stats = graph.tensor_attributes(outputs.stats.unwrap()).unwrap();
        assert_eq!(stats.dims(), &[1, 2, 4, 1]);
        assert_eq!(stats.kind(), TensorKind::External);
    }

    #[test]
    fn chained_primitives_share_tensors() {
        let mut graph = Graph::new(context());
        let a = input(&mut graph, "a", vec![1, 4, 8]);
        let b = input(&mut graph, "b", vec![1, 8, 2]);
        let c = graph.matmul(a, b, Matmul::new());
        let e = graph.pointwise(&[c], Pointwise::new(PointwiseMode::Exp));
        graph.validate().unwrap();

        assert_eq!(graph.tensor_attributes(c).unwrap().dims(), &[1, 4, 2]);
        assert_eq!(graph.tensor_attributes(e).unwrap().dims(), &[1, 4, 2]);
        assert_eq!(graph.workspace_size().unwrap(), 0);
        assert_eq!(graph.primitives().len(), 2);
    }

    #[test]
    fn workspace_needs_validation_first() {
        let mut graph = Graph::new(context());
        let x = input(&mut graph, "x", vec![2, 2]);
        graph.pointwise(&[x], Pointwise::new(PointwiseMode::Exp));
        let err = graph.workspace_size().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidState);
    }
}
