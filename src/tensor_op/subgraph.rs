use crate::{
    error::Result,
    tensor::{DataType, TensorAttributes, TensorHandle, TensorKind, TensorTable},
};

use super::{
    primitive::{Matmul, Pointwise, Reduction, Reshape, Rng},
    softmax::Softmax,
    operation::NodeOperation,
    Node, PointwiseMode,
};

/// Records the nodes an expansion creates, binding a fresh output tensor for
/// every operation that is not handed one.
pub(crate) struct Subgraph<'a> {
    table: &'a mut TensorTable,
    output_kind: TensorKind,
    nodes: Vec<Node>,
}

impl<'a> Subgraph<'a> {
    /// Builder whose implicit outputs are virtual intermediates.
    pub(crate) fn new(table: &'a mut TensorTable) -> Self {
        Self::with_output_kind(table, TensorKind::Virtual)
    }

    pub(crate) fn with_output_kind(table: &'a mut TensorTable, output_kind: TensorKind) -> Self {
        Subgraph {
            table,
            output_kind,
            nodes: Vec::new(),
        }
    }

    pub(crate) fn tensor(&mut self, attributes: TensorAttributes) -> TensorHandle {
        self.table.bind(attributes)
    }

    fn output(&mut self, name: &str, port: &str) -> TensorHandle {
        self.table.bind(
            TensorAttributes::new()
                .with_name(format!("{}::{}", name, port))
                .with_kind(self.output_kind),
        )
    }

    pub(crate) fn tensor_mut(&mut self, tensor: TensorHandle) -> Result<&mut TensorAttributes> {
        self.table.get_mut(tensor)
    }

    pub(crate) fn set_dim(&mut self, tensor: TensorHandle, dims: Vec<usize>) -> Result<&mut Self> {
        self.table.get_mut(tensor)?.set_dim(dims);
        Ok(self)
    }

    pub(crate) fn set_stride(
        &mut self,
        tensor: TensorHandle,
        strides: Vec<usize>,
    ) -> Result<&mut Self> {
        self.table.get_mut(tensor)?.set_stride(strides);
        Ok(self)
    }

    pub(crate) fn set_data_type(
        &mut self,
        tensor: TensorHandle,
        data_type: DataType,
    ) -> Result<&mut Self> {
        self.table.get_mut(tensor)?.set_data_type(data_type);
        Ok(self)
    }

    pub(crate) fn pointwise(
        &mut self,
        name: &str,
        mode: PointwiseMode,
        inputs: &[TensorHandle],
    ) -> TensorHandle {
        self.pointwise_with(Pointwise::new(mode).with_name(name), inputs)
    }

    pub(crate) fn pointwise_with(
        &mut self,
        attributes: Pointwise,
        inputs: &[TensorHandle],
    ) -> TensorHandle {
        let output = self.output(attributes.name(), "OUT_0");
        self.pointwise_into(attributes, inputs, output);
        output
    }

    pub(crate) fn pointwise_into(
        &mut self,
        attributes: Pointwise,
        inputs: &[TensorHandle],
        output: TensorHandle,
    ) {
        let attributes = inputs
            .iter()
            .fold(attributes, |attributes, input| attributes.with_input(*input))
            .with_output(output);
        self.nodes.push(Node::new(attributes));
    }

    pub(crate) fn matmul(
        &mut self,
        attributes: Matmul,
        a: TensorHandle,
        b: TensorHandle,
    ) -> TensorHandle {
        let output = self.output(attributes.name(), "C");
        self.matmul_into(attributes, a, b, output);
        output
    }

    pub(crate) fn matmul_into(
        &mut self,
        attributes: Matmul,
        a: TensorHandle,
        b: TensorHandle,
        c: TensorHandle,
    ) {
        self.nodes
            .push(Node::new(attributes.with_operands(a, b).with_output(c)));
    }

    pub(crate) fn reduction(&mut self, attributes: Reduction, x: TensorHandle) -> TensorHandle {
        let output = self.output(attributes.name(), "Y");
        self.reduction_into(attributes, x, output);
        output
    }

    pub(crate) fn reduction_into(&mut self, attributes: Reduction, x: TensorHandle, y: TensorHandle) {
        self.nodes
            .push(Node::new(attributes.with_input(x).with_output(y)));
    }

    pub(crate) fn rng(
        &mut self,
        attributes: Rng,
        seed: TensorHandle,
        offset: TensorHandle,
    ) -> TensorHandle {
        let output = self.output(attributes.name(), "Y");
        self.rng_into(attributes, seed, offset, output);
        output
    }

    pub(crate) fn rng_into(
        &mut self,
        attributes: Rng,
        seed: TensorHandle,
        offset: TensorHandle,
        y: TensorHandle,
    ) {
        self.nodes.push(Node::new(
            attributes.with_seed(seed).with_offset(offset).with_output(y),
        ));
    }

    pub(crate) fn reshape(&mut self, attributes: Reshape, x: TensorHandle) -> TensorHandle {
        let output = self.output(attributes.name(), "Y");
        self.nodes
            .push(Node::new(attributes.with_input(x).with_output(output)));
        output
    }

    pub(crate) fn softmax_into(
        &mut self,
        attributes: Softmax,
        p: TensorHandle,
        s: TensorHandle,
        stats: Option<TensorHandle>,
    ) {
        let attributes = attributes.with_input(p).with_output(s);
        let attributes = match stats {
            Some(stats) => attributes.with_stats_output(stats),
            None => attributes,
        };
        self.nodes.push(Node::new(attributes));
    }

    pub(crate) fn finish(self) -> Vec<Node> {
        self.nodes
    }
}
