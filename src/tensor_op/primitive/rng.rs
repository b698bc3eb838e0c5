use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    tensor_op::{ports::Ports, Node, NodeOperation, NodeType, OperationKind, RngDistribution},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RngInput {
    Seed,
    Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RngOutput {
    Y,
}

/// Random mask generation. The output has no operand to infer a shape from,
/// so its dims must be given.
#[derive(Debug, Clone)]
pub struct Rng {
    name: String,
    distribution: RngDistribution,
    ports: Ports<RngInput, RngOutput>,
}

impl Rng {
    /// Mask whose elements are 1 with probability `p`.
    pub fn bernoulli(p: f64) -> Self {
        Rng {
            name: "rng".to_string(),
            distribution: RngDistribution::Bernoulli(p),
            ports: Ports::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_seed(mut self, seed: TensorHandle) -> Self {
        self.ports.set_input(RngInput::Seed, seed);
        self
    }

    pub fn with_offset(mut self, offset: TensorHandle) -> Self {
        self.ports.set_input(RngInput::Offset, offset);
        self
    }

    pub fn with_output(mut self, y: TensorHandle) -> Self {
        self.ports.set_output(RngOutput::Y, y);
        self
    }

    pub fn distribution(&self) -> RngDistribution {
        self.distribution
    }

    pub fn seed(&self) -> Option<TensorHandle> {
        self.ports.input(RngInput::Seed)
    }

    pub fn offset(&self) -> Option<TensorHandle> {
        self.ports.input(RngInput::Offset)
    }
}

impl NodeOperation for Rng {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Rng(self.distribution)
    }

    fn node_type(&self) -> NodeType {
        NodeType::Primitive
    }

    fn inputs(&self) -> Vec<TensorHandle> {
        self.ports.input_handles()
    }

    fn outputs(&self) -> Vec<TensorHandle> {
        self.ports.output_handles()
    }

    fn pre_validate(&self, table: &TensorTable, _context: &Context) -> Result<()> {
        self.ports.require_input(RngInput::Seed)?;
        self.ports.require_input(RngInput::Offset)?;
        self.ports.require_output(RngOutput::Y)?;
        let RngDistribution::Bernoulli(p) = self.distribution;
        ensure!(
            (0.0..=1.0).contains(&p),
            GraphNotSupported,
            "Bernoulli probability of '{}' must lie in [0, 1], got {}",
            self.name,
            p
        );
        self.ports.validate_inputs(table)
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        self.ports.fill_from_context(table, context)?;
        table
            .get_mut(self.ports.require_output(RngOutput::Y)?)?
            .fill_row_major_stride();
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)
    }
}
