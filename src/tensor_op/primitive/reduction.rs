use log::debug;

use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    tensor_op::{
        ports::Ports, util::layout::row_major_strides, Node, NodeOperation, NodeType,
        OperationKind, ReductionMode,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReductionInput {
    X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReductionOutput {
    Y,
}

/// Reduces `X` onto the shape of `Y`; every dimension of `Y` is either kept
/// or collapsed to 1.
#[derive(Debug, Clone)]
pub struct Reduction {
    name: String,
    mode: ReductionMode,
    ports: Ports<ReductionInput, ReductionOutput>,
}

impl Reduction {
    pub fn new(mode: ReductionMode) -> Self {
        Reduction {
            name: "reduction".to_string(),
            mode,
            ports: Ports::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, x: TensorHandle) -> Self {
        self.ports.set_input(ReductionInput::X, x);
        self
    }

    pub fn with_output(mut self, y: TensorHandle) -> Self {
        self.ports.set_output(ReductionOutput::Y, y);
        self
    }

    pub fn mode(&self) -> ReductionMode {
        self.mode
    }
}

impl NodeOperation for Reduction {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Reduction(self.mode)
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
        self.ports.require_input(ReductionInput::X)?;
        self.ports.require_output(ReductionOutput::Y)?;
        self.ports.validate_inputs(table)
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        self.ports.fill_from_context(table, context)?;
        let x_dims = table
            .get(self.ports.require_input(ReductionInput::X)?)?
            .dims()
            .to_vec();
        let y = table.get_mut(self.ports.require_output(ReductionOutput::Y)?)?;
        if y.dims().is_empty() {
            let mut dims = x_dims;
            if let Some(last) = dims.last_mut() {
                *last = 1;
            }
            y.set_dim(dims);
        }
        y.fill_row_major_stride();
        debug!("Reduction '{}' output {:?}", self.name, y.dims());
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)?;
        let x = table.get(self.ports.require_input(ReductionInput::X)?)?;
        let y = table.get(self.ports.require_output(ReductionOutput::Y)?)?;
        ensure!(
            x.dims().len() == y.dims().len()
                && x
                    .dims()
                    .iter()
                    .zip(y.dims())
                    .all(|(&from, &to)| to == from || to == 1),
            GraphNotSupported,
            "Reduction '{}' cannot reduce {:?} to {:?}",
            self.name,
            x.dims(),
            y.dims()
        );
        Ok(())
    }
}
