use log::debug;

use crate::{
    context::Context,
    error::{GraphError, Result},
    tensor::{DataType, TensorHandle, TensorTable},
    tensor_op::{
        ports::Ports,
        util::layout::{broadcast_dims, row_major_strides, stride_order, strides_from_order},
        Node, NodeOperation, NodeType, OperationKind, PointwiseMode,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointwiseInput {
    In0,
    In1,
    In2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointwiseOutput {
    Out0,
}

const INPUT_PORTS: [PointwiseInput; 3] = [
    PointwiseInput::In0,
    PointwiseInput::In1,
    PointwiseInput::In2,
];

/// Elementwise operation over up to three broadcast-compatible operands.
#[derive(Debug, Clone)]
pub struct Pointwise {
    name: String,
    mode: PointwiseMode,
    axis: Option<usize>,
    compute_data_type: DataType,
    ports: Ports<PointwiseInput, PointwiseOutput>,
    /// Operands offered after every port was taken.
    excess_inputs: usize,
}

impl Pointwise {
    pub fn new(mode: PointwiseMode) -> Self {
        Pointwise {
            name: mode.to_string().to_lowercase(),
            mode,
            axis: None,
            compute_data_type: DataType::NotSet,
            ports: Ports::new(),
            excess_inputs: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Axis along which GEN_INDEX enumerates.
    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = Some(axis);
        self
    }

    pub fn with_compute_data_type(mut self, data_type: DataType) -> Self {
        self.compute_data_type = data_type;
        self
    }

    /// Bind the next free operand port. A fourth operand fails validation.
    pub fn with_input(mut self, tensor: TensorHandle) -> Self {
        match INPUT_PORTS.iter().find(|port| !self.ports.has_input(**port)) {
            Some(port) => self.ports.set_input(*port, tensor),
            None => self.excess_inputs += 1,
        }
        self
    }

    pub fn with_output(mut self, tensor: TensorHandle) -> Self {
        self.ports.set_output(PointwiseOutput::Out0, tensor);
        self
    }

    pub fn mode(&self) -> PointwiseMode {
        self.mode
    }

    pub fn axis(&self) -> Option<usize> {
        self.axis
    }

    pub fn compute_data_type(&self) -> DataType {
        self.compute_data_type
    }

    pub fn input(&self, port: PointwiseInput) -> Option<TensorHandle> {
        self.ports.input(port)
    }

    pub fn output(&self) -> Option<TensorHandle> {
        self.ports.output(PointwiseOutput::Out0)
    }

    /// Broadcast the operand shapes into the output and keep the stride order
    /// of the first operand with the same shape. Already resolved properties
    /// are left alone.
    pub(crate) fn infer_output(&self, table: &mut TensorTable) -> Result<()> {
        let output = self.ports.require_output(PointwiseOutput::Out0)?;
        let operands = self
            .ports
            .inputs()
            .map(|(_, handle)| table.get(handle).map(|t| (t.dims().to_vec(), t.strides().to_vec())))
            .collect::<Result<Vec<_>>>()?;

        if table.get(output)?.dims().is_empty() {
            let dims = if self.mode == PointwiseMode::GenIndex {
                operands.first().map(|(dims, _)| dims.clone()).unwrap_or_default()
            } else {
                let shapes = operands.iter().map(|(dims, _)| dims.as_slice()).collect::<Vec<_>>();
                broadcast_dims(&shapes)?
            };
            table.get_mut(output)?.set_dim(dims);
        }

        let out = table.get_mut(output)?;
        if out.strides().is_empty() {
            let dims = out.dims().to_vec();
            let strides = match operands.iter().find(|(operand, _)| *operand == dims) {
                Some((_, operand_strides)) if operand_strides.len() == dims.len() => {
                    strides_from_order(&dims, &stride_order(operand_strides))
                }
                _ => row_major_strides(&dims),
            };
            out.set_stride(strides);
        }
        debug!(
            "Pointwise '{}' output {:?} with stride {:?}",
            self.name,
            out.dims(),
            out.strides()
        );
        Ok(())
    }
}

impl NodeOperation for Pointwise {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Pointwise(self.mode)
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
        ensure!(
            self.excess_inputs == 0,
            InvalidValue,
            "Pointwise '{}' takes at most {} operands, got {}",
            self.name,
            INPUT_PORTS.len(),
            INPUT_PORTS.len() + self.excess_inputs
        );
        let arity = self.mode.arity();
        for port in &INPUT_PORTS[..arity] {
            self.ports.require_input(*port)?;
        }
        ensure!(
            self.ports.inputs().count() == arity,
            GraphNotSupported,
            "Pointwise {} takes {} operands, got {}",
            self.mode.to_string(),
            arity,
            self.ports.inputs().count()
        );
        self.ports.require_output(PointwiseOutput::Out0)?;
        self.ports.validate_inputs(table)?;

        if self.mode == PointwiseMode::GenIndex {
            let axis = self.axis.ok_or_else(|| {
                GraphError::AttributeNotSet(format!(
                    "GEN_INDEX '{}' requires an axis",
                    self.name
                ))
            })?;
            let rank = table.get(self.ports.require_input(PointwiseInput::In0)?)?.dims().len();
            ensure!(
                axis < rank,
                GraphNotSupported,
                "GEN_INDEX axis {} out of range for rank {}",
                axis,
                rank
            );
        }
        Ok(())
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        self.ports.fill_from_context(table, context)?;
        if !self.compute_data_type.is_set() {
            self.compute_data_type = context.compute_data_type();
        }
        self.infer_output(table)?;
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)
    }
}
