use log::debug;

use crate::{
    context::Context,
    error::Result,
    tensor::{DataType, TensorHandle, TensorTable},
    tensor_op::{
        ports::Ports,
        util::layout::{broadcast_dims, row_major_strides},
        Node, NodeOperation, NodeType, OperationKind,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatmulInput {
    A,
    B,
    /// Per-batch row count bounding the logical extent of `A`.
    MOverride,
    /// Per-batch column count bounding the logical extent of `B`.
    NOverride,
    KOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatmulOutput {
    C,
}

/// Batched `C = A · B` over the two innermost dimensions.
#[derive(Debug, Clone)]
pub struct Matmul {
    name: String,
    compute_data_type: DataType,
    ports: Ports<MatmulInput, MatmulOutput>,
}

impl Default for Matmul {
    fn default() -> Self {
        Matmul {
            name: "matmul".to_string(),
            compute_data_type: DataType::NotSet,
            ports: Ports::new(),
        }
    }
}

impl Matmul {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_compute_data_type(mut self, data_type: DataType) -> Self {
        self.compute_data_type = data_type;
        self
    }

    fn with_optional(mut self, port: MatmulInput, tensor: Option<TensorHandle>) -> Self {
        if let Some(tensor) = tensor {
            self.ports.set_input(port, tensor);
        }
        self
    }

    pub fn with_m_override(self, tensor: Option<TensorHandle>) -> Self {
        self.with_optional(MatmulInput::MOverride, tensor)
    }

    pub fn with_n_override(self, tensor: Option<TensorHandle>) -> Self {
        self.with_optional(MatmulInput::NOverride, tensor)
    }

    pub fn with_k_override(self, tensor: Option<TensorHandle>) -> Self {
        self.with_optional(MatmulInput::KOverride, tensor)
    }

    pub fn with_operands(mut self, a: TensorHandle, b: TensorHandle) -> Self {
        self.ports.set_input(MatmulInput::A, a);
        self.ports.set_input(MatmulInput::B, b);
        self
    }

    pub fn with_output(mut self, c: TensorHandle) -> Self {
        self.ports.set_output(MatmulOutput::C, c);
        self
    }

    pub fn input(&self, port: MatmulInput) -> Option<TensorHandle> {
        self.ports.input(port)
    }

    pub fn output(&self) -> Option<TensorHandle> {
        self.ports.output(MatmulOutput::C)
    }
}

impl NodeOperation for Matmul {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Matmul
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
        let a = self.ports.require_input(MatmulInput::A)?;
        let b = self.ports.require_input(MatmulInput::B)?;
        self.ports.require_output(MatmulOutput::C)?;
        self.ports.validate_inputs(table)?;

        let a_dims = table.get(a)?.dims();
        let b_dims = table.get(b)?.dims();
        ensure!(
            a_dims.len() >= 2 && a_dims.len() == b_dims.len(),
            GraphNotSupported,
            "Matmul '{}' operands must share a rank of at least 2, got {:?} and {:?}",
            self.name,
            a_dims,
            b_dims
        );
        let rank = a_dims.len();
        ensure!(
            a_dims[rank - 1] == b_dims[rank - 2],
            GraphNotSupported,
            "Matmul '{}' K dimension mismatch: {:?} x {:?}",
            self.name,
            a_dims,
            b_dims
        );
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

        let a_dims = table.get(self.ports.require_input(MatmulInput::A)?)?.dims().to_vec();
        let b_dims = table.get(self.ports.require_input(MatmulInput::B)?)?.dims().to_vec();
        let c = table.get_mut(self.ports.require_output(MatmulOutput::C)?)?;

        if c.dims().is_empty() {
            let rank = a_dims.len();
            let mut dims = broadcast_dims(&[&a_dims[..rank - 2], &b_dims[..rank - 2]])?;
            dims.push(a_dims[rank - 2]);
            dims.push(b_dims[rank - 1]);
            c.set_dim(dims);
        }
        if c.strides().is_empty() {
            let strides = row_major_strides(c.dims());
            c.set_stride(strides);
        }
        debug!(
            "Matmul '{}' output {:?} with stride {:?}",
            self.name,
            c.dims(),
            c.strides()
        );
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)
    }
}
