use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    tensor_op::{ports::Ports, Node, NodeOperation, NodeType, OperationKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReshapeInput {
    X,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReshapeOutput {
    Y,
}

/// Reinterprets the layout of `X`. The caller decides the output shape.
#[derive(Debug, Clone)]
pub struct Reshape {
    name: String,
    ports: Ports<ReshapeInput, ReshapeOutput>,
}

impl Default for Reshape {
    fn default() -> Self {
        Reshape {
            name: "reshape".to_string(),
            ports: Ports::new(),
        }
    }
}

impl Reshape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, x: TensorHandle) -> Self {
        self.ports.set_input(ReshapeInput::X, x);
        self
    }

    pub fn with_output(mut self, y: TensorHandle) -> Self {
        self.ports.set_output(ReshapeOutput::Y, y);
        self
    }
}

impl NodeOperation for Reshape {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Reshape
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
        self.ports.require_input(ReshapeInput::X)?;
        self.ports.require_output(ReshapeOutput::Y)?;
        self.ports.validate_inputs(table)
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        _context: &Context,
    ) -> Result<Vec<Node>> {
        let data_type = table
            .get(self.ports.require_input(ReshapeInput::X)?)?
            .data_type();
        let y = table.get_mut(self.ports.require_output(ReshapeOutput::Y)?)?;
        if !y.data_type().is_set() {
            y.set_data_type(data_type);
        }
        y.fill_row_major_stride();
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)?;
        let x = table.get(self.ports.require_input(ReshapeInput::X)?)?;
        let y = table.get(self.ports.require_output(ReshapeOutput::Y)?)?;
        ensure!(
            x.volume() == y.volume(),
            GraphNotSupported,
            "Reshape '{}' changes the element count: {:?} to {:?}",
            self.name,
            x.dims(),
            y.dims()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::ErrorCode,
        tensor::{DataType, TensorAttributes},
    };

    #[test]
    fn keeps_element_type_and_volume() {
        let mut table = TensorTable::new();
        let x = table.bind(
            TensorAttributes::new()
                .with_dim(vec![2, 4, 64, 128])
                .with_stride(vec![32768, 8192, 1, 64])
                .with_data_type(DataType::Half),
        );
        let y = table.bind(
            TensorAttributes::virtual_tensor("kt")
                .with_dim(vec![2, 4, 128, 64])
                .with_stride(vec![32768, 8192, 64, 1]),
        );
        let mut op = Reshape::new().with_input(x).with_output(y);
        op.expand_and_infer_properties(&mut table, &Context::default())
            .unwrap();
        op.post_validate(&table).unwrap();
        assert_eq!(table.get(y).unwrap().data_type(), DataType::Half);

        let z = table.bind(TensorAttributes::virtual_tensor("z").with_dim(vec![2, 4, 128]));
        let mut op = Reshape::new().with_input(x).with_output(z);
        op.expand_and_infer_properties(&mut table, &Context::default())
            .unwrap();
        assert_eq!(
            op.post_validate(&table).unwrap_err().code(),
            ErrorCode::GraphNotSupported
        );
    }
}
