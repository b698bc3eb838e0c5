use log::debug;

use crate::{
    context::Context,
    error::Result,
    tensor::{DataType, TensorAttributes, TensorHandle, TensorTable},
    tensor_op::{
        ports::Ports, util::layout::nhwc_strides, Node, NodeOperation, NodeType, OperationKind,
    },
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValue, PassByValueMap},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerNormBackwardInput {
    X,
    DY,
    Scale,
    Mean,
    InvVariance,
    Epsilon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerNormBackwardOutput {
    DX,
    DScale,
    DBias,
}

/// Gradient of layer normalization with respect to its input, scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNormBackward {
    name: String,
    compute_data_type: DataType,
    ports: Ports<LayerNormBackwardInput, LayerNormBackwardOutput>,
    epsilon: Option<TensorHandle>,
}

impl Default for LayerNormBackward {
    fn default() -> Self {
        LayerNormBackward {
            name: "layernorm_backward".to_string(),
            compute_data_type: DataType::NotSet,
            ports: Ports::new(),
            epsilon: None,
        }
    }
}

impl LayerNormBackward {
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

    pub fn with_input(mut self, port: LayerNormBackwardInput, tensor: TensorHandle) -> Self {
        self.ports.set_input(port, tensor);
        self
    }

    pub fn with_output(mut self, port: LayerNormBackwardOutput, tensor: TensorHandle) -> Self {
        self.ports.set_output(port, tensor);
        self
    }

    pub fn input(&self, port: LayerNormBackwardInput) -> Option<TensorHandle> {
        self.ports.input(port)
    }

    pub fn output(&self, port: LayerNormBackwardOutput) -> Option<TensorHandle> {
        self.ports.output(port)
    }
}

/// Fill a missing shape, then a missing stride in channels-last order.
fn infer_like(tensor: &mut TensorAttributes, dims: &[usize]) {
    if tensor.dims().is_empty() {
        tensor.set_dim(dims.to_vec());
    }
    if tensor.strides().is_empty() {
        let strides = nhwc_strides(tensor.dims());
        tensor.set_stride(strides);
    }
}

impl NodeOperation for LayerNormBackward {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::LayerNormBackward
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
        use LayerNormBackwardInput::*;
        use LayerNormBackwardOutput::*;

        for port in &[X, DY, Scale, Mean, InvVariance] {
            self.ports.require_input(*port)?;
        }
        for port in &[DX, DScale, DBias] {
            self.ports.require_output(*port)?;
        }
        let x = table.get(self.ports.require_input(X)?)?;
        ensure!(
            !x.dims().is_empty() && x.strides().len() == x.dims().len(),
            AttributeNotSet,
            "Layer-norm backward '{}' infers from X, which needs dims and stride",
            self.name
        );
        Ok(())
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        use LayerNormBackwardInput::*;
        use LayerNormBackwardOutput::*;

        self.ports.fill_from_context(table, context)?;
        if !self.compute_data_type.is_set() {
            self.compute_data_type = context.compute_data_type();
        }

        let x_dims = table.get(self.ports.require_input(X)?)?.dims().to_vec();
        infer_like(table.get_mut(self.ports.require_input(DY)?)?, &x_dims);
        infer_like(table.get_mut(self.ports.require_output(DX)?)?, &x_dims);

        let mut scale_bias_dims = x_dims;
        if let Some(batch) = scale_bias_dims.first_mut() {
            *batch = 1;
        }
        infer_like(table.get_mut(self.ports.require_output(DScale)?)?, &scale_bias_dims);
        infer_like(table.get_mut(self.ports.require_output(DBias)?)?, &scale_bias_dims);
        debug!(
            "Layer-norm backward '{}' scale/bias gradients {:?}",
            self.name, scale_bias_dims
        );

        if context.capabilities().layernorm_backward_takes_epsilon() {
            let epsilon = table.bind(TensorAttributes::scalar_constant(
                format!("{}::epsilon", self.name),
                DataType::Float,
            ));
            self.ports.set_input(Epsilon, epsilon);
            self.epsilon = Some(epsilon);
        }
        Ok(Vec::new())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)
    }

    fn pass_by_value_tensors(
        &self,
        _handle: &mut dyn ExecutionHandle,
        _device_pointers: &DevicePointerMap,
        pass_by_value: &mut PassByValueMap,
        _workspace: DevicePtr,
    ) -> Result<()> {
        // Epsilon is ignored by the engine below 8906.
        if let Some(epsilon) = self.epsilon {
            pass_by_value.insert(epsilon, PassByValue::Float(0.0));
        }
        Ok(())
    }
}
