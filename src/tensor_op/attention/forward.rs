use log::debug;

use crate::{
    context::Context,
    error::{GraphError, Result},
    tensor::{DataType, TensorAttributes, TensorHandle, TensorTable},
    tensor_op::{
        ports::{check_unit_inner_stride, Ports},
        primitive::{Matmul, Rng},
        softmax::Softmax,
        subgraph::Subgraph,
        util::layout::row_major_strides,
        Node, NodeOperation, NodeType, OperationKind, PointwiseMode,
    },
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValue, PassByValueMap},
};

use super::{
    bind_scalar, check_attn_scale, check_bias, check_dropout, check_head_dim,
    check_intermediate_data_type, check_padding, check_rank, dropout_scales, EngineConstants,
    MaskOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlashAttentionInput {
    Q,
    K,
    V,
    AttnScale,
    Bias,
    SeqLenQ,
    SeqLenKv,
    Seed,
    Offset,
    DropoutMask,
    DropoutScale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlashAttentionOutput {
    O,
    Stats,
    RngDump,
}

/// `O = softmax(mask(Q·Kᵀ)) · V`, optionally with dropout on the probabilities.
#[derive(Debug, Clone)]
pub struct FlashAttention {
    name: String,
    is_inference: Option<bool>,
    attn_scale_value: Option<f32>,
    dropout_probability: Option<f64>,
    alibi_mask: bool,
    padding_mask: bool,
    causal_mask: bool,
    ports: Ports<FlashAttentionInput, FlashAttentionOutput>,
    constants: EngineConstants,
}

impl Default for FlashAttention {
    fn default() -> Self {
        FlashAttention {
            name: "flash_attention".to_string(),
            is_inference: None,
            attn_scale_value: None,
            dropout_probability: None,
            alibi_mask: false,
            padding_mask: false,
            causal_mask: false,
            ports: Ports::new(),
            constants: EngineConstants::default(),
        }
    }
}

impl FlashAttention {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Inference skips the user-visible `Stats` output.
    pub fn with_is_inference(mut self, value: bool) -> Self {
        self.is_inference = Some(value);
        self
    }

    pub fn with_attn_scale(mut self, tensor: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionInput::AttnScale, tensor);
        self
    }

    pub fn with_attn_scale_value(mut self, value: f32) -> Self {
        self.attn_scale_value = Some(value);
        self
    }

    pub fn with_bias(mut self, bias: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionInput::Bias, bias);
        self
    }

    pub fn with_alibi_mask(mut self, value: bool) -> Self {
        self.alibi_mask = value;
        self
    }

    pub fn with_padding_mask(mut self, value: bool) -> Self {
        self.padding_mask = value;
        self
    }

    pub fn with_causal_mask(mut self, value: bool) -> Self {
        self.causal_mask = value;
        self
    }

    pub fn with_seq_len_q(mut self, seq_len: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionInput::SeqLenQ, seq_len);
        self
    }

    pub fn with_seq_len_kv(mut self, seq_len: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionInput::SeqLenKv, seq_len);
        self
    }

    /// Generate the dropout mask from `probability`, seeded by `seed` and `offset`.
    pub fn with_dropout(mut self, probability: f64, seed: TensorHandle, offset: TensorHandle) -> Self {
        self.dropout_probability = Some(probability);
        self.ports.set_input(FlashAttentionInput::Seed, seed);
        self.ports.set_input(FlashAttentionInput::Offset, offset);
        self
    }

    /// Apply a caller-generated dropout mask and scale.
    pub fn with_dropout_mask(mut self, mask: TensorHandle, scale: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionInput::DropoutMask, mask);
        self.ports.set_input(FlashAttentionInput::DropoutScale, scale);
        self
    }

    pub fn with_input(mut self, port: FlashAttentionInput, tensor: TensorHandle) -> Self {
        self.ports.set_input(port, tensor);
        self
    }

    pub fn with_output(mut self, port: FlashAttentionOutput, tensor: TensorHandle) -> Self {
        self.ports.set_output(port, tensor);
        self
    }

    pub fn input(&self, port: FlashAttentionInput) -> Option<TensorHandle> {
        self.ports.input(port)
    }

    pub fn output(&self, port: FlashAttentionOutput) -> Option<TensorHandle> {
        self.ports.output(port)
    }

    pub fn is_inference(&self) -> Option<bool> {
        self.is_inference
    }

    pub fn dropout_probability(&self) -> Option<f64> {
        self.dropout_probability
    }

    /// Dropout survives unless the probability is exactly zero and the
    /// backend can drop the RNG.
    fn dropout_present(&self, context: &Context) -> bool {
        match self.dropout_probability {
            Some(p) => !(p == 0.0 && context.capabilities().elides_zero_probability_dropout()),
            None => self.ports.has_input(FlashAttentionInput::DropoutMask),
        }
    }
}

impl NodeOperation for FlashAttention {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::FlashAttention
    }

    fn node_type(&self) -> NodeType {
        NodeType::Composite
    }

    fn inputs(&self) -> Vec<TensorHandle> {
        self.ports.input_handles()
    }

    fn outputs(&self) -> Vec<TensorHandle> {
        self.ports.output_handles()
    }

    fn pre_validate(&self, table: &TensorTable, context: &Context) -> Result<()> {
        use FlashAttentionInput::*;

        for port in &[Q, K, V] {
            self.ports.require_input(*port)?;
        }
        self.ports.require_output(FlashAttentionOutput::O)?;
        let is_inference = self.is_inference.ok_or_else(|| {
            GraphError::AttributeNotSet(format!(
                "is_inference attribute not set for '{}'",
                self.name
            ))
        })?;
        ensure!(
            is_inference || self.ports.has_output(FlashAttentionOutput::Stats),
            AttributeNotSet,
            "Stats output not set for training step of '{}'",
            self.name
        );

        check_dropout(
            self.dropout_probability,
            self.ports.has_input(DropoutMask),
        )?;
        if self.dropout_probability.is_some() {
            self.ports.require_input(Seed)?;
            self.ports.require_input(Offset)?;
        }
        check_padding(
            self.padding_mask,
            self.ports.has_input(SeqLenQ),
            self.ports.has_input(SeqLenKv),
        )?;
        check_attn_scale(self.ports.has_input(AttnScale), self.attn_scale_value)?;
        check_intermediate_data_type(context)?;

        self.ports.validate_inputs(table)?;
        for port in &[Q, K, V] {
            check_rank(table, *port, self.ports.require_input(*port)?)?;
        }
        check_head_dim(table, self.ports.require_input(Q)?)?;
        check_head_dim(table, self.ports.require_input(V)?)?;
        check_bias(table, self.ports.input(Bias))?;

        for (port, tensor) in self.ports.inputs() {
            check_unit_inner_stride(table, port, Some(tensor))?;
        }
        for (port, tensor) in self.ports.outputs() {
            check_unit_inner_stride(table, port, Some(tensor))?;
        }
        Ok(())
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        use FlashAttentionInput::*;
        use FlashAttentionOutput::*;

        if let Some(stats) = self.ports.output(Stats) {
            let stats = table.get_mut(stats)?;
            if !stats.data_type().is_set() {
                stats.set_data_type(DataType::Float);
            }
        }
        self.ports.fill_from_context(table, context)?;

        let q = self.ports.require_input(Q)?;
        let k = self.ports.require_input(K)?;
        let v = self.ports.require_input(V)?;
        let o = self.ports.require_output(O)?;
        let (b, h, s_q, q_data_type) = {
            let q = table.get(q)?;
            let dims = q.dims();
            (dims[0], dims[1], dims[2], q.data_type())
        };
        let s_kv = table.get(k)?.dims()[2];
        let d_v = table.get(v)?.dims()[3];

        // The backend consumes K transposed.
        table.get_mut(k)?.transpose_last_two();

        let seq_len_q = self.ports.input(SeqLenQ);
        let seq_len_kv = self.ports.input(SeqLenKv);
        let dropout_present = self.dropout_present(context);
        debug!(
            "Flash attention '{}': b={} h={} s_q={} s_kv={} d_v={} dropout={}",
            self.name, b, h, s_q, s_kv, d_v, dropout_present
        );

        let mut constants = EngineConstants::default();
        let mut sub = Subgraph::new(table);

        let score_dims = vec![b, h, s_q, s_kv];
        let score = sub.matmul(
            Matmul::new()
                .with_name("bmm1")
                .with_m_override(seq_len_q)
                .with_n_override(seq_len_kv),
            q,
            k,
        );
        sub.set_dim(score, score_dims.clone())?
            .set_stride(score, row_major_strides(&score_dims))?;

        let masks = constants.score_masks(
            &mut sub,
            &MaskOptions {
                attn_scale: self.ports.input(AttnScale),
                attn_scale_value: self.attn_scale_value,
                bias: self.ports.input(Bias),
                alibi_heads: if self.alibi_mask { Some(h) } else { None },
                padding: seq_len_q.zip(seq_len_kv).filter(|_| self.padding_mask),
                causal: self.causal_mask,
            },
        );
        let masked = masks.apply(&mut sub, score)?;

        let probabilities = sub.tensor(TensorAttributes::virtual_tensor("softmax_output"));
        let stats = match self.ports.output(Stats) {
            Some(stats) => stats,
            None => sub.tensor(TensorAttributes::virtual_tensor("softmax_stats")),
        };
        sub.softmax_into(
            Softmax::new().with_name("softmax").has_stats(true),
            masked,
            probabilities,
            Some(stats),
        );
        let mut last = probabilities;

        if dropout_present {
            let mask = match self.dropout_probability {
                Some(p) => {
                    let rng_output = match self.ports.output(RngDump) {
                        Some(dump) => dump,
                        None => sub.tensor(TensorAttributes::virtual_tensor("rng_output")),
                    };
                    if sub.tensor_mut(rng_output)?.dims().is_empty() {
                        sub.set_dim(rng_output, score_dims.clone())?;
                    }
                    sub.rng_into(
                        Rng::bernoulli(1.0 - p).with_name("rng"),
                        self.ports.require_input(Seed)?,
                        self.ports.require_input(Offset)?,
                        rng_output,
                    );
                    rng_output
                }
                None => self.ports.require_input(DropoutMask)?,
            };
            last = sub.pointwise("dropout_mask_mul", PointwiseMode::Mul, &[last, mask]);

            let scale = match self.dropout_probability {
                Some(p) => {
                    let data_type = if context.capabilities().float_dropout_scale() {
                        DataType::Float
                    } else {
                        q_data_type
                    };
                    let scale = bind_scalar(&mut sub, "dropout_scale", data_type);
                    let (value, _) = dropout_scales(p);
                    constants.dropout_scale = Some((scale, PassByValue::scalar(value, data_type)));
                    Some(scale)
                }
                None => self.ports.input(DropoutScale),
            };
            if let Some(scale) = scale {
                last = sub.pointwise("dropout_scale", PointwiseMode::Mul, &[last, scale]);
            }
        }

        // bmm2 takes its A operand in the io type.
        sub.set_data_type(last, q_data_type)?;

        {
            let output = sub.tensor_mut(o)?;
            if output.dims().is_empty() {
                output.set_dim(vec![b, h, s_q, d_v]);
            }
            output.fill_row_major_stride();
        }
        sub.matmul_into(
            Matmul::new()
                .with_name("bmm2")
                .with_m_override(seq_len_q)
                .with_k_override(seq_len_kv),
            last,
            v,
            o,
        );

        self.constants = constants;
        Ok(sub.finish())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        check_unit_inner_stride(
            table,
            FlashAttentionOutput::O,
            self.ports.output(FlashAttentionOutput::O),
        )?;
        self.ports.validate_outputs(table)
    }

    fn workspace_size(&self) -> usize {
        self.constants.workspace_size()
    }

    fn pass_by_value_tensors(
        &self,
        handle: &mut dyn ExecutionHandle,
        _device_pointers: &DevicePointerMap,
        pass_by_value: &mut PassByValueMap,
        workspace: DevicePtr,
    ) -> Result<()> {
        self.constants.materialize(handle, pass_by_value, workspace)
    }
}
