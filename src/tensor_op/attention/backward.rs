use log::{debug, info};

use crate::{
    context::Context,
    error::Result,
    tensor::{DataType, TensorAttributes, TensorHandle, TensorKind, TensorTable},
    tensor_op::{
        ports::{check_unit_inner_stride, Ports},
        primitive::{Matmul, Pointwise, Reduction, Reshape, Rng},
        subgraph::Subgraph,
        util::layout::{round_up, row_major_strides},
        Node, NodeOperation, NodeType, OperationKind, PointwiseMode, ReductionMode,
    },
    workspace::{DevicePointerMap, DevicePtr, ExecutionHandle, PassByValue, PassByValueMap},
};

use super::{
    bind_scalar, check_attn_scale, check_bias, check_dropout, check_head_dim,
    check_intermediate_data_type, check_padding, check_rank, dropout_scales, EngineConstants,
    MaskOptions,
};

/// Sequence-length tile the accumulator-free dQ path rounds up to.
pub const DEFAULT_ACCUMULATOR_GRANULARITY: usize = 64;

/// Bytes the accumulator-free dQ path needs: `b · h · ⌈s_q⌉ · ⌈s_kv⌉ · 2`,
/// with both sequence lengths rounded up to `granularity`.
pub fn required_dp_workspace_bytes(
    batch: usize,
    heads: usize,
    seq_len_q: usize,
    seq_len_kv: usize,
    granularity: usize,
) -> u64 {
    let s_q = round_up(seq_len_q, granularity) as u64;
    let s_kv = round_up(seq_len_kv, granularity) as u64;
    batch as u64 * heads as u64 * s_q * s_kv * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlashAttentionBackwardInput {
    Q,
    K,
    V,
    O,
    DO,
    Stats,
    AttnScale,
    Bias,
    SeqLenQ,
    SeqLenKv,
    Seed,
    Offset,
    DropoutMask,
    DropoutScale,
    DropoutScaleInv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlashAttentionBackwardOutput {
    DQ,
    DK,
    DV,
    DBias,
    RngDump,
}

/// Gradients of flash attention with respect to Q, K, V and optionally the bias.
///
/// Probabilities are recomputed from `Stats` instead of being read back from
/// the forward pass.
#[derive(Debug, Clone)]
pub struct FlashAttentionBackward {
    name: String,
    attn_scale_value: Option<f32>,
    dropout_probability: Option<f64>,
    alibi_mask: bool,
    padding_mask: bool,
    causal_mask: bool,
    accumulator_granularity: usize,
    ports: Ports<FlashAttentionBackwardInput, FlashAttentionBackwardOutput>,
    constants: EngineConstants,
}

impl Default for FlashAttentionBackward {
    fn default() -> Self {
        FlashAttentionBackward {
            name: "flash_attention_backward".to_string(),
            attn_scale_value: None,
            dropout_probability: None,
            alibi_mask: false,
            padding_mask: false,
            causal_mask: false,
            accumulator_granularity: DEFAULT_ACCUMULATOR_GRANULARITY,
            ports: Ports::new(),
            constants: EngineConstants::default(),
        }
    }
}

impl FlashAttentionBackward {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_attn_scale(mut self, tensor: TensorHandle) -> Self {
        self.ports
            .set_input(FlashAttentionBackwardInput::AttnScale, tensor);
        self
    }

    pub fn with_attn_scale_value(mut self, value: f32) -> Self {
        self.attn_scale_value = Some(value);
        self
    }

    pub fn with_bias(mut self, bias: TensorHandle) -> Self {
        self.ports.set_input(FlashAttentionBackwardInput::Bias, bias);
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
        self.ports
            .set_input(FlashAttentionBackwardInput::SeqLenQ, seq_len);
        self
    }

    pub fn with_seq_len_kv(mut self, seq_len: TensorHandle) -> Self {
        self.ports
            .set_input(FlashAttentionBackwardInput::SeqLenKv, seq_len);
        self
    }

    pub fn with_dropout(mut self, probability: f64, seed: TensorHandle, offset: TensorHandle) -> Self {
        self.dropout_probability = Some(probability);
        self.ports.set_input(FlashAttentionBackwardInput::Seed, seed);
        self.ports
            .set_input(FlashAttentionBackwardInput::Offset, offset);
        self
    }

    /// Reuse a caller-generated mask. The caller also supplies both scales.
    pub fn with_dropout_mask(
        mut self,
        mask: TensorHandle,
        scale: TensorHandle,
        scale_inv: TensorHandle,
    ) -> Self {
        use FlashAttentionBackwardInput::*;
        self.ports.set_input(DropoutMask, mask);
        self.ports.set_input(DropoutScale, scale);
        self.ports.set_input(DropoutScaleInv, scale_inv);
        self
    }

    /// Sequence tile used when sizing the accumulator-free path.
    pub fn with_accumulator_granularity(mut self, granularity: usize) -> Self {
        self.accumulator_granularity = granularity;
        self
    }

    pub fn with_input(mut self, port: FlashAttentionBackwardInput, tensor: TensorHandle) -> Self {
        self.ports.set_input(port, tensor);
        self
    }

    pub fn with_output(mut self, port: FlashAttentionBackwardOutput, tensor: TensorHandle) -> Self {
        self.ports.set_output(port, tensor);
        self
    }

    pub fn input(&self, port: FlashAttentionBackwardInput) -> Option<TensorHandle> {
        self.ports.input(port)
    }

    pub fn output(&self, port: FlashAttentionBackwardOutput) -> Option<TensorHandle> {
        self.ports.output(port)
    }

    /// Whether dQ can be produced without the FP32 accumulator.
    fn use_workspace_opt(&self, context: &Context, dims: [usize; 4]) -> Result<bool> {
        if !context.capabilities().supports_accumulator_free_backward() {
            return Ok(false);
        }
        let [b, h, s_q, s_kv] = dims;
        let limit = context.workspace_limit()?;
        let required =
            required_dp_workspace_bytes(b, h, s_q, s_kv, self.accumulator_granularity);
        let enabled = limit.allows(required);
        info!(
            "Backward '{}' needs {} bytes for the dQ workspace optimization, limit {:?}: {}",
            self.name,
            required,
            limit,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(enabled)
    }
}

impl NodeOperation for FlashAttentionBackward {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::FlashAttentionBackward
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
        use FlashAttentionBackwardInput::*;
        use FlashAttentionBackwardOutput::*;

        for port in &[Q, K, V, O, DO, Stats] {
            self.ports.require_input(*port)?;
        }
        for port in &[DQ, DK, DV] {
            self.ports.require_output(*port)?;
        }

        check_dropout(
            self.dropout_probability,
            self.ports.has_input(DropoutMask),
        )?;
        if self.dropout_probability.is_some() {
            self.ports.require_input(Seed)?;
            self.ports.require_input(Offset)?;
            ensure!(
                !self.ports.has_input(DropoutScale) && !self.ports.has_input(DropoutScaleInv),
                AttributeNotSet,
                "Dropout scales of '{}' are derived from the dropout probability and cannot also be given",
                self.name
            );
        }
        check_padding(
            self.padding_mask,
            self.ports.has_input(SeqLenQ),
            self.ports.has_input(SeqLenKv),
        )?;
        check_attn_scale(self.ports.has_input(AttnScale), self.attn_scale_value)?;
        check_intermediate_data_type(context)?;
        ensure!(
            self.accumulator_granularity > 0,
            GraphNotSupported,
            "Accumulator granularity of '{}' must be positive",
            self.name
        );

        self.ports.validate_inputs(table)?;
        for port in &[Q, K, V, O, DO] {
            check_rank(table, *port, self.ports.require_input(*port)?)?;
        }
        check_head_dim(table, self.ports.require_input(Q)?)?;
        check_bias(table, self.ports.input(Bias))?;

        for (port, tensor) in self.ports.inputs() {
            check_unit_inner_stride(table, port, Some(tensor))?;
        }
        for (port, tensor) in self.ports.outputs() {
            check_unit_inner_stride(table, port, Some(tensor))?;
        }
        let stats_strides = table.get(self.ports.require_input(Stats)?)?.strides();
        ensure!(
            stats_strides.len() >= 2 && stats_strides[stats_strides.len() - 2..] == [1, 1],
            GraphNotSupported,
            "The two innermost strides of Stats should be 1, got {:?}",
            stats_strides
        );

        if let Some(dbias) = self.ports.output(DBias) {
            ensure!(
                !table.get(dbias)?.dims().is_empty() || self.ports.has_input(Bias),
                AttributeNotSet,
                "dBias of '{}' needs dims when no Bias is bound to take them from",
                self.name
            );
        }
        Ok(())
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        use FlashAttentionBackwardInput::*;
        use FlashAttentionBackwardOutput::*;

        self.ports.fill_from_context(table, context)?;

        let q = self.ports.require_input(Q)?;
        let k = self.ports.require_input(K)?;
        let v = self.ports.require_input(V)?;
        let d_o = self.ports.require_input(DO)?;
        let (b, h, s_q, d) = {
            let dims = table.get(q)?.dims();
            (dims[0], dims[1], dims[2], dims[3])
        };
        let s_kv = table.get(k)?.dims()[2];

        // K and V are consumed transposed.
        table.get_mut(k)?.transpose_last_two();
        table.get_mut(v)?.transpose_last_two();

        if let (Some(dbias), Some(bias)) = (self.ports.output(DBias), self.ports.input(Bias)) {
            if table.get(dbias)?.dims().is_empty() {
                let dims = table.get(bias)?.dims().to_vec();
                table.get_mut(dbias)?.set_dim(dims);
            }
        }

        let use_workspace_opt = self.use_workspace_opt(context, [b, h, s_q, s_kv])?;
        let seq_len_q = self.ports.input(SeqLenQ);
        let seq_len_kv = self.ports.input(SeqLenKv);
        let io_data_type = context.io_data_type();

        let mut constants = EngineConstants::default();
        let mut sub = Subgraph::new(table);

        let one = bind_scalar(&mut sub, "one", DataType::Float);
        constants.one = Some(one);

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

        let (dropout_scale, dropout_scale_inv) = match self.dropout_probability {
            Some(p) => {
                let (scale_value, inv_value) = dropout_scales(p);
                let scale = bind_scalar(&mut sub, "dropout_scale", DataType::Float);
                let inv = bind_scalar(&mut sub, "dropout_scale_inv", DataType::Float);
                constants.dropout_scale = Some((scale, PassByValue::Float(scale_value)));
                constants.dropout_scale_inv = Some((inv, PassByValue::Float(inv_value)));
                (Some(scale), Some(inv))
            }
            None => (
                self.ports.input(DropoutScale),
                self.ports.input(DropoutScaleInv),
            ),
        };

        if !use_workspace_opt {
            let dims = vec![b, h, s_q, d];
            let accum = sub.tensor(
                TensorAttributes::new()
                    .with_name("dQ_accum")
                    .with_stride(row_major_strides(&dims))
                    .with_dim(dims)
                    .with_data_type(DataType::Float)
                    .with_kind(TensorKind::PassByValue),
            );
            let bytes = b * h * s_q * d * DataType::Float.size_in_bytes();
            constants.dq_accum = Some((accum, bytes));
        }

        let dropout_mask = match self.dropout_probability {
            Some(p) => {
                let rng_output = match self.ports.output(RngDump) {
                    Some(dump) => dump,
                    None => sub.tensor(TensorAttributes::virtual_tensor("rng_output")),
                };
                if sub.tensor_mut(rng_output)?.dims().is_empty() {
                    sub.set_dim(rng_output, vec![b, h, s_q, s_kv])?;
                }
                sub.rng_into(
                    Rng::bernoulli(1.0 - p).with_name("rng"),
                    self.ports.require_input(Seed)?,
                    self.ports.require_input(Offset)?,
                    rng_output,
                );
                Some(rng_output)
            }
            None => self.ports.input(DropoutMask),
        };

        // softmax_sum = rowsum(dO * O) scaled by the inverse keep probability.
        let product = sub.pointwise(
            "mul_dO_O",
            PointwiseMode::Mul,
            &[d_o, self.ports.require_input(O)?],
        );
        sub.set_dim(product, vec![b, h, s_q, d])?;
        let row_sum = sub.reduction(
            Reduction::new(ReductionMode::Add).with_name("reduce_dO_O"),
            product,
        );
        sub.set_dim(row_sum, vec![b, h, s_q, 1])?
            .set_stride(row_sum, vec![h * s_q, s_q, 1, 1])?;
        let softmax_sum = sub.pointwise(
            "scale_dropout_inv",
            PointwiseMode::Mul,
            &[row_sum, dropout_scale_inv.unwrap_or(one)],
        );

        // Recompute the probabilities, then dV = Pᵀ · dO.
        let score_dims = vec![b, h, s_q, s_kv];
        let score = sub.matmul(
            Matmul::new()
                .with_name("matmul_Q_KT")
                .with_m_override(seq_len_q)
                .with_n_override(seq_len_kv),
            q,
            k,
        );
        sub.set_dim(score, score_dims.clone())?
            .set_stride(score, row_major_strides(&score_dims))?;
        let mut last = masks.apply(&mut sub, score)?;
        last = sub.pointwise(
            "sub_s_m",
            PointwiseMode::Sub,
            &[last, self.ports.require_input(Stats)?],
        );
        let exp_s = sub.pointwise("exp_s", PointwiseMode::Exp, &[last]);
        last = exp_s;
        if let Some(mask) = dropout_mask {
            last = sub.pointwise("mul_p_dropout_mask", PointwiseMode::Mul, &[last, mask]);
        }
        if let Some(scale) = dropout_scale {
            last = sub.pointwise("mul_p_dropout_scale", PointwiseMode::Mul, &[last, scale]);
        }

        let transposed_dims = vec![b, h, s_kv, s_q];
        let transposed_strides = vec![h * s_q * s_kv, s_q * s_kv, 1, s_kv];
        let p_t = sub.reshape(Reshape::new().with_name("reshape_p"), last);
        sub.set_dim(p_t, transposed_dims.clone())?
            .set_stride(p_t, transposed_strides.clone())?
            .set_data_type(p_t, io_data_type)?;
        sub.matmul_into(
            Matmul::new()
                .with_name("matmul_pT_dO")
                .with_m_override(seq_len_kv)
                .with_k_override(seq_len_q),
            p_t,
            d_o,
            self.ports.require_output(DV)?,
        );

        // dS = (dO · Vᵀ ⊙ mask - softmax_sum) ⊙ P, scaled.
        let d_p = sub.matmul(
            Matmul::new()
                .with_name("matmul_dO_VT")
                .with_m_override(seq_len_q)
                .with_k_override(seq_len_kv),
            d_o,
            v,
        );
        sub.set_dim(d_p, score_dims.clone())?
            .set_stride(d_p, row_major_strides(&score_dims))?;
        last = sub.pointwise(
            "dP_dropout_mask",
            PointwiseMode::Mul,
            &[d_p, dropout_mask.unwrap_or(one)],
        );
        last = sub.pointwise("sub_dP_softmax_sum", PointwiseMode::Sub, &[last, softmax_sum]);
        last = sub.pointwise("mul_dP_exp_s", PointwiseMode::Mul, &[last, exp_s]);
        if let Some(scale) = dropout_scale {
            last = sub.pointwise("mul_dS_dropout_scale", PointwiseMode::Mul, &[last, scale]);
        }
        if let Some(dbias) = self.ports.output(DBias) {
            sub.reduction_into(
                Reduction::new(ReductionMode::Add).with_name("red_dP_dBias"),
                last,
                dbias,
            );
        }
        if let Some(scale) = masks.attn_scale {
            last = sub.pointwise("mul_dS_attn_scale", PointwiseMode::Mul, &[last, scale]);
        }
        let d_s = last;

        // dK = dSᵀ · Q
        let d_s_t = sub.reshape(Reshape::new().with_name("reshape_dS"), d_s);
        sub.set_dim(d_s_t, transposed_dims)?
            .set_stride(d_s_t, transposed_strides)?
            .set_data_type(d_s_t, io_data_type)?;
        sub.matmul_into(
            Matmul::new()
                .with_name("matmul_dST_Q")
                .with_m_override(seq_len_kv)
                .with_k_override(seq_len_q),
            d_s_t,
            q,
            self.ports.require_output(DK)?,
        );

        // dQ = dS · K, through the accumulator unless the workspace path is on.
        let (kt_dims, kt_strides) = {
            let kt = sub.tensor_mut(k)?;
            (kt.dims().to_vec(), kt.strides().to_vec())
        };
        let k_back = sub.reshape(Reshape::new().with_name("reshape_k"), k);
        sub.set_dim(k_back, vec![kt_dims[0], kt_dims[1], kt_dims[3], kt_dims[2]])?
            .set_stride(
                k_back,
                vec![kt_strides[0], kt_strides[1], kt_strides[3], kt_strides[2]],
            )?;
        let d_q = self.ports.require_output(DQ)?;
        let dq_target = constants.dq_accum.map_or(d_q, |(accum, _)| accum);
        sub.matmul_into(
            Matmul::new()
                .with_name("matmul_dS_K")
                .with_m_override(seq_len_q)
                .with_k_override(seq_len_kv),
            d_s,
            k_back,
            dq_target,
        );
        if let Some((accum, _)) = constants.dq_accum {
            sub.pointwise_into(
                Pointwise::new(PointwiseMode::Identity).with_name("identity_dQ"),
                &[accum],
                d_q,
            );
        }

        if !context.capabilities().virtual_softmax_sum() {
            sub.tensor_mut(softmax_sum)?
                .set_kind(TensorKind::PassByValue)
                .set_dim(vec![b, h, s_q, 1])
                .set_data_type(DataType::Float);
            constants.softmax_sum = Some((
                softmax_sum,
                b * h * s_q * DataType::Float.size_in_bytes(),
            ));
        }
        debug!(
            "Backward '{}' expanded with dQ {}",
            self.name,
            if use_workspace_opt {
                "written in place"
            } else {
                "accumulated in FP32"
            }
        );

        self.constants = constants;
        Ok(sub.finish())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        use FlashAttentionBackwardOutput::*;
        for port in &[DQ, DK, DV] {
            check_unit_inner_stride(table, *port, self.ports.output(*port))?;
        }
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
