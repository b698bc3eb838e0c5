//! Scaled dot-product flash attention, forward and backward.
//!
//! Both directions expand into the same score chain: `Q·Kᵀ`, then the
//! optional scale, bias, ALiBi, padding and causal stages in that order.

mod backward;
mod forward;
mod score;

use std::fmt::Debug;

use log::debug;

use crate::{
    context::Context,
    error::Result,
    tensor::{DataType, TensorAttributes, TensorHandle, TensorKind, TensorTable},
    tensor_op::subgraph::Subgraph,
    utility::{alibi_slopes, host_bytes, negative_infinity},
    workspace::{DevicePtr, ExecutionHandle, PassByValue, PassByValueMap, WorkspaceCursor},
};

use score::{PaddingMask, ScoreMasks};

pub use backward::{
    required_dp_workspace_bytes, FlashAttentionBackward, FlashAttentionBackwardInput,
    FlashAttentionBackwardOutput, DEFAULT_ACCUMULATOR_GRANULARITY,
};
pub use forward::{FlashAttention, FlashAttentionInput, FlashAttentionOutput};

/// Largest supported embedding width per head.
pub const MAX_HEAD_DIM: usize = 128;

fn check_rank<P: Debug>(table: &TensorTable, port: P, tensor: TensorHandle) -> Result<()> {
    let dims = table.get(tensor)?.dims();
    ensure!(
        dims.len() == 4,
        GraphNotSupported,
        "{:?} must be {{batch, heads, sequence, embedding}}, got {:?}",
        port,
        dims
    );
    Ok(())
}

fn check_head_dim(table: &TensorTable, q: TensorHandle) -> Result<()> {
    let hidden_dim = table.get(q)?.dims()[3];
    ensure!(
        hidden_dim <= MAX_HEAD_DIM && hidden_dim % 8 == 0,
        GraphNotSupported,
        "Embedding width per head must be at most {} and a multiple of 8, got {}",
        MAX_HEAD_DIM,
        hidden_dim
    );
    Ok(())
}

fn check_dropout(probability: Option<f64>, has_mask: bool) -> Result<()> {
    ensure!(
        !(probability.is_some() && has_mask),
        AttributeNotSet,
        "Using both a custom dropout mask and internal mask generation from a dropout probability is ill-formed"
    );
    if let Some(p) = probability {
        ensure!(
            p != 1.0,
            AttributeNotSet,
            "Dropout probability cannot be 1 as the corresponding scale is not well formed"
        );
        ensure!(
            (0.0..1.0).contains(&p),
            GraphNotSupported,
            "Dropout probability must lie in [0, 1), got {}",
            p
        );
    }
    Ok(())
}

fn check_padding(padding_mask: bool, has_seq_len_q: bool, has_seq_len_kv: bool) -> Result<()> {
    ensure!(
        !padding_mask || (has_seq_len_q && has_seq_len_kv),
        AttributeNotSet,
        "Padding mask requires seq_len_q and seq_len_kv to be set"
    );
    ensure!(
        padding_mask || !(has_seq_len_q || has_seq_len_kv),
        AttributeNotSet,
        "seq_len_q and seq_len_kv need to be set only if the padding mask is enabled"
    );
    Ok(())
}

fn check_attn_scale(has_tensor: bool, value: Option<f32>) -> Result<()> {
    ensure!(
        !(has_tensor && value.is_some()),
        AttributeNotSet,
        "attn_scale as a tensor and as a value cannot be set at the same time"
    );
    Ok(())
}

fn check_bias(table: &TensorTable, bias: Option<TensorHandle>) -> Result<()> {
    if let Some(bias) = bias {
        ensure!(
            table.get(bias)?.data_type() != DataType::Boolean,
            GraphNotSupported,
            "Attention bias data type cannot be boolean"
        );
    }
    Ok(())
}

fn check_intermediate_data_type(context: &Context) -> Result<()> {
    ensure!(
        context.intermediate_data_type().is_set(),
        AttributeNotSet,
        "Intermediate tensor data type needs to be set as internal tensors require it"
    );
    Ok(())
}

/// Scale applied after dropout and its inverse, `1 / (1 - p)` and `1 - p`.
fn dropout_scales(probability: f64) -> (f32, f32) {
    ((1.0 / (1.0 - probability)) as f32, (1.0 - probability) as f32)
}

/// Caller choices that decide which score stages are built.
#[derive(Debug, Clone, Copy, Default)]
struct MaskOptions {
    attn_scale: Option<TensorHandle>,
    attn_scale_value: Option<f32>,
    bias: Option<TensorHandle>,
    alibi_heads: Option<usize>,
    /// `SEQ_LEN_Q` and `SEQ_LEN_KV`.
    padding: Option<(TensorHandle, TensorHandle)>,
    causal: bool,
}

/// Tensors whose contents the engine supplies at materialization, together
/// with what it needs to fill them.
#[derive(Debug, Clone, Default)]
struct EngineConstants {
    one: Option<TensorHandle>,
    attn_scale: Option<(TensorHandle, f32)>,
    /// Slope buffer and the head count it is computed for.
    alibi_slopes: Option<(TensorHandle, usize)>,
    negative_inf_padding: Option<TensorHandle>,
    negative_inf_causal: Option<TensorHandle>,
    dropout_scale: Option<(TensorHandle, PassByValue)>,
    dropout_scale_inv: Option<(TensorHandle, PassByValue)>,
    /// Zero-initialized FP32 accumulator and its size in bytes.
    dq_accum: Option<(TensorHandle, usize)>,
    softmax_sum: Option<(TensorHandle, usize)>,
}

fn bind_scalar(sub: &mut Subgraph<'_>, name: &str, data_type: DataType) -> TensorHandle {
    sub.tensor(TensorAttributes::scalar_constant(name, data_type))
}

impl EngineConstants {
    /// Bind the constants the enabled score stages read and wire them up.
    fn score_masks(&mut self, sub: &mut Subgraph<'_>, options: &MaskOptions) -> ScoreMasks {
        let attn_scale = match (options.attn_scale, options.attn_scale_value) {
            (Some(tensor), _) => Some(tensor),
            (None, Some(value)) => {
                let tensor = bind_scalar(sub, "attn_scale", DataType::Float);
                self.attn_scale = Some((tensor, value));
                Some(tensor)
            }
            (None, None) => None,
        };

        let alibi = options.alibi_heads.map(|heads| {
            let tensor = sub.tensor(
                TensorAttributes::new()
                    .with_name("alibi_slopes")
                    .with_dim(vec![1, heads, 1, 1])
                    .with_stride(vec![heads, 1, 1, 1])
                    .with_data_type(DataType::Float)
                    .with_kind(TensorKind::PassByValue),
            );
            self.alibi_slopes = Some((tensor, heads));
            tensor
        });

        let padding = match options.padding {
            Some((seq_len_q, seq_len_kv)) => {
                let negative_inf = bind_scalar(sub, "negative_inf_padding", DataType::Float);
                self.negative_inf_padding = Some(negative_inf);
                Some(PaddingMask {
                    seq_len_q,
                    seq_len_kv,
                    negative_inf,
                })
            }
            None => None,
        };

        let causal = if options.causal {
            let negative_inf = bind_scalar(sub, "negative_inf_causal", DataType::Float);
            self.negative_inf_causal = Some(negative_inf);
            Some(negative_inf)
        } else {
            None
        };

        ScoreMasks {
            attn_scale,
            bias: options.bias,
            alibi_slopes: alibi,
            padding,
            causal,
        }
    }

    fn workspace_size(&self) -> usize {
        let alibi = self
            .alibi_slopes
            .map_or(0, |(_, heads)| heads * DataType::Float.size_in_bytes());
        let dq_accum = self.dq_accum.map_or(0, |(_, bytes)| bytes);
        let softmax_sum = self.softmax_sum.map_or(0, |(_, bytes)| bytes);
        alibi + dq_accum + softmax_sum
    }

    /// Record every constant in declaration order. Buffers are laid out
    /// back to back from `workspace`.
    fn materialize(
        &self,
        handle: &mut dyn ExecutionHandle,
        pass_by_value: &mut PassByValueMap,
        workspace: DevicePtr,
    ) -> Result<()> {
        let mut cursor = WorkspaceCursor::new(workspace);

        if let Some(one) = self.one {
            pass_by_value.insert(one, PassByValue::Float(1.0));
        }
        if let Some((tensor, value)) = self.attn_scale {
            pass_by_value.insert(tensor, PassByValue::Float(value));
        }
        if let Some((tensor, heads)) = self.alibi_slopes {
            let bytes = host_bytes(&alibi_slopes(heads));
            let region = cursor.take(bytes.len());
            handle.copy_host_to_device_async(region, &bytes)?;
            pass_by_value.insert(tensor, PassByValue::Buffer(region));
        }
        for tensor in self
            .negative_inf_padding
            .iter()
            .chain(self.negative_inf_causal.iter())
        {
            pass_by_value.insert(*tensor, PassByValue::Float(negative_infinity()));
        }
        for (tensor, value) in self
            .dropout_scale
            .iter()
            .chain(self.dropout_scale_inv.iter())
        {
            pass_by_value.insert(*tensor, *value);
        }
        if let Some((tensor, bytes)) = self.dq_accum {
            let region = cursor.take(bytes);
            handle.memset_async(region, 0, bytes)?;
            pass_by_value.insert(tensor, PassByValue::Buffer(region));
        }
        if let Some((tensor, bytes)) = self.softmax_sum {
            pass_by_value.insert(tensor, PassByValue::Buffer(cursor.take(bytes)));
        }
        debug!(
            "Materialized {} engine constants from workspace {:?}",
            pass_by_value.len(),
            workspace
        );
        Ok(())
    }
}
