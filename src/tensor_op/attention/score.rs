use crate::{
    error::Result,
    tensor::{DataType, TensorHandle},
    tensor_op::{primitive::Pointwise, subgraph::Subgraph, PointwiseMode},
};

/// Padding mask operands: per-batch valid lengths and the fill constant.
#[derive(Debug, Clone, Copy)]
pub(super) struct PaddingMask {
    pub(super) seq_len_q: TensorHandle,
    pub(super) seq_len_kv: TensorHandle,
    pub(super) negative_inf: TensorHandle,
}

/// Optional transformations applied to the raw `Q·Kᵀ` scores.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct ScoreMasks {
    pub(super) attn_scale: Option<TensorHandle>,
    pub(super) bias: Option<TensorHandle>,
    pub(super) alibi_slopes: Option<TensorHandle>,
    pub(super) padding: Option<PaddingMask>,
    /// Fill constant of the causal mask.
    pub(super) causal: Option<TensorHandle>,
}

type ScoreStage = fn(&ScoreMasks, &mut Subgraph<'_>, TensorHandle) -> Result<TensorHandle>;

/// Stages in application order. The order fixes the reference numerics.
const SCORE_STAGES: [(&str, ScoreStage); 5] = [
    ("attn_scale", apply_attn_scale),
    ("bias", apply_bias),
    ("alibi", apply_alibi),
    ("padding", apply_padding),
    ("causal", apply_causal),
];

impl ScoreMasks {
    /// Thread the running score through every stage; disabled stages pass it on.
    pub(super) fn apply(&self, sub: &mut Subgraph<'_>, score: TensorHandle) -> Result<TensorHandle> {
        let mut current = score;
        for (_, stage) in SCORE_STAGES.iter() {
            current = stage(self, sub, current)?;
        }
        Ok(current)
    }

    #[cfg(test)]
    pub(super) fn stage_names() -> impl Iterator<Item = &'static str> {
        SCORE_STAGES.iter().map(|(name, _)| *name)
    }
}

fn apply_attn_scale(
    masks: &ScoreMasks,
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
) -> Result<TensorHandle> {
    Ok(match masks.attn_scale {
        Some(scale) => sub.pointwise("mul_s_attn_scale", PointwiseMode::Mul, &[current, scale]),
        None => current,
    })
}

fn apply_bias(
    masks: &ScoreMasks,
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
) -> Result<TensorHandle> {
    Ok(match masks.bias {
        Some(bias) => sub.pointwise("add_bias", PointwiseMode::Add, &[current, bias]),
        None => current,
    })
}

/// Row and column indices of the score, in that order.
fn gen_indices(
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
    suffix: &str,
) -> Result<(TensorHandle, TensorHandle)> {
    let row = gen_index(sub, current, 2, &format!("gen_row_idx_{}", suffix))?;
    let col = gen_index(sub, current, 3, &format!("gen_col_idx_{}", suffix))?;
    Ok((row, col))
}

fn gen_index(
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
    axis: usize,
    name: &str,
) -> Result<TensorHandle> {
    let output = sub.pointwise_with(
        Pointwise::new(PointwiseMode::GenIndex)
            .with_name(name)
            .with_axis(axis)
            .with_compute_data_type(DataType::Int32),
        &[current],
    );
    sub.set_data_type(output, DataType::Int32)?;
    Ok(output)
}

fn typed_pointwise(
    sub: &mut Subgraph<'_>,
    name: &str,
    mode: PointwiseMode,
    data_type: DataType,
    inputs: &[TensorHandle],
) -> Result<TensorHandle> {
    let output = sub.pointwise_with(
        Pointwise::new(mode)
            .with_name(name)
            .with_compute_data_type(data_type),
        inputs,
    );
    sub.set_data_type(output, data_type)?;
    Ok(output)
}

fn apply_alibi(
    masks: &ScoreMasks,
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
) -> Result<TensorHandle> {
    let slopes = match masks.alibi_slopes {
        Some(slopes) => slopes,
        None => return Ok(current),
    };
    let (row, col) = gen_indices(sub, current, "alibi")?;
    let distance = typed_pointwise(
        sub,
        "sub_col_row_alibi",
        PointwiseMode::Sub,
        DataType::Int32,
        &[col, row],
    )?;
    let bias = sub.pointwise("mul_slope_alibi", PointwiseMode::Mul, &[distance, slopes]);
    Ok(sub.pointwise("add_alibi", PointwiseMode::Add, &[current, bias]))
}

fn apply_padding(
    masks: &ScoreMasks,
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
) -> Result<TensorHandle> {
    let padding = match masks.padding {
        Some(padding) => padding,
        None => return Ok(current),
    };
    let (row, col) = gen_indices(sub, current, "padding")?;
    let row_valid = typed_pointwise(
        sub,
        "lt_row_sq_padding",
        PointwiseMode::CmpLt,
        DataType::Boolean,
        &[row, padding.seq_len_q],
    )?;
    let col_valid = typed_pointwise(
        sub,
        "lt_col_skv_padding",
        PointwiseMode::CmpLt,
        DataType::Boolean,
        &[col, padding.seq_len_kv],
    )?;
    let valid = typed_pointwise(
        sub,
        "and_row_col_padding",
        PointwiseMode::LogicalAnd,
        DataType::Boolean,
        &[row_valid, col_valid],
    )?;
    Ok(sub.pointwise(
        "select_padding",
        PointwiseMode::BinarySelect,
        &[current, padding.negative_inf, valid],
    ))
}

fn apply_causal(
    masks: &ScoreMasks,
    sub: &mut Subgraph<'_>,
    current: TensorHandle,
) -> Result<TensorHandle> {
    let negative_inf = match masks.causal {
        Some(negative_inf) => negative_inf,
        None => return Ok(current),
    };
    let (row, col) = gen_indices(sub, current, "causal")?;
    let keep = typed_pointwise(
        sub,
        "ge_row_col_causal",
        PointwiseMode::CmpGe,
        DataType::Boolean,
        &[row, col],
    )?;
    Ok(sub.pointwise(
        "select_causal",
        PointwiseMode::BinarySelect,
        &[current, negative_inf, keep],
    ))
}
