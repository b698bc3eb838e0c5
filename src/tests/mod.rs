use std::{cell::RefCell, collections::HashMap};

use rand::{rngs::StdRng, Rng as _, SeedableRng};

use crate::{
    prelude::*,
    tensor_op::{attention::required_dp_workspace_bytes, util::layout::row_major_strides},
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn context() -> Context {
    Context::default()
        .set_intermediate_data_type(DataType::Float)
        .set_io_data_type(DataType::Half)
        .set_compute_data_type(DataType::Float)
        .set_workspace_limit(WorkspaceLimit::Default)
}

fn packed(graph: &mut Graph, name: &str, dims: Vec<usize>, data_type: DataType) -> TensorHandle {
    let strides = row_major_strides(&dims);
    graph.tensor(
        TensorAttributes::new()
            .with_name(name)
            .with_dim(dims)
            .with_stride(strides)
            .with_data_type(data_type),
    )
}

fn qkv(graph: &mut Graph, dims: [usize; 4]) -> (TensorHandle, TensorHandle, TensorHandle) {
    let q = packed(graph, "Q", dims.to_vec(), DataType::Half);
    let k = packed(graph, "K", dims.to_vec(), DataType::Half);
    let v = packed(graph, "V", dims.to_vec(), DataType::Half);
    (q, k, v)
}

fn count(graph: &Graph, kind: OperationKind) -> usize {
    graph
        .primitives()
        .iter()
        .filter(|node| node.kind() == kind)
        .count()
}

fn named(graph: &Graph, name: &str) -> Option<TensorHandle> {
    graph
        .tensors()
        .iter()
        .find(|(_, tensor)| tensor.name() == name && tensor.kind() == TensorKind::PassByValue)
        .map(|(handle, _)| handle)
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Copy(DevicePtr, usize),
    Memset(DevicePtr, u8, usize),
}

/// Records stream submissions in order.
#[derive(Default)]
struct Stream {
    events: RefCell<Vec<Event>>,
}

impl ExecutionHandle for &Stream {
    fn copy_host_to_device_async(&mut self, destination: DevicePtr, bytes: &[u8]) -> Result<()> {
        self.events
            .borrow_mut()
            .push(Event::Copy(destination, bytes.len()));
        Ok(())
    }

    fn memset_async(&mut self, destination: DevicePtr, value: u8, len: usize) -> Result<()> {
        self.events
            .borrow_mut()
            .push(Event::Memset(destination, value, len));
        Ok(())
    }
}

fn materialize(graph: &Graph, workspace: DevicePtr) -> (PassByValueMap, Vec<Event>) {
    let stream = Stream::default();
    let mut handle = &stream;
    let values = graph
        .materialize(&mut handle, &HashMap::new(), workspace)
        .unwrap();
    let events = stream.events.borrow().clone();
    (values, events)
}

#[test]
fn inference_without_masks() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [2, 4, 128, 64]);
    let (o, stats) = graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new().with_is_inference(true),
    );
    graph.validate().unwrap();

    assert!(stats.is_none());
    let o = graph.tensor_attributes(o).unwrap();
    assert_eq!(o.dims(), &[2, 4, 128, 64]);
    assert_eq!(o.strides(), &[4 * 128 * 64, 128 * 64, 64, 1]);
    assert!(graph
        .primitives()
        .iter()
        .all(|node| !matches!(node.kind(), OperationKind::Rng(_))));
    assert_eq!(named(&graph, "dropout_scale"), None);
    assert_eq!(graph.workspace_size().unwrap(), 0);
}

#[test]
fn causal_mask_selects_before_softmax() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [2, 4, 128, 64]);
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(true)
            .with_causal_mask(true),
    );
    graph.validate().unwrap();

    assert_eq!(count(&graph, OperationKind::Pointwise(PointwiseMode::GenIndex)), 2);
    assert_eq!(count(&graph, OperationKind::Pointwise(PointwiseMode::CmpGe)), 1);
    assert_eq!(count(&graph, OperationKind::Pointwise(PointwiseMode::BinarySelect)), 1);

    let kinds: Vec<OperationKind> = graph.primitives().iter().map(|n| n.kind()).collect();
    let select = kinds
        .iter()
        .position(|kind| *kind == OperationKind::Pointwise(PointwiseMode::BinarySelect))
        .unwrap();
    assert_eq!(kinds[select + 1], OperationKind::Reduction(ReductionMode::Max));
    assert_eq!(graph.primitives()[select + 1].name(), "softmax::max");

    let negative_inf = named(&graph, "negative_inf_causal").unwrap();
    let (values, events) = materialize(&graph, DevicePtr(0));
    assert_eq!(values[&negative_inf], PassByValue::Float(f32::MIN));
    assert!(events.is_empty());
}

#[test]
fn training_dropout_is_seeded_and_scaled() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [2, 4, 128, 64]);
    let seed = packed(&mut graph, "seed", vec![1, 1, 1, 1], DataType::Int64);
    let offset = packed(&mut graph, "offset", vec![1, 1, 1, 1], DataType::Int64);
    let (_, stats) = graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(false)
            .with_dropout(0.1, seed, offset),
    );
    graph.validate().unwrap();

    let stats = graph.tensor_attributes(stats.unwrap()).unwrap();
    assert_eq!(stats.dims(), &[2, 4, 128, 1]);
    assert_eq!(stats.data_type(), DataType::Float);

    let primitives = graph.primitives();
    let rng = primitives
        .iter()
        .find_map(|node| match node.operation() {
            Operation::Rng(rng) => Some(rng),
            _ => None,
        })
        .unwrap();
    let RngDistribution::Bernoulli(keep) = rng.distribution();
    assert!((keep - 0.9).abs() < 1e-9);
    assert_eq!(rng.seed(), Some(seed));
    assert_eq!(rng.offset(), Some(offset));

    let mask_mul = primitives
        .iter()
        .find(|node| node.name() == "dropout_mask_mul")
        .unwrap();
    assert_eq!(mask_mul.kind(), OperationKind::Pointwise(PointwiseMode::Mul));

    let scale = named(&graph, "dropout_scale").unwrap();
    let (values, _) = materialize(&graph, DevicePtr(0));
    let scale = values[&scale].as_f32().unwrap();
    assert!((scale - 1.0 / 0.9).abs() < 1e-6);
}

#[test]
fn dropout_probability_excludes_user_mask() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [1, 2, 64, 64]);
    let seed = packed(&mut graph, "seed", vec![1, 1, 1, 1], DataType::Int64);
    let offset = packed(&mut graph, "offset", vec![1, 1, 1, 1], DataType::Int64);
    let mask = packed(&mut graph, "mask", vec![1, 2, 64, 64], DataType::Half);
    let scale = packed(&mut graph, "scale", vec![1, 1, 1, 1], DataType::Float);
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(true)
            .with_dropout(0.2, seed, offset)
            .with_dropout_mask(mask, scale),
    );
    let err = graph.validate().unwrap_err();
    assert_eq!(err.code(), ErrorCode::AttributeNotSet);
    assert_eq!(graph.nodes()[0].state(), NodeState::Unvalidated);
}

/// `(kind, name, dims, strides)` of every primitive output, in order.
type Fingerprint = Vec<(OperationKind, String, Vec<Vec<usize>>, Vec<Vec<usize>>)>;

fn fully_masked() -> (Graph, Fingerprint) {
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [2, 4, 64, 64]);
    let bias = packed(&mut graph, "bias", vec![1, 4, 64, 64], DataType::Half);
    let seq_len_q = packed(&mut graph, "seq_len_q", vec![2, 1, 1, 1], DataType::Int32);
    let seq_len_kv = packed(&mut graph, "seq_len_kv", vec![2, 1, 1, 1], DataType::Int32);
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(true)
            .with_attn_scale_value(0.125)
            .with_bias(bias)
            .with_alibi_mask(true)
            .with_padding_mask(true)
            .with_seq_len_q(seq_len_q)
            .with_seq_len_kv(seq_len_kv)
            .with_causal_mask(true),
    );
    graph.validate().unwrap();

    let fingerprint = graph
        .primitives()
        .iter()
        .map(|node| {
            let outputs: Vec<&TensorAttributes> = node
                .outputs()
                .into_iter()
                .map(|handle| graph.tensor_attributes(handle).unwrap())
                .collect();
            (
                node.kind(),
                node.name().to_string(),
                outputs.iter().map(|t| t.dims().to_vec()).collect(),
                outputs.iter().map(|t| t.strides().to_vec()).collect(),
            )
        })
        .collect();
    (graph, fingerprint)
}

#[test]
fn masks_apply_in_fixed_order() {
    init();
    let (graph, fingerprint) = fully_masked();
    let position = |name: &str| {
        fingerprint
            .iter()
            .position(|(_, node, _, _)| node == name)
            .unwrap_or_else(|| panic!("missing primitive {}", name))
    };
    let order = [
        "bmm1",
        "mul_s_attn_scale",
        "add_bias",
        "add_alibi",
        "select_padding",
        "select_causal",
        "softmax::max",
        "bmm2",
    ];
    for pair in order.windows(2) {
        assert!(position(pair[0]) < position(pair[1]), "{:?}", pair);
    }
    assert_eq!(position("select_causal") + 1, position("softmax::max"));

    let (_, again) = fully_masked();
    assert_eq!(fingerprint, again);

    let slopes = named(&graph, "alibi_slopes").unwrap();
    assert_eq!(graph.workspace_size().unwrap(), 4 * 4);
    let (values, events) = materialize(&graph, DevicePtr(0x2000));
    assert_eq!(values[&slopes], PassByValue::Buffer(DevicePtr(0x2000)));
    assert_eq!(events, vec![Event::Copy(DevicePtr(0x2000), 16)]);
}

fn backward(graph: &mut Graph, dims: [usize; 4], attributes: FlashAttentionBackward) {
    let [b, h, s, _] = dims;
    let (q, k, v) = qkv(graph, dims);
    let o = packed(graph, "O", dims.to_vec(), DataType::Half);
    let d_o = packed(graph, "dO", dims.to_vec(), DataType::Half);
    let stats = graph.tensor(
        TensorAttributes::new()
            .with_name("Stats")
            .with_dim(vec![b, h, s, 1])
            .with_stride(vec![h * s, s, 1, 1])
            .with_data_type(DataType::Float),
    );
    graph.scaled_dot_product_flash_attention_backward(q, k, v, o, d_o, stats, attributes);
}

fn accumulates_dq(limit: WorkspaceLimit, dims: [usize; 4]) -> bool {
    let mut graph = Graph::new(context().set_workspace_limit(limit));
    backward(&mut graph, dims, FlashAttentionBackward::new());
    graph.validate().unwrap();
    graph
        .primitives()
        .iter()
        .any(|node| node.name() == "identity_dQ")
}

#[test]
fn accumulator_threshold_flips_at_ceiling() {
    init();
    let dims = [1, 2, 100, 64];
    let required = required_dp_workspace_bytes(1, 2, 100, 100, 64);
    assert_eq!(required, 2 * 128 * 128 * 2);

    assert!(!accumulates_dq(WorkspaceLimit::Bytes(required), dims));
    assert!(accumulates_dq(WorkspaceLimit::Bytes(required - 1), dims));
    assert!(!accumulates_dq(WorkspaceLimit::Bytes(required + 1), dims));

    assert_eq!(WorkspaceLimit::parse("0").unwrap(), WorkspaceLimit::Disabled);
    assert!(accumulates_dq(WorkspaceLimit::parse("0").unwrap(), [1, 1, 64, 64]));
    assert_eq!(WorkspaceLimit::parse("-1").unwrap(), WorkspaceLimit::Unlimited);
    assert!(!accumulates_dq(
        WorkspaceLimit::parse("-1").unwrap(),
        [8, 16, 8192, 128]
    ));
}

#[test]
fn backward_buffers_follow_declaration_order() {
    init();
    let context = context()
        .set_capabilities(Capabilities::new(8904, 9))
        .set_workspace_limit(WorkspaceLimit::Unlimited);
    let mut graph = Graph::new(context);
    backward(
        &mut graph,
        [1, 2, 64, 64],
        FlashAttentionBackward::new()
            .with_alibi_mask(true)
            .with_attn_scale_value(0.125),
    );
    graph.validate().unwrap();

    let alibi = 2 * 4;
    let dq_accum = 2 * 64 * 64 * 4;
    let softmax_sum = 2 * 64 * 4;
    assert_eq!(graph.workspace_size().unwrap(), alibi + dq_accum + softmax_sum);

    let base = DevicePtr(0x10000);
    let (values, events) = materialize(&graph, base);
    assert_eq!(
        events,
        vec![
            Event::Copy(base, alibi),
            Event::Memset(base.offset(alibi), 0, dq_accum),
        ]
    );
    let sum = named(&graph, "scale_dropout_inv::OUT_0").unwrap();
    assert_eq!(
        values[&sum],
        PassByValue::Buffer(base.offset(alibi + dq_accum))
    );
}

fn primitive<'a>(graph: &'a Graph, name: &str) -> &'a Node {
    graph
        .primitives()
        .into_iter()
        .find(|node| node.name() == name)
        .unwrap_or_else(|| panic!("missing primitive {}", name))
}

#[test]
fn backward_dropout_regenerates_mask() {
    init();
    let mut graph = Graph::new(context().set_workspace_limit(WorkspaceLimit::Unlimited));
    let seed = packed(&mut graph, "seed", vec![1, 1, 1, 1], DataType::Int64);
    let offset = packed(&mut graph, "offset", vec![1, 1, 1, 1], DataType::Int64);
    backward(
        &mut graph,
        [1, 2, 64, 64],
        FlashAttentionBackward::new().with_dropout(0.25, seed, offset),
    );
    graph.validate().unwrap();

    let primitives = graph.primitives();
    let rngs: Vec<&Node> = primitives
        .iter()
        .copied()
        .filter(|node| matches!(node.kind(), OperationKind::Rng(_)))
        .collect();
    assert_eq!(rngs.len(), 1);
    let rng = match rngs[0].operation() {
        Operation::Rng(rng) => rng,
        _ => panic!("expected an rng node"),
    };
    let RngDistribution::Bernoulli(keep) = rng.distribution();
    assert!((keep - 0.75).abs() < 1e-9);
    assert_eq!(rng.seed(), Some(seed));
    assert_eq!(rng.offset(), Some(offset));

    let mask = rngs[0].outputs()[0];
    assert_eq!(graph.tensor_attributes(mask).unwrap().dims(), &[1, 2, 64, 64]);
    assert!(primitive(&graph, "mul_p_dropout_mask").inputs().contains(&mask));
    assert!(primitive(&graph, "dP_dropout_mask").inputs().contains(&mask));

    let scale = named(&graph, "dropout_scale").unwrap();
    let scale_inv = named(&graph, "dropout_scale_inv").unwrap();
    assert!(primitive(&graph, "mul_p_dropout_scale").inputs().contains(&scale));
    assert!(primitive(&graph, "mul_dS_dropout_scale").inputs().contains(&scale));
    assert!(primitive(&graph, "scale_dropout_inv").inputs().contains(&scale_inv));

    let (values, events) = materialize(&graph, DevicePtr(0));
    assert!((values[&scale].as_f32().unwrap() - 1.0 / 0.75).abs() < 1e-6);
    assert!((values[&scale_inv].as_f32().unwrap() - 0.75).abs() < 1e-6);
    assert!(events.is_empty());
}

#[test]
fn backward_masks_follow_score_recompute() {
    init();
    let mut graph = Graph::new(context().set_workspace_limit(WorkspaceLimit::Unlimited));
    let seq_len_q = packed(&mut graph, "seq_len_q", vec![2, 1, 1, 1], DataType::Int32);
    let seq_len_kv = packed(&mut graph, "seq_len_kv", vec![2, 1, 1, 1], DataType::Int32);
    backward(
        &mut graph,
        [2, 4, 64, 64],
        FlashAttentionBackward::new()
            .with_padding_mask(true)
            .with_seq_len_q(seq_len_q)
            .with_seq_len_kv(seq_len_kv)
            .with_causal_mask(true),
    );
    graph.validate().unwrap();

    let names: Vec<&str> = graph.primitives().into_iter().map(|node| node.name()).collect();
    let position = |name: &str| {
        names
            .iter()
            .position(|node| *node == name)
            .unwrap_or_else(|| panic!("missing primitive {}", name))
    };
    assert!(position("matmul_Q_KT") < position("select_padding"));
    assert!(position("select_padding") < position("select_causal"));
    assert_eq!(position("select_causal") + 1, position("sub_s_m"));
    assert!(primitive(&graph, "lt_row_sq_padding").inputs().contains(&seq_len_q));
    assert!(primitive(&graph, "lt_col_skv_padding").inputs().contains(&seq_len_kv));
    assert_eq!(count(&graph, OperationKind::Pointwise(PointwiseMode::BinarySelect)), 2);
    assert!(graph
        .primitives()
        .iter()
        .all(|node| !matches!(node.kind(), OperationKind::Rng(_))));

    let select = primitive(&graph, "select_causal").outputs()[0];
    assert_eq!(graph.tensor_attributes(select).unwrap().dims(), &[2, 4, 64, 64]);

    let padding = named(&graph, "negative_inf_padding").unwrap();
    let causal = named(&graph, "negative_inf_causal").unwrap();
    let (values, _) = materialize(&graph, DevicePtr(0));
    assert_eq!(values[&padding], PassByValue::Float(f32::MIN));
    assert_eq!(values[&causal], PassByValue::Float(f32::MIN));
}

#[test]
fn caller_dropout_mask_skips_generation() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [1, 2, 64, 64]);
    let mask = packed(&mut graph, "mask", vec![1, 2, 64, 64], DataType::Half);
    let scale = packed(&mut graph, "scale", vec![1, 1, 1, 1], DataType::Float);
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(true)
            .with_dropout_mask(mask, scale),
    );
    graph.validate().unwrap();

    assert!(graph
        .primitives()
        .iter()
        .all(|node| !matches!(node.kind(), OperationKind::Rng(_))));
    assert!(primitive(&graph, "dropout_mask_mul").inputs().contains(&mask));
    assert!(primitive(&graph, "dropout_scale").inputs().contains(&scale));
    assert_eq!(named(&graph, "dropout_scale"), None);

    let (values, _) = materialize(&graph, DevicePtr(0));
    assert!(!values.contains_key(&scale));
    assert!(!values.contains_key(&mask));
}

#[test]
fn inner_stride_must_be_unit() {
    init();
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..64 {
        let dims = [1, rng.gen_range(1..=4), rng.gen_range(1..=8) * 16, 64];
        let inner: usize = if rng.gen_bool(0.5) { 1 } else { rng.gen_range(2..=4) };
        let port = rng.gen_range(0..3);

        let mut graph = Graph::new(context());
        let (q, k, v) = qkv(&mut graph, dims);
        let target = [q, k, v][port];
        let mut strides = row_major_strides(&dims);
        strides = strides.iter().map(|stride| stride * inner).collect();
        strides[3] = inner;
        graph.tensor_mut(target).unwrap().set_stride(strides.clone());
        graph.scaled_dot_product_flash_attention(
            q,
            k,
            v,
            FlashAttention::new().with_is_inference(true),
        );

        let result = graph.validate();
        if inner == 1 {
            assert!(result.is_ok(), "{:?} {:?}", strides, result);
        } else {
            assert_eq!(
                result.unwrap_err().code(),
                ErrorCode::GraphNotSupported,
                "{:?}",
                strides
            );
        }
    }
}

#[test]
fn inference_is_idempotent_on_specified_tensors() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [1, 2, 64, 64]);
    let o = graph.tensor(
        TensorAttributes::new()
            .with_name("O")
            .with_dim(vec![1, 2, 64, 64])
            .with_stride(vec![8192, 64, 128, 1])
            .with_data_type(DataType::Half),
    );
    let before = graph.tensor_attributes(o).unwrap().clone();
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new()
            .with_is_inference(true)
            .with_output(FlashAttentionOutput::O, o),
    );
    graph.validate().unwrap();
    assert_eq!(graph.tensor_attributes(o).unwrap(), &before);
}

#[test]
fn layernorm_backward_through_graph() {
    init();
    let context = context()
        .set_io_data_type(DataType::Float)
        .set_capabilities(Capabilities::new(8905, 8));
    let mut graph = Graph::new(context);
    let x = packed(&mut graph, "X", vec![8, 64, 1, 1], DataType::Float);
    let dy = graph.tensor(TensorAttributes::new().with_name("DY"));
    let scale = packed(&mut graph, "scale", vec![1, 64, 1, 1], DataType::Float);
    let mean = packed(&mut graph, "mean", vec![8, 1, 1, 1], DataType::Float);
    let inv_var = packed(&mut graph, "inv_var", vec![8, 1, 1, 1], DataType::Float);
    let [dx, dscale, dbias] =
        graph.layernorm_backward(dy, x, scale, mean, inv_var, LayerNormBackward::new());
    graph.validate().unwrap();

    assert_eq!(graph.tensor_attributes(dx).unwrap().dims(), &[8, 64, 1, 1]);
    assert_eq!(graph.tensor_attributes(dx).unwrap().strides(), &[64, 1, 64, 64]);
    assert_eq!(graph.tensor_attributes(dscale).unwrap().dims(), &[1, 64, 1, 1]);
    assert_eq!(graph.tensor_attributes(dbias).unwrap().dims(), &[1, 64, 1, 1]);

    let (values, _) = materialize(&graph, DevicePtr(0));
    assert_eq!(values.len(), 1);
    assert!(values.values().all(|value| *value == PassByValue::Float(0.0)));
}

#[test]
fn validating_twice_is_rejected() {
    init();
    let mut graph = Graph::new(context());
    let (q, k, v) = qkv(&mut graph, [1, 1, 64, 64]);
    graph.scaled_dot_product_flash_attention(
        q,
        k,
        v,
        FlashAttention::new().with_is_inference(true),
    );
    graph.validate().unwrap();
    assert_eq!(graph.validate().unwrap_err().code(), ErrorCode::InvalidState);
}
