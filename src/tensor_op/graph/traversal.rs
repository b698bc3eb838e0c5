use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::debug;

use crate::{
    error::{GraphError, Result},
    tensor::{TensorHandle, TensorTable},
    tensor_op::Node,
};

/// Check the structural invariants of a flattened primitive graph: every
/// tensor is written by at most one primitive, every consumed virtual
/// tensor has a producer, and the producer/consumer edges form no cycle.
/// Virtual tensors without a consumer are allowed.
pub(crate) fn check_dag(table: &TensorTable, primitives: &[&Node]) -> Result<()> {
    let mut producers: BTreeMap<TensorHandle, usize> = BTreeMap::new();
    for (index, node) in primitives.iter().enumerate() {
        for output in node.outputs() {
            if let Some(previous) = producers.insert(output, index) {
                return Err(GraphError::GraphNotSupported(format!(
                    "Tensor '{}' ({}) is produced by both '{}' and '{}'",
                    table.get(output)?.name(),
                    output,
                    primitives[previous].name(),
                    node.name()
                )));
            }
        }
    }

    let mut consumed: BTreeSet<TensorHandle> = BTreeSet::new();
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); primitives.len()];
    let mut in_degree = vec![0usize; primitives.len()];
    for (index, node) in primitives.iter().enumerate() {
        for input in node.inputs() {
            consumed.insert(input);
            match producers.get(&input) {
                Some(&producer) => {
                    if successors[producer].insert(index) {
                        in_degree[index] += 1;
                    }
                }
                None => {
                    let tensor = table.get(input)?;
                    ensure!(
                        !tensor.is_virtual(),
                        GraphNotSupported,
                        "Virtual tensor '{}' ({}) consumed by '{}' has no producer",
                        tensor.name(),
                        input,
                        node.name()
                    );
                }
            }
        }
    }

    // Inference writes softmax statistics to a virtual tensor nobody reads,
    // so an unconsumed virtual output is logged rather than rejected.
    for (&tensor, &producer) in &producers {
        if !consumed.contains(&tensor) && table.get(tensor)?.is_virtual() {
            debug!(
                "Virtual tensor '{}' produced by '{}' is never consumed",
                table.get(tensor)?.name(),
                primitives[producer].name()
            );
        }
    }

    let mut ready: VecDeque<usize> = (0..primitives.len())
        .filter(|&index| in_degree[index] == 0)
        .collect();
    let mut visited = 0;
    while let Some(index) = ready.pop_front() {
        visited += 1;
        for &next in &successors[index] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    ensure!(
        visited == primitives.len(),
        GraphNotSupported,
        "Primitive graph has a cycle through {} nodes",
        primitives.len() - visited
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::ErrorCode,
        tensor::TensorAttributes,
        tensor_op::{primitive::Pointwise, PointwiseMode},
    };

    fn exp(x: TensorHandle, y: TensorHandle) -> Node {
        Node::new(Pointwise::new(PointwiseMode::Exp).with_input(x).with_output(y))
    }

    #[test]
    fn chain_is_accepted() {
        let mut table = TensorTable::new();
        let x = table.bind(TensorAttributes::new().with_name("x"));
        let t = table.bind(TensorAttributes::virtual_tensor("t"));
        let y = table.bind(TensorAttributes::new().with_name("y"));
        let nodes = vec![exp(x, t), exp(t, y)];
        let refs: Vec<&Node> = nodes.iter().collect();
        check_dag(&table, &refs).unwrap();
    }

    #[test]
    fn second_producer_is_rejected() {
        let mut table = TensorTable::new();
        let x = table.bind(TensorAttributes::new().with_name("x"));
        let y = table.bind(TensorAttributes::new().with_name("y"));
        let nodes = vec![exp(x, y), exp(x, y)];
        let refs: Vec<&Node> = nodes.iter().collect();
        let err = check_dag(&table, &refs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GraphNotSupported);
    }

    #[test]
    fn cycle_is_rejected() {
        let mut table = TensorTable::new();
        let a = table.bind(TensorAttributes::virtual_tensor("a"));
        let b = table.bind(TensorAttributes::virtual_tensor("b"));
        let nodes = vec![exp(a, b), exp(b, a)];
        let refs: Vec<&Node> = nodes.iter().collect();
        let err = check_dag(&table, &refs).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GraphNotSupported);
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn orphaned_virtual_input_is_rejected() {
        let mut table = TensorTable::new();
        let t = table.bind(TensorAttributes::virtual_tensor("t"));
        let y = table.bind(TensorAttributes::new().with_name("y"));
        let nodes = vec![exp(t, y)];
        let refs: Vec<&Node> = nodes.iter().collect();
        assert!(check_dag(&table, &refs).is_err());
    }

    #[test]
    fn unconsumed_virtual_output_is_accepted() {
        let mut table = TensorTable::new();
        let x = table.bind(TensorAttributes::new().with_name("x"));
        let stats = table.bind(TensorAttributes::virtual_tensor("stats"));
        let y = table.bind(TensorAttributes::new().with_name("y"));
        let nodes = vec![exp(x, stats), exp(x, y)];
        let refs: Vec<&Node> = nodes.iter().collect();
        check_dag(&table, &refs).unwrap();
    }
}
