use std::fmt;

use itertools::join;

use crate::{
    tensor::{TensorHandle, TensorTable},
    tensor_op::Node,
};

use super::Graph;

const INDENT: &str = "  ";

fn write_tensors(
    f: &mut fmt::Formatter<'_>,
    table: &TensorTable,
    tensors: &[TensorHandle],
) -> fmt::Result {
    let rendered = tensors.iter().map(|&handle| match table.get(handle) {
        Ok(tensor) if tensor.dims().is_empty() => format!("{}:{}", handle, tensor.name()),
        Ok(tensor) => format!(
            "{}:{}[{}]",
            handle,
            tensor.name(),
            join(tensor.dims(), "x")
        ),
        Err(_) => format!("{}:?", handle),
    });
    write!(f, "({})", join(rendered, ", "))
}

fn write_node(
    f: &mut fmt::Formatter<'_>,
    table: &TensorTable,
    node: &Node,
    depth: usize,
) -> fmt::Result {
    write!(f, "{}{} '{}' ", INDENT.repeat(depth), node.kind(), node.name())?;
    write_tensors(f, table, &node.inputs())?;
    write!(f, " -> ")?;
    write_tensors(f, table, &node.outputs())?;
    writeln!(f)?;
    for child in node.children() {
        write_node(f, table, child, depth + 1)?;
    }
    Ok(())
}

/// One line per node, children indented under the composite they expand.
impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write_node(f, &self.tensors, node, 0)?;
        }
        Ok(())
    }
}
