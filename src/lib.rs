//! Expansion and property inference for graphs of composite tensor
//! operators.
//!
//! A [`Graph`](tensor_op::Graph) is built from caller-described tensors and
//! operator attributes. Validation expands composite operators such as flash
//! attention into primitive matmul, pointwise, reduction, rng and reshape
//! nodes, resolves every tensor's shape, stride and data type, and computes
//! the workspace and pass-by-value constants a backend needs to execute it.

extern crate ndarray;
extern crate num_traits;
extern crate thiserror;

#[macro_use]
pub mod error;

pub mod context;
pub mod prelude;
pub mod tensor;
pub mod tensor_op;
pub mod utility;
pub mod workspace;

#[cfg(test)]
mod tests;

pub use context::{Capabilities, Context, WorkspaceLimit};
pub use error::{ErrorCode, GraphError, Result};
pub use tensor::{DataType, TensorAttributes, TensorHandle, TensorKind};
pub use tensor_op::Graph;
