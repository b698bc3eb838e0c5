//! Operations that map one-to-one onto a backend execution unit.

mod layernorm_backward;
mod matmul;
mod pointwise;
mod reduction;
mod reshape;
mod rng;

pub use layernorm_backward::{LayerNormBackward, LayerNormBackwardInput, LayerNormBackwardOutput};
pub use matmul::{Matmul, MatmulInput, MatmulOutput};
pub use pointwise::{Pointwise, PointwiseInput, PointwiseOutput};
pub use reduction::{Reduction, ReductionInput, ReductionOutput};
pub use reshape::{Reshape, ReshapeInput, ReshapeOutput};
pub use rng::{Rng, RngInput, RngOutput};
