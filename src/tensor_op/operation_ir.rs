use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointwiseMode {
    Add,
    Sub,
    Mul,
    Div,
    Exp,
    Log,
    Reciprocal,
    Identity,
    /// Index of every element along `axis`.
    GenIndex,
    CmpLt,
    CmpGe,
    LogicalAnd,
    /// `IN_2 ? IN_0 : IN_1`.
    BinarySelect,
}

impl PointwiseMode {
    /// Number of tensor operands the mode consumes.
    pub fn arity(&self) -> usize {
        match self {
            PointwiseMode::Exp
            | PointwiseMode::Log
            | PointwiseMode::Reciprocal
            | PointwiseMode::Identity
            | PointwiseMode::GenIndex => 1,
            PointwiseMode::BinarySelect => 3,
            _ => 2,
        }
    }

    pub fn to_string(&self) -> String {
        match self {
            PointwiseMode::Add => "ADD",
            PointwiseMode::Sub => "SUB",
            PointwiseMode::Mul => "MUL",
            PointwiseMode::Div => "DIV",
            PointwiseMode::Exp => "EXP",
            PointwiseMode::Log => "LOG",
            PointwiseMode::Reciprocal => "RECIPROCAL",
            PointwiseMode::Identity => "IDENTITY",
            PointwiseMode::GenIndex => "GEN_INDEX",
            PointwiseMode::CmpLt => "CMP_LT",
            PointwiseMode::CmpGe => "CMP_GE",
            PointwiseMode::LogicalAnd => "LOGICAL_AND",
            PointwiseMode::BinarySelect => "BINARY_SELECT",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionMode {
    Add,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RngDistribution {
    Bernoulli(f64),
}

/// What a node computes, independent of its ports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperationKind {
    Matmul,
    Pointwise(PointwiseMode),
    Reduction(ReductionMode),
    Rng(RngDistribution),
    Reshape,
    LayerNormBackward,
    Softmax,
    FlashAttention,
    FlashAttentionBackward,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Matmul => write!(f, "MATMUL"),
            OperationKind::Pointwise(mode) => write!(f, "POINTWISE_{}", mode.to_string()),
            OperationKind::Reduction(ReductionMode::Add) => write!(f, "REDUCTION_ADD"),
            OperationKind::Reduction(ReductionMode::Max) => write!(f, "REDUCTION_MAX"),
            OperationKind::Rng(RngDistribution::Bernoulli(p)) => write!(f, "RNG_BERNOULLI({})", p),
            OperationKind::Reshape => write!(f, "RESHAPE"),
            OperationKind::LayerNormBackward => write!(f, "LAYERNORM_BACKWARD"),
            OperationKind::Softmax => write!(f, "SOFTMAX"),
            OperationKind::FlashAttention => write!(f, "FLASH_ATTENTION"),
            OperationKind::FlashAttentionBackward => write!(f, "FLASH_ATTENTION_BACKWARD"),
        }
    }
}
