//! Row-wise softmax over the last axis, expanded into reductions and
//! pointwise operations.

use crate::{
    context::Context,
    error::Result,
    tensor::{TensorHandle, TensorTable},
    tensor_op::{
        ports::Ports,
        primitive::{Pointwise, Reduction},
        subgraph::Subgraph,
        Node, NodeOperation, NodeType, OperationKind, PointwiseMode, ReductionMode,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SoftmaxInput {
    P,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SoftmaxOutput {
    S,
    /// `max + log(sum)`, enough to recompute `S` from `P` later.
    Stats,
    /// Row maximum.
    M,
    /// Reciprocal of the row sum of exponentials.
    Zinv,
}

#[derive(Debug, Clone)]
pub struct Softmax {
    name: String,
    use_stats: bool,
    use_m_zinv: bool,
    ports: Ports<SoftmaxInput, SoftmaxOutput>,
}

impl Default for Softmax {
    fn default() -> Self {
        Softmax {
            name: "softmax".to_string(),
            use_stats: false,
            use_m_zinv: false,
            ports: Ports::new(),
        }
    }
}

impl Softmax {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn has_stats(mut self, value: bool) -> Self {
        self.use_stats = value;
        self
    }

    pub fn has_m_zinv(mut self, value: bool) -> Self {
        self.use_m_zinv = value;
        self
    }

    pub fn with_input(mut self, p: TensorHandle) -> Self {
        self.ports.set_input(SoftmaxInput::P, p);
        self
    }

    pub fn with_output(mut self, s: TensorHandle) -> Self {
        self.ports.set_output(SoftmaxOutput::S, s);
        self
    }

    pub fn with_stats_output(mut self, stats: TensorHandle) -> Self {
        self.ports.set_output(SoftmaxOutput::Stats, stats);
        self
    }

    pub fn with_m_zinv_outputs(mut self, m: TensorHandle, zinv: TensorHandle) -> Self {
        self.ports.set_output(SoftmaxOutput::M, m);
        self.ports.set_output(SoftmaxOutput::Zinv, zinv);
        self
    }

    pub fn output(&self, port: SoftmaxOutput) -> Option<TensorHandle> {
        self.ports.output(port)
    }

    pub fn stats_enabled(&self) -> bool {
        self.use_stats
    }

    pub fn m_zinv_enabled(&self) -> bool {
        self.use_m_zinv
    }
}

impl NodeOperation for Softmax {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Softmax
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
        self.ports.require_input(SoftmaxInput::P)?;
        self.ports.require_output(SoftmaxOutput::S)?;
        if self.use_stats {
            self.ports.require_output(SoftmaxOutput::Stats)?;
        }
        if self.use_m_zinv {
            self.ports.require_output(SoftmaxOutput::M)?;
            self.ports.require_output(SoftmaxOutput::Zinv)?;
        }
        ensure!(
            context.intermediate_data_type().is_set(),
            AttributeNotSet,
            "Softmax '{}' creates intermediates and needs an intermediate data type",
            self.name
        );
        self.ports.validate_inputs(table)
    }

    fn expand_and_infer_properties(
        &mut self,
        table: &mut TensorTable,
        context: &Context,
    ) -> Result<Vec<Node>> {
        self.ports.fill_from_context(table, context)?;
        let p = self.ports.require_input(SoftmaxInput::P)?;
        let s = self.ports.require_output(SoftmaxOutput::S)?;
        let name = self.name.clone();
        let mut sub = Subgraph::new(table);

        let max = sub.reduction(
            Reduction::new(ReductionMode::Max).with_name(format!("{}::max", name)),
            p,
        );
        let shifted = sub.pointwise(&format!("{}::sub", name), PointwiseMode::Sub, &[p, max]);
        let exp = sub.pointwise(&format!("{}::exp", name), PointwiseMode::Exp, &[shifted]);
        let sum = sub.reduction(
            Reduction::new(ReductionMode::Add).with_name(format!("{}::sum", name)),
            exp,
        );

        if self.use_stats {
            let stats = self.ports.require_output(SoftmaxOutput::Stats)?;
            let log = sub.pointwise(&format!("{}::log", name), PointwiseMode::Log, &[sum]);
            sub.pointwise_into(
                Pointwise::new(PointwiseMode::Add).with_name(format!("{}::stats", name)),
                &[max, log],
                stats,
            );
        }
        if self.use_m_zinv {
            sub.pointwise_into(
                Pointwise::new(PointwiseMode::Identity).with_name(format!("{}::m", name)),
                &[max],
                self.ports.require_output(SoftmaxOutput::M)?,
            );
            sub.pointwise_into(
                Pointwise::new(PointwiseMode::Reciprocal).with_name(format!("{}::zinv", name)),
                &[sum],
                self.ports.require_output(SoftmaxOutput::Zinv)?,
            );
        }

        sub.pointwise_into(
            Pointwise::new(PointwiseMode::Div).with_name(format!("{}::div", name)),
            &[exp, sum],
            s,
        );
        Ok(sub.finish())
    }

    fn post_validate(&self, table: &TensorTable) -> Result<()> {
        self.ports.validate_outputs(table)
    }
}
