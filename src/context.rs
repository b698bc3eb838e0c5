use log::{debug, warn};

use crate::{
    error::{GraphError, Result},
    tensor::DataType,
};

/// Version and device gates that decide which optional lowerings are available.
///
/// Passed explicitly through the [`Context`] so expansion never queries
/// global device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Backend library version, encoded as `major * 1000 + minor * 100 + patch`.
    pub backend_version: u32,
    /// Major compute generation of the target device.
    pub device_generation: u32,
}

impl Capabilities {
    pub const fn new(backend_version: u32, device_generation: u32) -> Self {
        Capabilities {
            backend_version,
            device_generation,
        }
    }

    /// Dropout with probability exactly zero can be dropped from the graph.
    pub fn elides_zero_probability_dropout(&self) -> bool {
        self.backend_version > 8902
    }

    /// The dropout scale constant is passed as FP32 rather than in the io type.
    pub fn float_dropout_scale(&self) -> bool {
        self.backend_version >= 8903
    }

    /// The backward `softmax_sum` may stay virtual.
    pub fn virtual_softmax_sum(&self) -> bool {
        self.backend_version >= 8905
    }

    /// The backward pass can compute dQ without a dedicated FP32 accumulator.
    pub fn supports_accumulator_free_backward(&self) -> bool {
        self.backend_version >= 8905 && self.device_generation >= 9
    }

    /// Layer-norm backward needs an explicit epsilon operand.
    pub fn layernorm_backward_takes_epsilon(&self) -> bool {
        self.backend_version < 8906
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities::new(8906, 9)
    }
}

/// Upper bound on the bytes the backward pass may spend to skip the dQ accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceLimit {
    /// No override given; use [`WorkspaceLimit::DEFAULT_BYTES`].
    Default,
    /// `-1`: always use the workspace optimization.
    Unlimited,
    /// `0`: never use the workspace optimization.
    Disabled,
    Bytes(u64),
}

impl WorkspaceLimit {
    pub const ENV_VAR: &'static str = "FUSEGRAPH_ATTN_DP_WORKSPACE_LIMIT";
    pub const DEFAULT_BYTES: u64 = 256 * 1024 * 1024;

    pub fn parse(value: &str) -> Result<Self> {
        let bytes: i64 = value.trim().parse().map_err(|_| {
            GraphError::AttributeNotSet(format!(
                "Invalid argument for {} (i64; in bytes): '{}'",
                Self::ENV_VAR,
                value
            ))
        })?;
        Ok(match bytes {
            -1 => WorkspaceLimit::Unlimited,
            0 => WorkspaceLimit::Disabled,
            n if n < 0 => {
                warn!(
                    "{}={} can never be satisfied, disabling the workspace optimization",
                    Self::ENV_VAR,
                    n
                );
                WorkspaceLimit::Disabled
            }
            n => WorkspaceLimit::Bytes(n as u64),
        })
    }

    /// Resolve the limit through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(Self::ENV_VAR) {
            Some(value) => {
                debug!("{} overridden to '{}'", Self::ENV_VAR, value);
                Self::parse(&value)
            }
            None => Ok(WorkspaceLimit::Default),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn allows(&self, required_bytes: u64) -> bool {
        match self {
            WorkspaceLimit::Default => required_bytes <= Self::DEFAULT_BYTES,
            WorkspaceLimit::Unlimited => true,
            WorkspaceLimit::Disabled => false,
            WorkspaceLimit::Bytes(limit) => required_bytes <= *limit,
        }
    }
}

/// Ambient configuration consulted while inferring properties.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    intermediate_data_type: DataType,
    io_data_type: DataType,
    compute_data_type: DataType,
    capabilities: Capabilities,
    workspace_limit: Option<WorkspaceLimit>,
}

impl Default for Context {
    fn default() -> Self {
        Context {
            intermediate_data_type: DataType::NotSet,
            io_data_type: DataType::NotSet,
            compute_data_type: DataType::NotSet,
            capabilities: Capabilities::default(),
            workspace_limit: None,
        }
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_intermediate_data_type(mut self, data_type: DataType) -> Self {
        self.intermediate_data_type = data_type;
        self
    }

    pub fn set_io_data_type(mut self, data_type: DataType) -> Self {
        self.io_data_type = data_type;
        self
    }

    pub fn set_compute_data_type(mut self, data_type: DataType) -> Self {
        self.compute_data_type = data_type;
        self
    }

    pub fn set_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Pin the backward workspace limit, bypassing the environment.
    pub fn set_workspace_limit(mut self, limit: WorkspaceLimit) -> Self {
        self.workspace_limit = Some(limit);
        self
    }

    pub fn intermediate_data_type(&self) -> DataType {
        self.intermediate_data_type
    }

    pub fn io_data_type(&self) -> DataType {
        self.io_data_type
    }

    pub fn compute_data_type(&self) -> DataType {
        self.compute_data_type
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// The pinned limit if any, otherwise the environment override.
    pub fn workspace_limit(&self) -> Result<WorkspaceLimit> {
        match self.workspace_limit {
            Some(limit) => Ok(limit),
            None => WorkspaceLimit::from_env(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn parse_workspace_limit() {
        assert_eq!(WorkspaceLimit::parse("-1"), Ok(WorkspaceLimit::Unlimited));
        assert_eq!(WorkspaceLimit::parse("0"), Ok(WorkspaceLimit::Disabled));
        assert_eq!(
            WorkspaceLimit::parse(" 1048576 "),
            Ok(WorkspaceLimit::Bytes(1_048_576))
        );
        assert_eq!(WorkspaceLimit::parse("-7"), Ok(WorkspaceLimit::Disabled));
        assert_eq!(
            WorkspaceLimit::parse("lots").unwrap_err().code(),
            ErrorCode::AttributeNotSet
        );
    }

    #[test]
    fn lookup_without_override_is_default() {
        assert_eq!(
            WorkspaceLimit::from_lookup(|_| None),
            Ok(WorkspaceLimit::Default)
        );
        assert_eq!(
            WorkspaceLimit::from_lookup(|key| {
                assert_eq!(key, WorkspaceLimit::ENV_VAR);
                Some("4096".to_string())
            }),
            Ok(WorkspaceLimit::Bytes(4096))
        );
    }

    #[test]
    fn limit_boundaries() {
        let limit = WorkspaceLimit::Bytes(1000);
        assert!(limit.allows(999));
        assert!(limit.allows(1000));
        assert!(!limit.allows(1001));
        assert!(WorkspaceLimit::Unlimited.allows(u64::MAX));
        assert!(!WorkspaceLimit::Disabled.allows(0));
        assert!(WorkspaceLimit::Default.allows(WorkspaceLimit::DEFAULT_BYTES));
        assert!(!WorkspaceLimit::Default.allows(WorkspaceLimit::DEFAULT_BYTES + 1));
    }

    #[test]
    fn capability_gates() {
        let old = Capabilities::new(8902, 8);
        assert!(!old.elides_zero_probability_dropout());
        assert!(!old.float_dropout_scale());
        assert!(!old.supports_accumulator_free_backward());
        assert!(old.layernorm_backward_takes_epsilon());

        let hopper = Capabilities::new(8905, 9);
        assert!(hopper.supports_accumulator_free_backward());
        assert!(hopper.virtual_softmax_sum());
        assert!(!Capabilities::new(8905, 8).supports_accumulator_free_backward());
    }
}
