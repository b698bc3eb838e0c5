use thiserror::Error;

/// Coarse classification of a [`GraphError`], stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AttributeNotSet,
    GraphNotSupported,
    InvalidValue,
    InvalidState,
    Runtime,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// A required port is missing, two mutually exclusive attributes are both set,
    /// or the context is missing configuration the node depends on.
    #[error("attribute not set: {0}")]
    AttributeNotSet(String),
    /// A structural or numeric constraint of the target backend is violated.
    #[error("graph not supported: {0}")]
    GraphNotSupported(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// A node was driven through its phases out of order, or re-entered.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Failure reported by the execution handle while materializing constants.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl GraphError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GraphError::AttributeNotSet(_) => ErrorCode::AttributeNotSet,
            GraphError::GraphNotSupported(_) => ErrorCode::GraphNotSupported,
            GraphError::InvalidValue(_) => ErrorCode::InvalidValue,
            GraphError::InvalidState(_) => ErrorCode::InvalidState,
            GraphError::Runtime(_) => ErrorCode::Runtime,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Return early with the given [`GraphError`] variant when the condition does not hold.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $variant:ident, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::GraphError::$variant(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    fn check_positive(value: i64) -> Result<i64> {
        ensure!(value > 0, InvalidValue, "expected a positive value, got {}", value);
        Ok(value)
    }

    #[test]
    fn ensure_returns_typed_error() {
        assert_eq!(check_positive(3), Ok(3));
        let err = check_positive(-1).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidValue);
        assert_eq!(
            err.to_string(),
            "invalid value: expected a positive value, got -1"
        );
    }
}
