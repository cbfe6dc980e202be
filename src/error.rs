//! Build-time and launch-time errors.
//!
//! Nothing in the merge algebra returns an error: numeric conditions (overflow,
//! NaN) propagate through IEEE semantics. Errors only surface while a formula or a
//! reduction is being assembled, or while the host dispatcher checks buffers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReductionError {
    #[error("dimension mismatch in {op}: {left} vs {right}")]
    DimensionMismatch {
        op: &'static str,
        left: usize,
        right: usize,
    },
    #[error("max-sum-shift-exp requires a scalar first formula, got dimension {dim}")]
    ScalarFormulaRequired { dim: usize },
    #[error("gradient target must be a variable, got {0}")]
    NotAVariable(String),
    #[error("extract [{start}, {start}+{dim}) out of range for dimension {arg_dim}")]
    ExtractOutOfRange {
        start: usize,
        dim: usize,
        arg_dim: usize,
    },
    #[error("variable {index} declared with conflicting signatures: {first} and {second}")]
    ConflictingVariable {
        index: usize,
        first: String,
        second: String,
    },
    #[error("missing argument buffer for variable {0}")]
    MissingArgument(usize),
    #[error("argument {index}: expected at least {expected} elements, got {actual}")]
    BufferLength {
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("output buffer: expected {expected} elements, got {actual}")]
    OutputLength { expected: usize, actual: usize },
    #[error("invalid ranges: {0}")]
    InvalidRanges(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type ReductionResult<T> = Result<T, ReductionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_formula_message_names_dimension() {
        let err = ReductionError::ScalarFormulaRequired { dim: 3 };
        assert!(err.to_string().contains("dimension 3"));
    }

    #[test]
    fn buffer_length_message() {
        let err = ReductionError::BufferLength {
            index: 2,
            expected: 30,
            actual: 12,
        };
        let s = err.to_string();
        assert!(s.contains("argument 2"));
        assert!(s.contains("30"));
        assert!(s.contains("12"));
    }

    #[test]
    fn config_parse_from_serde() {
        let parse: Result<u32, _> = serde_json::from_str("not json");
        let err: ReductionError = parse.unwrap_err().into();
        assert!(matches!(err, ReductionError::ConfigParse(_)));
    }
}
