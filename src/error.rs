//! Error types for the qicode compiler

use thiserror::Error;

/// Compilation errors
///
/// Every pass fails fast with one of these; a failing program yields no
/// instruction stream for any cell.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Type inference found two incompatible types for the same expression
    ///
    /// **Triggered by:** Using one variable in positions that demand different types
    /// **Example:** `wait(c, x)` followed by `record(c, 20e-9).state_to(x)`
    ///
    /// The message carries the rendered justification chain of both assignments.
    #[error("{message}")]
    TypeConflict {
        /// Rendered causal explanation
        message: String,
    },

    /// A register was read before anything was written to it
    ///
    /// **Triggered by:** Waiting on or branching over a variable that was never assigned
    /// **Example:** `wait(c, t)` where `t` was declared without an initial value
    #[error("Variable at Register {register} has not been properly initialised")]
    UnboundVariable {
        /// Hardware register number
        register: u8,
    },

    /// Operation not supported for the operand types
    ///
    /// **Triggered by:** Non-normal array index, If or While conditions that are
    /// no comparison, runtime start values on time loops
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The command tree or builder usage is malformed
    ///
    /// **Triggered by:** Conflicting Parallel recording parameters, nested program
    /// builders, duplicate entry points, `else_` without a preceding If
    #[error("Structural error: {0}")]
    StructuralError(String),

    /// A value cannot be represented in its instruction field
    #[error("Encoding range error: {0}")]
    EncodingRangeError(String),

    /// A deferred cell property has no entry in the parameter table
    #[error("Cell {cell} has no value for property '{name}'")]
    MissingProperty {
        /// Cell index
        cell: usize,
        /// Property name
        name: String,
    },

    /// Requested entry point does not exist in the compiled program
    #[error("Unknown entry point: {0}")]
    UnknownEntryPoint(String),

    /// The external loader rejected the program
    ///
    /// **Triggered by:** [`Loader`](crate::compiler::Loader) implementations failing to load
    /// or start a cell; [`CompiledProgram::upload`](crate::compiler::CompiledProgram::upload)
    /// passes the error on unchanged
    #[error("Loader error: {0}")]
    Loader(String),
}

/// Error severity classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The program itself is invalid and must be changed
    Fatal,
    /// Compilation or upload may succeed with different inputs (parameter table, loader)
    Recoverable,
}

impl Error {
    /// Create a type conflict error from a rendered message
    pub fn type_conflict(msg: impl Into<String>) -> Self {
        Error::TypeConflict {
            message: msg.into(),
        }
    }

    /// Create a structural error with a message
    pub fn structural(msg: impl Into<String>) -> Self {
        Error::StructuralError(msg.into())
    }

    /// Create an unsupported-operation error with a message
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::UnsupportedOperation(msg.into())
    }

    /// Create an encoding range error with a message
    pub fn encoding(msg: impl Into<String>) -> Self {
        Error::EncodingRangeError(msg.into())
    }

    /// Create a loader error; meant for [`Loader`](crate::compiler::Loader) implementations
    pub fn loader(msg: impl Into<String>) -> Self {
        Error::Loader(msg.into())
    }

    /// Classify error severity
    pub fn classify(&self) -> ErrorSeverity {
        match self {
            Error::MissingProperty { .. } => ErrorSeverity::Recoverable,
            Error::UnknownEntryPoint(_) => ErrorSeverity::Recoverable,
            Error::Loader(_) => ErrorSeverity::Recoverable,
            _ => ErrorSeverity::Fatal,
        }
    }
}

/// Result type for qicode operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_variable_message() {
        let err = Error::UnboundVariable { register: 3 };
        assert_eq!(
            err.to_string(),
            "Variable at Register 3 has not been properly initialised"
        );
    }

    #[test]
    fn test_type_conflict_is_verbatim() {
        let err = Error::type_conflict("x was of type TIME");
        assert_eq!(err.to_string(), "x was of type TIME");
        assert_eq!(err.classify(), ErrorSeverity::Fatal);
    }

    #[test]
    fn test_missing_property_is_recoverable() {
        let err = Error::MissingProperty {
            cell: 0,
            name: "rec_offset".to_string(),
        };
        assert_eq!(err.classify(), ErrorSeverity::Recoverable);
        assert!(err.to_string().contains("rec_offset"));
    }
}
