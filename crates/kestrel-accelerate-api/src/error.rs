use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failure raised while building or dispatching an operator.
///
/// Every variant aborts the current operator; none of them are retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Unsupported configuration, malformed attribute or shape mismatch.
    #[error("{context}: {message}")]
    Config { context: String, message: String },

    /// Kernel compilation failed for the given program/kernel pair.
    #[error("failed to build kernel '{kernel}' from program '{program}': {reason}")]
    Build {
        program: String,
        kernel: String,
        reason: String,
    },

    /// Device memory could not be allocated.
    #[error("out of device memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: u64, available: u64 },

    /// The bounds guard observed an out-of-range access.
    #[error("kernel '{kernel}' accessed device memory out of range")]
    OutOfRange { kernel: String },

    /// Queue or backend failure.
    #[error("device error: {0}")]
    Device(String),
}

impl DispatchError {
    pub fn config(context: impl Into<String>, message: impl Into<String>) -> Self {
        DispatchError::Config {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn build(
        program: impl Into<String>,
        kernel: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DispatchError::Build {
            program: program.into(),
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    pub fn device(message: impl Into<String>) -> Self {
        DispatchError::Device(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, DispatchError::Config { .. })
    }

    pub fn is_build(&self) -> bool {
        matches!(self, DispatchError::Build { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, DispatchError::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_carries_offending_value() {
        let err = DispatchError::config("winograd", "unsupported block size 3");
        assert!(err.is_config());
        assert_eq!(err.to_string(), "winograd: unsupported block size 3");
    }

    #[test]
    fn build_error_names_program_and_kernel() {
        let err = DispatchError::build("matmul", "k1234", "unknown entry point");
        assert!(err.is_build());
        let text = err.to_string();
        assert!(text.contains("matmul"));
        assert!(text.contains("k1234"));
    }
}
