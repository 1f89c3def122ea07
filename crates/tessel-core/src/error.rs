/// Errors produced by tessel tensors, views and kernels.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TesselError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("Buffer holds {got} elements but its shape requires {expected}")]
    BufferLength { expected: usize, got: usize },

    #[error("Index {index:?} is out of bounds for dims {dims:?}")]
    IndexOutOfBounds { index: Vec<usize>, dims: Vec<usize> },

    #[error("Tensor with dims {dims:?} is not contiguous; call contiguous() first")]
    NotContiguous { dims: Vec<usize> },

    #[error("Invalid block size for {name}: {value} (must be at least 1)")]
    InvalidBlockSize { name: &'static str, value: usize },

    #[error("Invalid score scale: {0} (must be finite and non-zero)")]
    InvalidScale(f32),

    #[error("Softmax row has no probability mass (batch {batch}, head {head}, row {row})")]
    DegenerateNormalization { batch: usize, head: usize, row: usize },

    #[error("Failed to build thread pool: {0}")]
    ThreadPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_values() {
        let e = TesselError::InvalidBlockSize { name: "key_block", value: 0 };
        assert_eq!(e.to_string(), "Invalid block size for key_block: 0 (must be at least 1)");

        let e = TesselError::ShapeMismatch { expected: vec![1, 2, 3, 4], got: vec![1, 2, 3] };
        assert!(e.to_string().contains("[1, 2, 3, 4]"));
    }
}
