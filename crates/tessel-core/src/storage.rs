use std::sync::Arc;

/// Shared, reference-counted f32 storage.
///
/// Views produced by `reshape`/`transpose` share one allocation. Mutation goes
/// through `as_mut_slice`, which clones the buffer first if it is shared.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Vec<f32>>,
}

impl Storage {
    /// Allocate `numel` zero-initialised elements.
    pub fn zeros(numel: usize) -> Self {
        Self {
            data: Arc::new(vec![0.0; numel]),
        }
    }

    /// Take ownership of an existing buffer.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Read-only view of the whole buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the whole buffer (copy-on-write).
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Whether this storage is uniquely owned (no other Arc references).
    pub fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    /// Unwrap into the owned buffer, cloning only if it is shared.
    pub fn into_vec(self) -> Vec<f32> {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| shared.as_ref().clone())
    }
}
