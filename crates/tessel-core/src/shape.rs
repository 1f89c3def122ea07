use smallvec::SmallVec;
use std::fmt;

/// Dimensions of a tensor, stored inline up to rank 4.
///
/// Attention operands are (batch, heads, sequence, features), so the common
/// case never touches the heap.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Rank.
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Product of the dimensions. Rank 0 holds one element.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn dim(&self, axis: usize) -> Option<usize> {
        self.dims.get(axis).copied()
    }

    /// True when some extent is zero.
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    /// Row-major strides: `stride_k = Π_{j>k} dim_j`.
    pub fn contiguous_strides(&self) -> SmallVec<[usize; 4]> {
        let mut strides: SmallVec<[usize; 4]> = SmallVec::from_elem(1, self.dims.len());
        let mut acc = 1;
        for (stride, &dim) in strides.iter_mut().zip(&self.dims).rev() {
            *stride = acc;
            acc *= dim;
        }
        strides
    }

    /// Shape with axes `a` and `b` exchanged, or None if either is out of range.
    pub fn swap_axes(&self, a: usize, b: usize) -> Option<Shape> {
        if a.max(b) >= self.ndim() {
            return None;
        }
        let mut dims = self.dims.clone();
        dims.swap(a, b);
        Some(Shape { dims })
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}
