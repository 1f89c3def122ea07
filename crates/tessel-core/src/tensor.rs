use std::fmt;

use smallvec::SmallVec;

use crate::error::TesselError;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::strided::StridedView;
use crate::Result;

/// A shaped f32 array backed by shared, row-major storage.
///
/// This is the host-side tensor the attention kernels consume and produce:
/// it reports its shape, exports a contiguous flat buffer, rebuilds itself
/// from a buffer plus a shape, and allocates zero-filled outputs.
///
/// # Examples
///
/// ```
/// use tessel_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// assert_eq!(t.shape().dims(), &[2, 3]);
///
/// // Transpose is a zero-copy view; contiguous() materialises it.
/// let tt = t.transpose(0, 1).unwrap();
/// assert!(!tt.is_contiguous());
/// assert_eq!(tt.contiguous().to_vec(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 4]>,
    offset: usize,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor by copying f32 data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape. Use [`Tensor::from_vec`]
    /// for a checked constructor.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::from_storage(Storage::from_vec(data.to_vec()), s)
    }

    /// Rebuild a tensor from a flat row-major buffer and its shape.
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(TesselError::BufferLength {
                expected: s.numel(),
                got: data.len(),
            });
        }
        Ok(Self::from_storage(Storage::from_vec(data), s))
    }

    /// Zero-initialised tensor of the given shape.
    pub fn zeros(shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        Self::from_storage(Storage::zeros(s.numel()), s)
    }

    fn from_storage(storage: Storage, shape: Shape) -> Self {
        Self {
            strides: shape.contiguous_strides(),
            storage,
            shape,
            offset: 0,
        }
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Strides (in elements, not bytes).
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Whether this tensor is laid out row-major with no offset.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.storage.numel() == self.numel()
            && self.strides == self.shape.contiguous_strides()
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Flat f32 data (contiguous tensors only).
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        if !self.is_contiguous() {
            return None;
        }
        Some(self.storage.as_slice())
    }

    /// Mutable flat f32 data (contiguous tensors only, copy-on-write).
    pub fn as_f32_slice_mut(&mut self) -> Option<&mut [f32]> {
        if !self.is_contiguous() {
            return None;
        }
        Some(self.storage.as_mut_slice())
    }

    /// Bounds-checked strided view over a contiguous tensor.
    pub fn view(&self) -> Result<StridedView<'_>> {
        let data = self.as_f32_slice().ok_or_else(|| TesselError::NotContiguous {
            dims: self.dims().to_vec(),
        })?;
        StridedView::new(data, self.dims())
    }

    /// Read one element by multi-index, honouring strides and offset.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        if index.len() != self.ndim() || index.iter().zip(self.dims()).any(|(&i, &d)| i >= d) {
            return Err(TesselError::IndexOutOfBounds {
                index: index.to_vec(),
                dims: self.dims().to_vec(),
            });
        }
        let physical = self.offset
            + index
                .iter()
                .zip(&self.strides)
                .map(|(&i, &s)| i * s)
                .sum::<usize>();
        Ok(self.storage.as_slice()[physical])
    }

    /// Contiguous copy of this tensor (cheap clone if already contiguous).
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        let data = self.gather();
        Self::from_storage(Storage::from_vec(data), self.shape.clone())
    }

    /// Export the elements as a flat row-major buffer.
    pub fn to_vec(&self) -> Vec<f32> {
        match self.as_f32_slice() {
            Some(s) => s.to_vec(),
            None => self.gather(),
        }
    }

    /// Consume the tensor into a flat row-major buffer, avoiding a copy when
    /// the storage is contiguous and not shared.
    pub fn into_vec(self) -> Vec<f32> {
        if self.is_contiguous() {
            self.storage.into_vec()
        } else {
            self.gather()
        }
    }

    /// Walk the logical index space in row-major order and collect elements.
    fn gather(&self) -> Vec<f32> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }
        let src = self.storage.as_slice();
        let dims = self.dims();
        let mut index: SmallVec<[usize; 4]> = SmallVec::from_elem(0, dims.len());
        for _ in 0..numel {
            let physical = self.offset
                + index
                    .iter()
                    .zip(&self.strides)
                    .map(|(&i, &s)| i * s)
                    .sum::<usize>();
            out.push(src[physical]);
            for axis in (0..dims.len()).rev() {
                index[axis] += 1;
                if index[axis] < dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        out
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Zero-copy reshape of a contiguous tensor.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let target = Shape::new(shape);
        if target.numel() != self.numel() {
            return Err(TesselError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: shape.to_vec(),
            });
        }
        let base = self.contiguous();
        Ok(Self::from_storage(base.storage, target))
    }

    /// Zero-copy view with axes `a` and `b` exchanged.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Tensor> {
        let shape = self.shape.swap_axes(a, b).ok_or_else(|| TesselError::IndexOutOfBounds {
            index: vec![a, b],
            dims: self.dims().to_vec(),
        })?;
        let mut strides = self.strides.clone();
        strides.swap(a, b);
        Ok(Self {
            storage: self.storage.clone(),
            shape,
            strides,
            offset: self.offset,
        })
    }

    /// Largest element-wise absolute difference to `other`.
    pub fn max_abs_diff(&self, other: &Tensor) -> Result<f32> {
        if self.dims() != other.dims() {
            return Err(TesselError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: other.dims().to_vec(),
            });
        }
        let a = self.to_vec();
        let b = other.to_vec();
        Ok(a.iter()
            .zip(&b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max))
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides.as_slice())
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}
