//! Bounds-checked multi-index views over flat row-major buffers.
//!
//! Every attention kernel addresses Q, K, V, O and its scratch buffers through
//! these views, so the row-major offset formula
//!
//! ```text
//! offset = Σ index_k · stride_k,   stride_k = Π_{j>k} dim_j
//! ```
//!
//! lives here and nowhere else. For a 2D buffer of row length `n` this is
//! `x·n + y`; for a (B, H, N, d) buffer it is `b·(H·N·d) + h·(N·d) + i·d + j`.
//!
//! Out-of-range indices are reported as [`TesselError::IndexOutOfBounds`].
//! Slices handed out by `slice_at`/`rows` are ordinary Rust slices, so hot
//! loops can index them directly after one checked lookup.

use smallvec::SmallVec;

use crate::{Result, Shape, TesselError};

#[derive(Debug, Clone)]
struct Layout {
    dims: SmallVec<[usize; 4]>,
    strides: SmallVec<[usize; 4]>,
}

impl Layout {
    fn new(len: usize, dims: &[usize]) -> Result<Self> {
        let shape = Shape::new(dims);
        if shape.numel() != len {
            return Err(TesselError::BufferLength {
                expected: shape.numel(),
                got: len,
            });
        }
        Ok(Self {
            strides: shape.contiguous_strides(),
            dims: SmallVec::from_slice(dims),
        })
    }

    fn out_of_bounds(&self, index: &[usize]) -> TesselError {
        TesselError::IndexOutOfBounds {
            index: index.to_vec(),
            dims: self.dims.to_vec(),
        }
    }

    fn offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.dims.len() {
            return Err(self.out_of_bounds(index));
        }
        self.prefix_offset(index)
    }

    fn prefix_offset(&self, prefix: &[usize]) -> Result<usize> {
        if prefix.len() > self.dims.len() {
            return Err(self.out_of_bounds(prefix));
        }
        let mut offset = 0;
        for ((&i, &dim), &stride) in prefix.iter().zip(&self.dims).zip(&self.strides) {
            if i >= dim {
                return Err(self.out_of_bounds(prefix));
            }
            offset += i * stride;
        }
        Ok(offset)
    }

    /// Offset and length of the contiguous block addressed by `prefix`.
    fn span(&self, prefix: &[usize]) -> Result<(usize, usize)> {
        let offset = self.prefix_offset(prefix)?;
        let len = match prefix.len() {
            0 => self.dims.iter().product(),
            n => self.strides[n - 1],
        };
        Ok((offset, len))
    }

    /// Offset and length of leading-axis entries `start..start + count`.
    fn rows(&self, start: usize, count: usize) -> Result<(usize, usize)> {
        match (self.dims.first(), self.strides.first()) {
            (Some(&dim), Some(&stride))
                if start.checked_add(count).is_some_and(|end| end <= dim) =>
            {
                Ok((start * stride, count * stride))
            }
            _ => Err(self.out_of_bounds(&[start, count])),
        }
    }
}

/// Read-only strided view over a flat f32 buffer.
#[derive(Debug, Clone)]
pub struct StridedView<'a> {
    data: &'a [f32],
    layout: Layout,
}

impl<'a> StridedView<'a> {
    /// View `data` as a row-major array with the given dimensions.
    pub fn new(data: &'a [f32], dims: &[usize]) -> Result<Self> {
        Ok(Self {
            layout: Layout::new(data.len(), dims)?,
            data,
        })
    }

    /// View `data` as a `rows × cols` matrix.
    pub fn matrix(data: &'a [f32], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, &[rows, cols])
    }

    pub fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.layout.strides
    }

    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }

    /// Flat offset of a full multi-index.
    pub fn offset(&self, index: &[usize]) -> Result<usize> {
        self.layout.offset(index)
    }

    pub fn get(&self, index: &[usize]) -> Result<f32> {
        Ok(self.data[self.layout.offset(index)?])
    }

    /// Contiguous sub-block addressed by a leading index prefix.
    ///
    /// For a (B, H, N, d) view, `slice_at(&[b, h])` is the N·d head slab and
    /// `slice_at(&[b, h, i])` is one d-length row.
    pub fn slice_at(&self, prefix: &[usize]) -> Result<&'a [f32]> {
        let (offset, len) = self.layout.span(prefix)?;
        Ok(&self.data[offset..offset + len])
    }

    /// Entry `i` of the leading axis (a row, for a matrix).
    pub fn row(&self, i: usize) -> Result<&'a [f32]> {
        self.slice_at(&[i])
    }

    /// Leading-axis entries `start..start + count` as one contiguous slice.
    pub fn rows(&self, start: usize, count: usize) -> Result<&'a [f32]> {
        let (offset, len) = self.layout.rows(start, count)?;
        Ok(&self.data[offset..offset + len])
    }
}

/// Mutable strided view over a flat f32 buffer.
#[derive(Debug)]
pub struct StridedViewMut<'a> {
    data: &'a mut [f32],
    layout: Layout,
}

impl<'a> StridedViewMut<'a> {
    pub fn new(data: &'a mut [f32], dims: &[usize]) -> Result<Self> {
        Ok(Self {
            layout: Layout::new(data.len(), dims)?,
            data,
        })
    }

    pub fn matrix(data: &'a mut [f32], rows: usize, cols: usize) -> Result<Self> {
        Self::new(data, &[rows, cols])
    }

    pub fn dims(&self) -> &[usize] {
        &self.layout.dims
    }

    pub fn as_slice(&self) -> &[f32] {
        &*self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut *self.data
    }

    pub fn offset(&self, index: &[usize]) -> Result<usize> {
        self.layout.offset(index)
    }

    pub fn get(&self, index: &[usize]) -> Result<f32> {
        Ok(self.data[self.layout.offset(index)?])
    }

    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        let offset = self.layout.offset(index)?;
        self.data[offset] = value;
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    pub fn slice_at_mut(&mut self, prefix: &[usize]) -> Result<&mut [f32]> {
        let (offset, len) = self.layout.span(prefix)?;
        Ok(&mut self.data[offset..offset + len])
    }

    pub fn row(&self, i: usize) -> Result<&[f32]> {
        let (offset, len) = self.layout.span(&[i])?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn row_mut(&mut self, i: usize) -> Result<&mut [f32]> {
        self.slice_at_mut(&[i])
    }

    /// Read-only reborrow, for handing the buffer to code that only reads it.
    pub fn view(&self) -> StridedView<'_> {
        StridedView {
            data: &*self.data,
            layout: self.layout.clone(),
        }
    }
}
