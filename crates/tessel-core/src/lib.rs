//! # tessel-core
//!
//! Host-side tensor plumbing for the tessel attention kernels.
//!
//! Provides:
//! - `Tensor`: shaped, reference-counted f32 buffers with zero-copy views
//! - `Shape`: stack-allocated dimensions and row-major strides
//! - `StridedView` / `StridedViewMut`: bounds-checked multi-index access
//!   over flat row-major buffers
//! - `TesselError`: the error type shared by every tessel crate

pub mod error;
pub mod shape;
pub mod storage;
pub mod strided;
pub mod tensor;
pub mod prelude;

pub use error::TesselError;
pub use shape::Shape;
pub use storage::Storage;
pub use strided::{StridedView, StridedViewMut};
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, TesselError>;
