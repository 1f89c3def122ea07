//! Convenience re-exports for common tessel-core types.
//!
//! ```rust
//! use tessel_core::prelude::*;
//! ```

pub use crate::Result;
pub use crate::Shape;
pub use crate::StridedView;
pub use crate::StridedViewMut;
pub use crate::Tensor;
pub use crate::TesselError;
