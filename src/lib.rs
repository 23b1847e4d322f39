//! Indirect quantized 2-D convolution.
//!
//! [`kernels::indirection`] precomputes, per operator shape, where every
//! (kernel position, output pixel) pair reads its input from, and
//! [`kernels::q8conv`] consumes that table to produce 8x8 tiles of uint8
//! output without an im2col copy.
pub mod kernels;
pub mod shape;

pub use kernels::conv2d::{q8conv_2d, Q8ConvContext, Q8ConvTile};
pub use kernels::indirection::{IndirectionBuffer, IndirectionEntry};
pub use kernels::q8conv::{compute_tile, Q8ConvInput, MR, NR};
pub use kernels::requantization::{ConvQuantizationParams, QuantizationError};
pub use shape::{ConvError, ConvShape, OperatorKind};
