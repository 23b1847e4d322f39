pub mod conv2d;
pub mod indirection;
pub mod q8conv;
pub mod requantization;
pub mod utils;
pub use conv2d::{q8conv_2d, Q8ConvContext, Q8ConvTile};
pub use indirection::{
    conv2d_indirection_len, init_conv2d, init_deconv2d, init_dwconv2d, init_maxpool2d,
    tiled_output_size, IndirectionBuffer, IndirectionEntry, IndirectionLayout, IndirectionSteps,
};
pub use q8conv::{compute_tile, packed_weights_len, Q8ConvInput, MR, NR};
pub use requantization::{
    q31_mul, requantize_q31, rounding_shift_right, ConvQuantizationParams, QuantizationError,
};
