// Shared helpers: weight packing in the micro-kernel layout and wide-integer
// reference implementations the kernels are checked against.
#![allow(dead_code)]

use qconv::kernels::{packed_weights_len, ConvQuantizationParams, NR};
use qconv::ConvShape;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

pub fn random_bytes(rng: &mut SmallRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen::<u8>()).collect()
}

/// Packs `[group][oc][kernel_pos][ic]` weights and `[group][oc]` biases into
/// the q8conv block layout. Padding columns get the kernel zero point and a
/// zero bias so they contribute nothing.
pub fn pack_conv_weights(
    kernel: &[u8],
    bias: &[i32],
    groups: usize,
    group_output_channels: usize,
    kernel_size: usize,
    group_input_channels: usize,
    kernel_zero_point: u8,
) -> Vec<u8> {
    let n_blocks = group_output_channels.div_ceil(NR);
    let block_bytes = packed_weights_len(group_input_channels, kernel_size);
    let mut packed = Vec::with_capacity(groups * n_blocks * block_bytes);
    for group in 0..groups {
        for block in 0..n_blocks {
            let nr_start = block * NR;
            for n in 0..NR {
                let oc = nr_start + n;
                let b = if oc < group_output_channels {
                    bias[group * group_output_channels + oc]
                } else {
                    0
                };
                packed.extend_from_slice(&b.to_ne_bytes());
            }
            for pos in 0..kernel_size {
                for ic in 0..group_input_channels {
                    for n in 0..NR {
                        let oc = nr_start + n;
                        let w = if oc < group_output_channels {
                            kernel[((group * group_output_channels + oc) * kernel_size + pos)
                                * group_input_channels
                                + ic]
                        } else {
                            kernel_zero_point
                        };
                        packed.push(w);
                    }
                }
            }
        }
    }
    packed
}

/// Requantizes with i128 arithmetic: the product rounds half up at 2^-31, the
/// shift rounds half away from zero, every narrowing saturates.
pub fn reference_requantize(acc: i32, params: &ConvQuantizationParams) -> u8 {
    let product = acc as i128 * params.multiplier as i128;
    let q31 = (product + (1i128 << 30)).div_euclid(1i128 << 31);
    let q31 = q31.clamp(i32::MIN as i128, i32::MAX as i128);
    let scaled = if params.right_shift == 0 {
        q31
    } else {
        let half = 1i128 << (params.right_shift - 1);
        let magnitude = (q31.abs() + half) >> params.right_shift;
        if q31 < 0 {
            -magnitude
        } else {
            magnitude
        }
    };
    let narrowed = scaled.clamp(i16::MIN as i128, i16::MAX as i128);
    let shifted = (narrowed + params.output_zero_point as i128)
        .clamp(i16::MIN as i128, i16::MAX as i128);
    let out = shifted.clamp(0, 255) as u8;
    out.clamp(params.output_min, params.output_max)
}

/// Direct convolution accumulators, NHWC `[image][oy][ox][group][oc]`.
/// `kernel` is `[group][oc][ky][kx][ic]`.
pub fn reference_conv_acc(
    shape: &ConvShape,
    group_output_channels: usize,
    input: &[u8],
    kernel: &[u8],
    bias: &[i32],
    kernel_zero_point: u8,
) -> Vec<i32> {
    let gic = shape.group_input_channels;
    let ks = shape.kernel_size();
    let mut out = Vec::new();
    for image in 0..shape.batch_size {
        for oy in 0..shape.output_height {
            for ox in 0..shape.output_width {
                for group in 0..shape.groups {
                    for oc in 0..group_output_channels {
                        let goc = group * group_output_channels + oc;
                        let mut acc = bias[goc] as i64;
                        for ky in 0..shape.kernel_height {
                            let iy = (oy * shape.stride_height + ky * shape.dilation_height) as isize
                                - shape.padding_top as isize;
                            if iy < 0 || iy >= shape.input_height as isize {
                                continue;
                            }
                            for kx in 0..shape.kernel_width {
                                let ix = (ox * shape.stride_width + kx * shape.dilation_width)
                                    as isize
                                    - shape.padding_left as isize;
                                if ix < 0 || ix >= shape.input_width as isize {
                                    continue;
                                }
                                let pixel = ((image * shape.input_height + iy as usize)
                                    * shape.input_width
                                    + ix as usize)
                                    * shape.input_pixel_stride
                                    + group * gic;
                                let pos = ky * shape.kernel_width + kx;
                                for ic in 0..gic {
                                    let x = input[pixel + ic] as i64;
                                    let w = kernel[(goc * ks + pos) * gic + ic] as i64
                                        - kernel_zero_point as i64;
                                    acc += x * w;
                                }
                            }
                        }
                        out.push(acc as i32);
                    }
                }
            }
        }
    }
    out
}

/// Direct transposed-convolution accumulators, same layouts as
/// [`reference_conv_acc`].
pub fn reference_deconv_acc(
    shape: &ConvShape,
    group_output_channels: usize,
    input: &[u8],
    kernel: &[u8],
    bias: &[i32],
    kernel_zero_point: u8,
) -> Vec<i32> {
    let gic = shape.group_input_channels;
    let ks = shape.kernel_size();
    let mut out = Vec::new();
    for image in 0..shape.batch_size {
        for oy in 0..shape.output_height {
            for ox in 0..shape.output_width {
                for group in 0..shape.groups {
                    for oc in 0..group_output_channels {
                        let goc = group * group_output_channels + oc;
                        let mut acc = bias[goc] as i64;
                        for ky in 0..shape.kernel_height {
                            let y = (oy + shape.padding_top) as isize
                                - (ky * shape.dilation_height) as isize;
                            if y < 0 || y % shape.stride_height as isize != 0 {
                                continue;
                            }
                            let iy = (y / shape.stride_height as isize) as usize;
                            if iy >= shape.input_height {
                                continue;
                            }
                            for kx in 0..shape.kernel_width {
                                let x = (ox + shape.padding_left) as isize
                                    - (kx * shape.dilation_width) as isize;
                                if x < 0 || x % shape.stride_width as isize != 0 {
                                    continue;
                                }
                                let ix = (x / shape.stride_width as isize) as usize;
                                if ix >= shape.input_width {
                                    continue;
                                }
                                let pixel = ((image * shape.input_height + iy) * shape.input_width
                                    + ix)
                                    * shape.input_pixel_stride
                                    + group * gic;
                                let pos = ky * shape.kernel_width + kx;
                                for ic in 0..gic {
                                    let x = input[pixel + ic] as i64;
                                    let w = kernel[(goc * ks + pos) * gic + ic] as i64
                                        - kernel_zero_point as i64;
                                    acc += x * w;
                                }
                            }
                        }
                        out.push(acc as i32);
                    }
                }
            }
        }
    }
    out
}
