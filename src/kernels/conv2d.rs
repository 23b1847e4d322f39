use crate::kernels::indirection::{IndirectionBuffer, IndirectionLayout};
use crate::kernels::q8conv::{compute_tile, packed_weights_len, Q8ConvInput, MR, NR};
use crate::kernels::requantization::ConvQuantizationParams;
use crate::kernels::utils;
use crate::shape::{ConvError, ConvShape};

/// One micro-kernel invocation: an `mr x nr` block of the output of one
/// group of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Q8ConvTile {
    pub group: usize,
    pub image: usize,
    pub mr_block_start: usize,
    pub mr_block_size: usize,
    pub nr_block_start: usize,
    pub nr_block_size: usize,
}

/// Everything a q8conv / q8deconv run needs besides the output, checked once
/// so that tiles can be computed without further validation.
///
/// `packed_weights` holds, per group, `ceil(group_output_channels / NR)`
/// blocks of `packed_weights_len(group_input_channels, kernel_size)` bytes.
/// The output is NHWC with `output_pixel_stride` elements per pixel.
#[derive(Debug, Clone, Copy)]
pub struct Q8ConvContext<'a> {
    shape: &'a ConvShape,
    group_output_channels: usize,
    indirection: &'a IndirectionBuffer,
    tiled_output_size: usize,
    input: Q8ConvInput<'a>,
    packed_weights: &'a [u8],
    params: &'a ConvQuantizationParams,
    output_pixel_stride: usize,
}

impl<'a> Q8ConvContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shape: &'a ConvShape,
        group_output_channels: usize,
        indirection: &'a IndirectionBuffer,
        input: Q8ConvInput<'a>,
        packed_weights: &'a [u8],
        params: &'a ConvQuantizationParams,
        output_pixel_stride: usize,
    ) -> Result<Self, ConvError> {
        shape.validate(indirection.kind())?;
        if group_output_channels == 0 {
            return Err(ConvError::ZeroDimension("group_output_channels"));
        }
        params.validate()?;
        // Offsets are only in bounds for the input extent and pixel stride
        // the buffer was built with.
        if indirection.shape() != shape {
            return Err(ConvError::IndirectionLayout);
        }
        let tiled_output_size = match indirection.layout() {
            IndirectionLayout::Tiled {
                batch_size,
                kernel_size,
                tile_size,
                tiled_output_size,
            } if tile_size == MR
                && batch_size == shape.batch_size
                && kernel_size == shape.kernel_size()
                && tiled_output_size >= shape.output_size() =>
            {
                tiled_output_size
            }
            _ => return Err(ConvError::IndirectionLayout),
        };
        check_len(
            "indirection",
            crate::kernels::indirection::conv2d_indirection_len(shape, MR),
            indirection.len(),
        )?;
        check_len("input", shape.input_len(), input.data.len())?;
        check_len("zero", shape.group_input_channels, input.zero.len())?;

        let n_blocks = utils::divide_round_up(group_output_channels, NR);
        let block_bytes = packed_weights_len(shape.group_input_channels, shape.kernel_size());
        check_len(
            "packed weights",
            shape.groups * n_blocks * block_bytes,
            packed_weights.len(),
        )?;

        let output_channels = shape.groups * group_output_channels;
        if output_pixel_stride < output_channels {
            return Err(ConvError::PixelStrideTooSmall {
                stride: output_pixel_stride,
                channels: output_channels,
            });
        }
        Ok(Self {
            shape,
            group_output_channels,
            indirection,
            tiled_output_size,
            input,
            packed_weights,
            params,
            output_pixel_stride,
        })
    }

    /// Output elements the run writes into, counted from the first pixel.
    pub fn output_len(&self) -> usize {
        let pixels = self.shape.batch_size * self.shape.output_size();
        (pixels - 1) * self.output_pixel_stride + self.shape.groups * self.group_output_channels
    }

    /// Every tile of the run. Tiles write disjoint output elements, so they
    /// may be computed in any order or concurrently.
    pub fn tiles(&self) -> impl Iterator<Item = Q8ConvTile> + '_ {
        let output_size = self.shape.output_size();
        let group_output_channels = self.group_output_channels;
        (0..self.shape.groups).flat_map(move |group| {
            (0..self.shape.batch_size).flat_map(move |image| {
                (0..output_size).step_by(MR).flat_map(move |mr_block_start| {
                    (0..group_output_channels)
                        .step_by(NR)
                        .map(move |nr_block_start| Q8ConvTile {
                            group,
                            image,
                            mr_block_start,
                            mr_block_size: MR.min(output_size - mr_block_start),
                            nr_block_start,
                            nr_block_size: NR.min(group_output_channels - nr_block_start),
                        })
                })
            })
        })
    }

    /// Computes one tile into `output`, which must hold `output_len()`
    /// elements.
    pub fn compute(&self, tile: &Q8ConvTile, output: &mut [u8]) {
        let shape = self.shape;
        let kernel_size = shape.kernel_size();
        let a_start = ((tile.group * shape.batch_size + tile.image) * self.tiled_output_size
            + tile.mr_block_start)
            * kernel_size;
        let a = &self.indirection.entries()[a_start..a_start + kernel_size * MR];

        let n_blocks = utils::divide_round_up(self.group_output_channels, NR);
        let block_bytes = packed_weights_len(shape.group_input_channels, kernel_size);
        let block = tile.group * n_blocks + tile.nr_block_start / NR;
        let w = &self.packed_weights[block * block_bytes..(block + 1) * block_bytes];

        let c_start = (tile.image * shape.output_size() + tile.mr_block_start)
            * self.output_pixel_stride
            + tile.group * self.group_output_channels
            + tile.nr_block_start;
        compute_tile(
            tile.mr_block_size,
            tile.nr_block_size,
            shape.group_input_channels,
            kernel_size,
            a,
            &self.input,
            w,
            &mut output[c_start..],
            self.output_pixel_stride,
            self.params,
        );
    }
}

fn check_len(what: &'static str, required: usize, actual: usize) -> Result<(), ConvError> {
    if actual < required {
        return Err(ConvError::BufferTooSmall {
            what,
            required,
            actual,
        });
    }
    Ok(())
}

/// Runs a whole quantized convolution (or transposed convolution, depending
/// on how `indirection` was built) tile by tile on the calling thread.
#[allow(clippy::too_many_arguments)]
pub fn q8conv_2d(
    shape: &ConvShape,
    group_output_channels: usize,
    indirection: &IndirectionBuffer,
    input: Q8ConvInput<'_>,
    packed_weights: &[u8],
    params: &ConvQuantizationParams,
    output: &mut [u8],
    output_pixel_stride: usize,
) -> Result<(), ConvError> {
    let context = Q8ConvContext::new(
        shape,
        group_output_channels,
        indirection,
        input,
        packed_weights,
        params,
        output_pixel_stride,
    )?;
    check_len("output", context.output_len(), output.len())?;
    log::trace!(
        "q8conv {}x{}x{} -> {}x{}x{} ({} groups, {} images)",
        shape.input_height,
        shape.input_width,
        shape.group_input_channels,
        shape.output_height,
        shape.output_width,
        group_output_channels,
        shape.groups,
        shape.batch_size
    );
    for tile in context.tiles() {
        context.compute(&tile, output);
    }
    Ok(())
}
