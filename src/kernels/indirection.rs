use crate::kernels::utils;
use crate::shape::{ConvShape, OperatorKind};

/// One slot of an indirection buffer: either the element offset of the first
/// channel of an input pixel, or a reference to the shared zero pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IndirectionEntry {
    Offset(usize),
    #[default]
    ZeroFill,
}

impl IndirectionEntry {
    /// Resolves the entry to `len` elements of either `input` or `zero`.
    #[inline(always)]
    pub fn resolve<'a, T>(self, input: &'a [T], zero: &'a [T], len: usize) -> &'a [T] {
        match self {
            IndirectionEntry::Offset(offset) => &input[offset..offset + len],
            IndirectionEntry::ZeroFill => &zero[..len],
        }
    }

    pub fn offset(self) -> Option<usize> {
        match self {
            IndirectionEntry::Offset(offset) => Some(offset),
            IndirectionEntry::ZeroFill => None,
        }
    }

    pub fn is_zero_fill(self) -> bool {
        matches!(self, IndirectionEntry::ZeroFill)
    }
}

/// Output size rounded up to whole tiles.
pub fn tiled_output_size(output_size: usize, tile_size: usize) -> usize {
    utils::round_up(output_size, tile_size)
}

/// Slot count of a tiled (conv / deconv) indirection buffer.
pub fn conv2d_indirection_len(shape: &ConvShape, tile_size: usize) -> usize {
    shape.groups
        * shape.batch_size
        * shape.kernel_size()
        * tiled_output_size(shape.output_size(), tile_size)
}

/// Row steps of the per-output-row layouts used by depthwise convolution and
/// max-pooling.
///
/// Horizontally adjacent output pixels start `step_width * kernel_height`
/// slots apart, so windows that overlap in the input share slots. Each output
/// row occupies `step_height` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectionSteps {
    pub step_height: usize,
    pub step_width: usize,
}

impl IndirectionSteps {
    pub fn depthwise(shape: &ConvShape) -> Self {
        let step_width = if shape.dilation_width == 1 {
            shape.stride_width
        } else {
            shape.kernel_width
        };
        Self::with_step_width(shape, step_width)
    }

    pub fn pooling(shape: &ConvShape) -> Self {
        let step_width = if shape.dilation_width > 1 {
            shape.kernel_width
        } else {
            shape.stride_width.min(shape.kernel_width)
        };
        Self::with_step_width(shape, step_width)
    }

    fn with_step_width(shape: &ConvShape, step_width: usize) -> Self {
        let step_height =
            shape.kernel_size() + (shape.output_width * step_width - 1) * shape.kernel_height;
        Self {
            step_height,
            step_width,
        }
    }

    pub fn indirection_len(&self, shape: &ConvShape) -> usize {
        shape.batch_size * shape.output_height * self.step_height
    }
}

/// Fills the tiled convolution layout
/// `[group][image][tile][kernel_y][kernel_x][tile_offset]`.
///
/// The last tile may run past the output map; its extra slots repeat the
/// last output pixel.
pub fn init_conv2d(
    shape: &ConvShape,
    output_tile_size: usize,
    tiled_output_size: usize,
    buffer: &mut [IndirectionEntry],
) {
    let output_size = shape.output_size();
    let kernel_size = shape.kernel_size();
    let input_height = shape.input_height;
    let input_width = shape.input_width;
    let pixel_stride = shape.input_pixel_stride;
    debug_assert!(output_size > 0);
    debug_assert!(
        buffer.len()
            >= shape.groups * shape.batch_size * kernel_size * tiled_output_size
    );

    for group in 0..shape.groups {
        for image in 0..shape.batch_size {
            let image_base = (group * shape.batch_size + image) * tiled_output_size;
            for tile_start in (0..tiled_output_size).step_by(output_tile_size) {
                for tile_offset in 0..output_tile_size {
                    let output_index = (tile_start + tile_offset).min(output_size - 1);
                    let output_y = output_index / shape.output_width;
                    let output_x = output_index % shape.output_width;
                    for kernel_y in 0..shape.kernel_height {
                        // Wrapping: a coordinate above the padding becomes huge and
                        // fails the same `<` test as one past the bottom edge.
                        let input_y = (output_y * shape.stride_height
                            + kernel_y * shape.dilation_height)
                            .wrapping_sub(shape.padding_top);
                        for kernel_x in 0..shape.kernel_width {
                            let input_x = (output_x * shape.stride_width
                                + kernel_x * shape.dilation_width)
                                .wrapping_sub(shape.padding_left);
                            let index = (image_base + tile_start) * kernel_size
                                + (kernel_y * shape.kernel_width + kernel_x) * output_tile_size
                                + tile_offset;
                            buffer[index] = if input_y < input_height && input_x < input_width {
                                IndirectionEntry::Offset(
                                    ((image * input_height + input_y) * input_width + input_x)
                                        * pixel_stride
                                        + group * shape.group_input_channels,
                                )
                            } else {
                                IndirectionEntry::ZeroFill
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Fills the per-output-row depthwise layout for images `batch_start..`.
/// Slots of earlier images are left untouched.
pub fn init_dwconv2d(
    shape: &ConvShape,
    batch_start: usize,
    step_height: usize,
    step_width: usize,
    buffer: &mut [IndirectionEntry],
) {
    let input_height = shape.input_height;
    let input_width = shape.input_width;
    let kernel_height = shape.kernel_height;

    for image in batch_start..shape.batch_size {
        for output_y in 0..shape.output_height {
            let row_base = (image * shape.output_height + output_y) * step_height;
            for kernel_y in 0..kernel_height {
                let input_y = (output_y * shape.stride_height + kernel_y * shape.dilation_height)
                    .wrapping_sub(shape.padding_top);
                for output_x in 0..shape.output_width {
                    for kernel_x in 0..shape.kernel_width {
                        let input_x = (output_x * shape.stride_width
                            + kernel_x * shape.dilation_width)
                            .wrapping_sub(shape.padding_left);
                        let index = row_base
                            + output_x * step_width * kernel_height
                            + kernel_x * kernel_height
                            + kernel_y;
                        buffer[index] = if input_y < input_height && input_x < input_width {
                            IndirectionEntry::Offset(
                                ((image * input_height + input_y) * input_width + input_x)
                                    * shape.input_pixel_stride,
                            )
                        } else {
                            IndirectionEntry::ZeroFill
                        };
                    }
                }
            }
        }
    }
}

/// Fills the tiled layout for a transposed convolution. An output pixel only
/// reads input pixels that land on it exactly after upsampling by the stride.
pub fn init_deconv2d(
    shape: &ConvShape,
    output_tile_size: usize,
    tiled_output_size: usize,
    buffer: &mut [IndirectionEntry],
) {
    let output_size = shape.output_size();
    let kernel_size = shape.kernel_size();
    let input_height = shape.input_height;
    let input_width = shape.input_width;
    debug_assert!(output_size > 0);

    for group in 0..shape.groups {
        for image in 0..shape.batch_size {
            let image_base = (group * shape.batch_size + image) * tiled_output_size;
            for tile_start in (0..tiled_output_size).step_by(output_tile_size) {
                for tile_offset in 0..output_tile_size {
                    let output_index = (tile_start + tile_offset).min(output_size - 1);
                    let output_y = output_index / shape.output_width;
                    let output_x = output_index % shape.output_width;
                    for kernel_y in 0..shape.kernel_height {
                        let y = (output_y + shape.padding_top)
                            .wrapping_sub(kernel_y * shape.dilation_height);
                        let input_y = y / shape.stride_height;
                        let y_valid = input_y * shape.stride_height == y && input_y < input_height;
                        for kernel_x in 0..shape.kernel_width {
                            let x = (output_x + shape.padding_left)
                                .wrapping_sub(kernel_x * shape.dilation_width);
                            let input_x = x / shape.stride_width;
                            let x_valid = input_x * shape.stride_width == x && input_x < input_width;
                            let index = (image_base + tile_start) * kernel_size
                                + (kernel_y * shape.kernel_width + kernel_x) * output_tile_size
                                + tile_offset;
                            buffer[index] = if y_valid && x_valid {
                                IndirectionEntry::Offset(
                                    ((image * input_height + input_y) * input_width + input_x)
                                        * shape.input_pixel_stride
                                        + group * shape.group_input_channels,
                                )
                            } else {
                                IndirectionEntry::ZeroFill
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Fills the per-output-row pooling layout for images `batch_start..`.
///
/// Out-of-range coordinates are clamped to the nearest edge pixel instead of
/// pointing at the zero pixel: a synthetic zero must never win a max.
pub fn init_maxpool2d(
    shape: &ConvShape,
    batch_start: usize,
    step_height: usize,
    step_width: usize,
    buffer: &mut [IndirectionEntry],
) {
    let input_height = shape.input_height;
    let input_width = shape.input_width;
    let pooling_height = shape.kernel_height;

    for image in batch_start..shape.batch_size {
        for output_y in 0..shape.output_height {
            let row_base = (image * shape.output_height + output_y) * step_height;
            for pooling_y in 0..pooling_height {
                let input_y = utils::doz(
                    output_y * shape.stride_height + pooling_y * shape.dilation_height,
                    shape.padding_top,
                );
                let clamped_input_y = input_y.min(input_height - 1);
                for output_x in 0..shape.output_width {
                    for pooling_x in 0..shape.kernel_width {
                        let input_x = utils::doz(
                            output_x * shape.stride_width + pooling_x * shape.dilation_width,
                            shape.padding_left,
                        );
                        let clamped_input_x = input_x.min(input_width - 1);
                        let index = row_base
                            + output_x * step_width * pooling_height
                            + pooling_x * pooling_height
                            + pooling_y;
                        buffer[index] = IndirectionEntry::Offset(
                            ((image * input_height + clamped_input_y) * input_width
                                + clamped_input_x)
                                * shape.input_pixel_stride,
                        );
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndirectionLayout {
    /// `[group][image][tile][kernel position][tile offset]`, consumed a tile
    /// at a time by the q8conv micro-kernel.
    Tiled {
        batch_size: usize,
        kernel_size: usize,
        tile_size: usize,
        tiled_output_size: usize,
    },
    /// `[image][output row][step_height]`, consumed a row at a time.
    Rows(IndirectionSteps),
}

/// An owned indirection buffer together with the layout it was built with.
///
/// Built once per operator shape; immutable afterwards, so any number of
/// micro-kernel invocations may read it concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectionBuffer {
    kind: OperatorKind,
    shape: ConvShape,
    layout: IndirectionLayout,
    entries: Vec<IndirectionEntry>,
}

impl IndirectionBuffer {
    pub fn conv2d(shape: &ConvShape, tile_size: usize) -> Self {
        Self::tiled(shape, tile_size, OperatorKind::Convolution)
    }

    pub fn deconv2d(shape: &ConvShape, tile_size: usize) -> Self {
        Self::tiled(shape, tile_size, OperatorKind::Deconvolution)
    }

    pub fn dwconv2d(shape: &ConvShape) -> Self {
        let steps = IndirectionSteps::depthwise(shape);
        let mut entries = Vec::new();
        utils::ensure_capacity(&mut entries, steps.indirection_len(shape), IndirectionEntry::ZeroFill);
        init_dwconv2d(shape, 0, steps.step_height, steps.step_width, &mut entries);
        Self::finish(OperatorKind::DepthwiseConvolution, shape, IndirectionLayout::Rows(steps), entries)
    }

    pub fn maxpool2d(shape: &ConvShape) -> Self {
        let steps = IndirectionSteps::pooling(shape);
        let mut entries = Vec::new();
        utils::ensure_capacity(&mut entries, steps.indirection_len(shape), IndirectionEntry::ZeroFill);
        init_maxpool2d(shape, 0, steps.step_height, steps.step_width, &mut entries);
        Self::finish(OperatorKind::MaxPooling, shape, IndirectionLayout::Rows(steps), entries)
    }

    fn tiled(shape: &ConvShape, tile_size: usize, kind: OperatorKind) -> Self {
        let tiled_output_size = tiled_output_size(shape.output_size(), tile_size);
        let mut entries = Vec::new();
        utils::ensure_capacity(
            &mut entries,
            conv2d_indirection_len(shape, tile_size),
            IndirectionEntry::ZeroFill,
        );
        match kind {
            OperatorKind::Deconvolution => {
                init_deconv2d(shape, tile_size, tiled_output_size, &mut entries)
            }
            _ => init_conv2d(shape, tile_size, tiled_output_size, &mut entries),
        }
        let layout = IndirectionLayout::Tiled {
            batch_size: shape.batch_size,
            kernel_size: shape.kernel_size(),
            tile_size,
            tiled_output_size,
        };
        Self::finish(kind, shape, layout, entries)
    }

    fn finish(
        kind: OperatorKind,
        shape: &ConvShape,
        layout: IndirectionLayout,
        entries: Vec<IndirectionEntry>,
    ) -> Self {
        log::debug!(
            "built {} indirection buffer: {} entries, {} zero-fill, layout {:?}",
            kind,
            entries.len(),
            entries.iter().filter(|e| e.is_zero_fill()).count(),
            layout
        );
        Self {
            kind,
            shape: *shape,
            layout,
            entries,
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    /// The shape the offsets were computed for.
    pub fn shape(&self) -> &ConvShape {
        &self.shape
    }

    pub fn layout(&self) -> IndirectionLayout {
        self.layout
    }

    pub fn entries(&self) -> &[IndirectionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `kernel_size * tile_size` entries of one output tile of a tiled
    /// buffer, or `None` for row layouts.
    pub fn tile(&self, group: usize, image: usize, tile_start: usize) -> Option<&[IndirectionEntry]> {
        match self.layout {
            IndirectionLayout::Tiled {
                batch_size,
                kernel_size,
                tile_size,
                tiled_output_size,
            } => {
                let start = ((group * batch_size + image) * tiled_output_size + tile_start) * kernel_size;
                self.entries.get(start..start + kernel_size * tile_size)
            }
            IndirectionLayout::Rows(_) => None,
        }
    }

    /// The `step_height` entries of one output row of a row layout, or
    /// `None` for tiled buffers.
    pub fn row(&self, image: usize, output_height: usize, output_y: usize) -> Option<&[IndirectionEntry]> {
        match self.layout {
            IndirectionLayout::Rows(steps) => {
                let start = (image * output_height + output_y) * steps.step_height;
                self.entries.get(start..start + steps.step_height)
            }
            IndirectionLayout::Tiled { .. } => None,
        }
    }

    /// Rebuilds the row-layout slots of images `batch_start..` in place, for
    /// schedulers that refresh the buffer image by image.
    pub fn refresh_rows(&mut self, shape: &ConvShape, batch_start: usize) {
        if let IndirectionLayout::Rows(steps) = self.layout {
            match self.kind {
                OperatorKind::MaxPooling => init_maxpool2d(
                    shape,
                    batch_start,
                    steps.step_height,
                    steps.step_width,
                    &mut self.entries,
                ),
                _ => init_dwconv2d(
                    shape,
                    batch_start,
                    steps.step_height,
                    steps.step_width,
                    &mut self.entries,
                ),
            }
            log::trace!("refreshed {} rows from image {}", self.kind, batch_start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps() {
        let shape = ConvShape {
            input_height: 6,
            input_width: 6,
            kernel_height: 3,
            kernel_width: 3,
            ..ConvShape::default()
        }
        .with_inferred_output(OperatorKind::DepthwiseConvolution);
        let steps = IndirectionSteps::depthwise(&shape);
        assert_eq!(steps.step_width, 1);
        // 9 + (4 * 1 - 1) * 3
        assert_eq!(steps.step_height, 18);
        assert_eq!(steps.indirection_len(&shape), 4 * 18);

        let dilated = ConvShape {
            dilation_width: 2,
            input_width: 8,
            ..shape
        }
        .with_inferred_output(OperatorKind::DepthwiseConvolution);
        assert_eq!(IndirectionSteps::depthwise(&dilated).step_width, 3);
    }

    #[test]
    fn test_pooling_steps_clamp_to_window() {
        let shape = ConvShape {
            input_height: 9,
            input_width: 9,
            kernel_height: 2,
            kernel_width: 2,
            stride_height: 3,
            stride_width: 3,
            ..ConvShape::default()
        }
        .with_inferred_output(OperatorKind::MaxPooling);
        assert_eq!(IndirectionSteps::pooling(&shape).step_width, 2);
    }

    #[test]
    fn test_resolve() {
        let input = [1u8, 2, 3, 4];
        let zero = [0u8; 2];
        assert_eq!(IndirectionEntry::Offset(2).resolve(&input[..], &zero[..], 2), &[3, 4]);
        assert_eq!(IndirectionEntry::ZeroFill.resolve(&input[..], &zero[..], 2), &[0, 0]);
        assert_eq!(IndirectionEntry::Offset(1).offset(), Some(1));
        assert!(IndirectionEntry::default().is_zero_fill());
    }
}
