use crate::kernels::requantization::QuantizationError;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvError {
    #[error("{0} must be non-zero")]
    ZeroDimension(&'static str),
    #[error("input pixel stride {stride} is smaller than {channels} channels")]
    PixelStrideTooSmall { stride: usize, channels: usize },
    #[error("{axis}: output size {actual} does not match expected {expected}")]
    OutputSizeMismatch {
        axis: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} buffer holds {actual} elements, need {required}")]
    BufferTooSmall {
        what: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("indirection buffer was not built with an MR-row tiled layout for this shape")]
    IndirectionLayout,
    #[error("Invalid quantization parameters")]
    Quantization(#[from] QuantizationError),
}

/// Which operator a shape describes. Decides the output-size formula and the
/// indirection layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Convolution,
    DepthwiseConvolution,
    Deconvolution,
    MaxPooling,
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Convolution => "conv2d",
            OperatorKind::DepthwiseConvolution => "dwconv2d",
            OperatorKind::Deconvolution => "deconv2d",
            OperatorKind::MaxPooling => "maxpool2d",
        };
        f.write_str(name)
    }
}

/// Shape of one convolution-like operator over an NHWC uint8 input.
///
/// `input_pixel_stride` is counted in elements and may exceed
/// `groups * group_input_channels` when the input is a channel slice of a
/// wider tensor. For depthwise convolution `groups` is the channel count and
/// `group_input_channels` is 1; for pooling `groups` is 1.
///
/// `padding_bottom`, `padding_right` and the deconvolution adjustments only
/// take part in output-size inference and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvShape {
    pub batch_size: usize,
    pub groups: usize,
    pub group_input_channels: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub output_height: usize,
    pub output_width: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
    pub dilation_height: usize,
    pub dilation_width: usize,
    pub padding_top: usize,
    pub padding_left: usize,
    pub padding_bottom: usize,
    pub padding_right: usize,
    pub adjustment_height: usize,
    pub adjustment_width: usize,
    pub input_pixel_stride: usize,
}

impl Default for ConvShape {
    fn default() -> Self {
        Self {
            batch_size: 1,
            groups: 1,
            group_input_channels: 1,
            input_height: 1,
            input_width: 1,
            output_height: 1,
            output_width: 1,
            kernel_height: 1,
            kernel_width: 1,
            stride_height: 1,
            stride_width: 1,
            dilation_height: 1,
            dilation_width: 1,
            padding_top: 0,
            padding_left: 0,
            padding_bottom: 0,
            padding_right: 0,
            adjustment_height: 0,
            adjustment_width: 0,
            input_pixel_stride: 1,
        }
    }
}

/// Output extent of a strided, dilated window over a padded input.
/// Returns 0 when the dilated kernel does not fit.
pub fn conv_output_dimension(
    padded_input: usize,
    kernel: usize,
    dilation: usize,
    stride: usize,
) -> usize {
    let effective_kernel = kernel.saturating_sub(1) * dilation + 1;
    if padded_input < effective_kernel || stride == 0 {
        return 0;
    }
    (padded_input - effective_kernel) / stride + 1
}

/// Output extent of a transposed convolution. Returns 0 when the padding
/// consumes the whole upsampled extent.
pub fn deconv_output_dimension(
    input: usize,
    total_padding: usize,
    adjustment: usize,
    kernel: usize,
    dilation: usize,
    stride: usize,
) -> usize {
    let effective_kernel = kernel.saturating_sub(1) * dilation + 1;
    (stride * input.saturating_sub(1) + adjustment + effective_kernel).saturating_sub(total_padding)
}

impl ConvShape {
    pub fn output_size(&self) -> usize {
        self.output_height * self.output_width
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_height * self.kernel_width
    }

    pub fn input_channels(&self) -> usize {
        self.groups * self.group_input_channels
    }

    /// Output height and width implied by the input extent, padding,
    /// kernel, stride and dilation for `kind`.
    pub fn expected_output_dims(&self, kind: OperatorKind) -> (usize, usize) {
        match kind {
            OperatorKind::Deconvolution => (
                deconv_output_dimension(
                    self.input_height,
                    self.padding_top + self.padding_bottom,
                    self.adjustment_height,
                    self.kernel_height,
                    self.dilation_height,
                    self.stride_height,
                ),
                deconv_output_dimension(
                    self.input_width,
                    self.padding_left + self.padding_right,
                    self.adjustment_width,
                    self.kernel_width,
                    self.dilation_width,
                    self.stride_width,
                ),
            ),
            _ => (
                conv_output_dimension(
                    self.input_height + self.padding_top + self.padding_bottom,
                    self.kernel_height,
                    self.dilation_height,
                    self.stride_height,
                ),
                conv_output_dimension(
                    self.input_width + self.padding_left + self.padding_right,
                    self.kernel_width,
                    self.dilation_width,
                    self.stride_width,
                ),
            ),
        }
    }

    /// Replaces the output extent with the one implied by the rest of the
    /// shape.
    pub fn with_inferred_output(mut self, kind: OperatorKind) -> Self {
        let (output_height, output_width) = self.expected_output_dims(kind);
        self.output_height = output_height;
        self.output_width = output_width;
        self
    }

    /// Checks the preconditions the indirection builders and the
    /// micro-kernel rely on.
    pub fn validate(&self, kind: OperatorKind) -> Result<(), ConvError> {
        let dims = [
            ("batch_size", self.batch_size),
            ("groups", self.groups),
            ("group_input_channels", self.group_input_channels),
            ("input_height", self.input_height),
            ("input_width", self.input_width),
            ("kernel_height", self.kernel_height),
            ("kernel_width", self.kernel_width),
            ("stride_height", self.stride_height),
            ("stride_width", self.stride_width),
            ("dilation_height", self.dilation_height),
            ("dilation_width", self.dilation_width),
            ("output_height", self.output_height),
            ("output_width", self.output_width),
        ];
        if let Some((name, _)) = dims.iter().find(|(_, value)| *value == 0) {
            return Err(ConvError::ZeroDimension(*name));
        }
        if self.input_pixel_stride < self.input_channels() {
            return Err(ConvError::PixelStrideTooSmall {
                stride: self.input_pixel_stride,
                channels: self.input_channels(),
            });
        }
        let (expected_height, expected_width) = self.expected_output_dims(kind);
        if expected_height != self.output_height {
            return Err(ConvError::OutputSizeMismatch {
                axis: "height",
                expected: expected_height,
                actual: self.output_height,
            });
        }
        if expected_width != self.output_width {
            return Err(ConvError::OutputSizeMismatch {
                axis: "width",
                expected: expected_width,
                actual: self.output_width,
            });
        }
        Ok(())
    }

    /// Number of input elements an NHWC tensor of this shape must hold.
    pub fn input_len(&self) -> usize {
        let pixels = self.batch_size * self.input_height * self.input_width;
        if pixels == 0 {
            return 0;
        }
        (pixels - 1) * self.input_pixel_stride + self.input_channels()
    }
}
