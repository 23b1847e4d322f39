use thiserror::Error;

/// Smallest requantization scale the Q31 multiplier/shift pair can express.
pub const MIN_SCALE: f32 = 1.0 / 4_294_967_296.0;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum QuantizationError {
    #[error("requantization scale {0} is outside [2^-32, 1)")]
    ScaleOutOfRange(f32),
    #[error("output range [{min}, {max}] is empty")]
    EmptyOutputRange { min: u8, max: u8 },
    #[error("requantization shift {0} must be below 32")]
    ShiftOutOfRange(u32),
    #[error("requantization multiplier {0} is negative")]
    NegativeMultiplier(i32),
}

/// Per-operator parameters of the q8conv micro-kernel.
///
/// `multiplier * 2^-31 * 2^-right_shift` approximates
/// `input_scale * kernel_scale / output_scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvQuantizationParams {
    pub kernel_zero_point: u8,
    pub multiplier: i32,
    pub right_shift: u32,
    pub output_zero_point: i16,
    pub output_min: u8,
    pub output_max: u8,
}

impl ConvQuantizationParams {
    /// Derives the fixed-point multiplier and shift from a real scale in
    /// `[2^-32, 1)`. The multiplier lands in `[2^30, 2^31 - 128]`.
    pub fn new(
        kernel_zero_point: u8,
        scale: f32,
        output_zero_point: u8,
        output_min: u8,
        output_max: u8,
    ) -> Result<Self, QuantizationError> {
        if !(MIN_SCALE..1.0).contains(&scale) {
            return Err(QuantizationError::ScaleOutOfRange(scale));
        }
        if output_min > output_max {
            return Err(QuantizationError::EmptyOutputRange {
                min: output_min,
                max: output_max,
            });
        }
        let scale_bits = scale.to_bits();
        let multiplier = (((scale_bits & 0x007F_FFFF) | 0x0080_0000) << 7) as i32;
        let right_shift = 126 - (scale_bits >> 23);
        debug_assert!(multiplier >= 0x4000_0000);
        debug_assert!(right_shift < 32);
        Ok(Self {
            kernel_zero_point,
            multiplier,
            right_shift,
            output_zero_point: output_zero_point as i16,
            output_min,
            output_max,
        })
    }

    /// Uses an already computed multiplier and shift. Nothing is checked
    /// here; [`validate`](Self::validate) runs before any convolution.
    pub fn from_raw(
        kernel_zero_point: u8,
        multiplier: i32,
        right_shift: u32,
        output_zero_point: u8,
        output_min: u8,
        output_max: u8,
    ) -> Self {
        Self {
            kernel_zero_point,
            multiplier,
            right_shift,
            output_zero_point: output_zero_point as i16,
            output_min,
            output_max,
        }
    }

    /// Checks what the requantization pipeline assumes: a non-negative
    /// multiplier, a shift below 32 and a non-empty output range.
    pub fn validate(&self) -> Result<(), QuantizationError> {
        if self.multiplier < 0 {
            return Err(QuantizationError::NegativeMultiplier(self.multiplier));
        }
        if self.right_shift >= 32 {
            return Err(QuantizationError::ShiftOutOfRange(self.right_shift));
        }
        if self.output_min > self.output_max {
            return Err(QuantizationError::EmptyOutputRange {
                min: self.output_min,
                max: self.output_max,
            });
        }
        Ok(())
    }

    /// The real scale the multiplier and shift stand for.
    pub fn scale(&self) -> f64 {
        self.multiplier as f64 / (1u64 << 31) as f64 / (1u64 << self.right_shift) as f64
    }

    #[inline(always)]
    pub fn requantize(&self, acc: i32) -> u8 {
        requantize_q31(acc, self)
    }
}

/// Saturating rounding doubling high multiply: `(a * b + 2^30) >> 31`, with
/// the single overflowing input pair `i32::MIN * i32::MIN` saturated.
/// Ties round towards positive infinity.
#[inline(always)]
pub fn q31_mul(a: i32, b: i32) -> i32 {
    if a == i32::MIN && b == i32::MIN {
        return i32::MAX;
    }
    let product = a as i64 * b as i64;
    ((product + (1 << 30)) >> 31) as i32
}

/// Arithmetic right shift rounding to nearest, ties away from zero.
#[inline(always)]
pub fn rounding_shift_right(value: i32, shift: u32) -> i32 {
    if shift == 0 {
        return value;
    }
    // Negative values are pulled down by one so that the round-half-up shift
    // below rounds their ties away from zero.
    let biased = value as i64 + (value >> 31) as i64;
    ((biased + (1i64 << (shift - 1))) >> shift) as i32
}

/// Full requantization of one accumulator: fixed-point scale, narrow to i16,
/// add the output zero point, narrow to u8 and clamp. Every narrowing
/// saturates.
#[inline(always)]
pub fn requantize_q31(acc: i32, params: &ConvQuantizationParams) -> u8 {
    let scaled = rounding_shift_right(q31_mul(acc, params.multiplier), params.right_shift);
    let narrowed = scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
    let shifted = narrowed.saturating_add(params.output_zero_point);
    let out = shifted.clamp(0, u8::MAX as i16) as u8;
    out.max(params.output_min).min(params.output_max)
}
