//! 8x8 quantized convolution micro-kernel over an indirection buffer.
//!
//! One call computes an `mr x nr` tile of uint8 output. For each of `ks`
//! kernel steps it takes `MR` indirection entries (one per output row),
//! resolves each to `kc` input channels and accumulates the `MR x NR` outer
//! products against the packed weights of that step.
//!
//! Packed weight block, `packed_weights_len(kc, ks)` bytes:
//!
//! ```text
//! [NR x i32 bias, native endian]
//! [ks x kc x NR u8 weights]   // per step, per input channel, one byte per output column
//! ```
use crate::kernels::indirection::IndirectionEntry;
use crate::kernels::requantization::ConvQuantizationParams;

/// Output rows per tile.
pub const MR: usize = 8;
/// Output columns per tile.
pub const NR: usize = 8;
/// Width of one lane group along the contraction.
const LANES: usize = 8;
const BIAS_BYTES: usize = NR * std::mem::size_of::<i32>();

/// The tensor the indirection entries point into, plus the zero pixel that
/// `ZeroFill` entries resolve to. `zero` must hold at least `kc` zeros.
#[derive(Debug, Clone, Copy)]
pub struct Q8ConvInput<'a> {
    pub data: &'a [u8],
    pub zero: &'a [u8],
}

impl<'a> Q8ConvInput<'a> {
    pub fn new(data: &'a [u8], zero: &'a [u8]) -> Self {
        Self { data, zero }
    }
}

pub fn packed_weights_len(kc: usize, ks: usize) -> usize {
    BIAS_BYTES + ks * kc * NR
}

/// Computes one `mr x nr` output tile.
///
/// `a` holds `ks * MR` entries; rows of a partial tile must repeat row
/// `mr - 1`. All `MR` rows are stored, rows `>= mr` on top of row `mr - 1`,
/// so `c` needs `(mr - 1) * c_stride + nr` bytes and only rows `< mr` carry
/// meaningful data. At most `nr` bytes are written per row.
#[allow(clippy::too_many_arguments)]
pub fn compute_tile(
    mr: usize,
    nr: usize,
    kc: usize,
    ks: usize,
    a: &[IndirectionEntry],
    input: &Q8ConvInput<'_>,
    w: &[u8],
    c: &mut [u8],
    c_stride: usize,
    params: &ConvQuantizationParams,
) {
    debug_assert!((1..=MR).contains(&mr));
    debug_assert!((1..=NR).contains(&nr));
    debug_assert!(kc != 0 && ks != 0);
    debug_assert!(a.len() >= ks * MR);
    debug_assert!(w.len() >= packed_weights_len(kc, ks));

    let bias = load_bias(w);
    let mut acc = [bias; MR];
    let kernel_zero_point = params.kernel_zero_point as i16;

    let step_bytes = kc * NR;
    let weights = &w[BIAS_BYTES..BIAS_BYTES + ks * step_bytes];
    for (step, step_weights) in a.chunks_exact(MR).zip(weights.chunks_exact(step_bytes)) {
        let rows: [&[u8]; MR] =
            std::array::from_fn(|m| step[m].resolve(input.data, input.zero, kc));
        accumulate_step(&mut acc, &rows, step_weights, kc, kernel_zero_point);
    }

    store_tile(&acc, mr, nr, c, c_stride, params);
}

#[inline(always)]
fn load_bias(w: &[u8]) -> [i32; NR] {
    std::array::from_fn(|n| {
        let bytes = [w[4 * n], w[4 * n + 1], w[4 * n + 2], w[4 * n + 3]];
        i32::from_ne_bytes(bytes)
    })
}

/// Accumulates one kernel step. `kc` is walked in lane groups; the last group
/// reads only the remaining channels.
#[inline(always)]
fn accumulate_step(
    acc: &mut [[i32; NR]; MR],
    rows: &[&[u8]; MR],
    weights: &[u8],
    kc: usize,
    kernel_zero_point: i16,
) {
    let mut k = 0;
    while k < kc {
        let lanes = LANES.min(kc - k);

        // Activations carry no zero point in this contraction: plain widening.
        let mut va = [[0i16; LANES]; MR];
        for (va_row, row) in va.iter_mut().zip(rows.iter()) {
            for (dst, &x) in va_row.iter_mut().zip(&row[k..k + lanes]) {
                *dst = x as i16;
            }
        }

        for lane in 0..lanes {
            let wb = &weights[(k + lane) * NR..(k + lane + 1) * NR];
            let vb: [i16; NR] = std::array::from_fn(|n| wb[n] as i16 - kernel_zero_point);
            for (acc_row, va_row) in acc.iter_mut().zip(va.iter()) {
                let xa = va_row[lane] as i32;
                for (dst, &xb) in acc_row.iter_mut().zip(vb.iter()) {
                    *dst = dst.wrapping_add(xa * xb as i32);
                }
            }
        }
        k += lanes;
    }
}

#[inline(always)]
fn store_tile(
    acc: &[[i32; NR]; MR],
    mr: usize,
    nr: usize,
    c: &mut [u8],
    c_stride: usize,
    params: &ConvQuantizationParams,
) {
    for (m, acc_row) in acc.iter().enumerate() {
        let out: [u8; NR] = acc_row.map(|v| params.requantize(v));
        let row_start = m.min(mr - 1) * c_stride;
        store_row(&mut c[row_start..row_start + nr], &out);
    }
}

/// Writes `dst.len()` (at most `NR`) bytes as a full row or a 4/2/1 tail.
#[inline(always)]
fn store_row(dst: &mut [u8], out: &[u8; NR]) {
    let nr = dst.len();
    if nr == NR {
        dst.copy_from_slice(out);
        return;
    }
    let mut n = 0;
    if nr - n >= 4 {
        dst[n..n + 4].copy_from_slice(&out[n..n + 4]);
        n += 4;
    }
    if nr - n >= 2 {
        dst[n..n + 2].copy_from_slice(&out[n..n + 2]);
        n += 2;
    }
    if nr - n >= 1 {
        dst[n] = out[n];
    }
}
