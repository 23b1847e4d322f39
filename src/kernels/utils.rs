pub fn ensure_capacity<T: Clone>(v: &mut Vec<T>, len: usize, fill: T) {
    if v.len() != len {
        v.clear();
        v.resize(len, fill);
    }
}
pub fn divide_round_up(n: usize, q: usize) -> usize {
    n.div_ceil(q)
}
pub fn round_up(n: usize, q: usize) -> usize {
    divide_round_up(n, q) * q
}
/// Difference or zero: `max(a - b, 0)` without wrapping.
#[inline(always)]
pub fn doz(a: usize, b: usize) -> usize {
    a.saturating_sub(b)
}
