//! Wraparound-aware comparison of sequence and order numbers.

const SEQUENCE_HALF_RANGE: u16 = 32768;
const ORDER_HALF_RANGE: u8 = 127;

/// Returns true if `a` is ahead of `b` in the 16-bit sequence space.
pub fn sequence_greater_than(a: u16, b: u16) -> bool {
    (a > b && a - b <= SEQUENCE_HALF_RANGE) || (a < b && b - a > SEQUENCE_HALF_RANGE)
}

/// Returns true if `a` is ahead of `b` in the 8-bit order space.
pub fn order_greater_than(a: u8, b: u8) -> bool {
    (a > b && a - b <= ORDER_HALF_RANGE) || (a < b && b - a > ORDER_HALF_RANGE)
}

/// Shortest distance between two sequence numbers around the circle.
pub fn sequence_difference(a: u16, b: u16) -> u16 {
    a.wrapping_sub(b).min(b.wrapping_sub(a))
}
