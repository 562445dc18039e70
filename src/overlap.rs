//! Conservative memory-overlap tests between operands.
//!
//! The engine never proves exact element aliasing. It compares the byte
//! intervals each operand can touch and treats any intersection as overlap,
//! except for the one benign case it can recognize cheaply: two views with
//! identical layout, which read and write the same elements in lockstep.

use crate::array::Array;

/// True when the byte intervals of `a` and `b` intersect. Views over
/// different buffers never overlap regardless of addresses.
pub(crate) fn arrays_overlap(a: &Array, b: &Array) -> bool {
    if !a.same_buffer(b) {
        return false;
    }
    let (a_lo, a_hi) = a.byte_bounds();
    let (b_lo, b_hi) = b.byte_bounds();
    a_lo < b_hi && b_lo < a_hi
}

/// Overlap that a one-pass elementwise loop tolerates: either no overlap at
/// all, or the two operands are the same view element for element.
pub(crate) fn overlap_is_harmless(a: &Array, b: &Array) -> bool {
    !arrays_overlap(a, b) || a.same_layout(b)
}

/// True when writing through `out` could corrupt a later read of any input.
pub(crate) fn output_needs_input_copy(out: &Array, inputs: &[&Array]) -> bool {
    inputs.iter().any(|inp| !overlap_is_harmless(out, inp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, MemoryOrder};
    use crate::dtype::DType;

    fn arange(n: usize) -> Array {
        Array::from_vec((0..n).map(|i| i as f64).collect::<Vec<_>>(), &[n]).unwrap()
    }

    #[test]
    fn test_distinct_buffers_never_overlap() {
        let a = arange(8);
        let b = arange(8);
        assert!(!arrays_overlap(&a, &b));
    }

    #[test]
    fn test_shared_buffer_full_overlap() {
        let a = arange(8);
        let b = a.clone();
        assert!(arrays_overlap(&a, &b));
        assert!(overlap_is_harmless(&a, &b));
    }

    #[test]
    fn test_shifted_slices_overlap_and_are_harmful() {
        let a = arange(8);
        let head = a.slice_axis(0, 0, 6, 1).unwrap();
        let tail = a.slice_axis(0, 1, 6, 1).unwrap();
        assert!(arrays_overlap(&head, &tail));
        assert!(!overlap_is_harmless(&head, &tail));
        assert!(output_needs_input_copy(&head, &[&tail]));
    }

    #[test]
    fn test_disjoint_slices_of_one_buffer() {
        let a = arange(8);
        let lo = a.slice_axis(0, 0, 4, 1).unwrap();
        let hi = a.slice_axis(0, 4, 4, 1).unwrap();
        assert!(!arrays_overlap(&lo, &hi));
    }

    #[test]
    fn test_reversed_view_overlaps_forward_view() {
        let a = arange(8);
        let rev = a.slice_axis(0, 7, 8, -1).unwrap();
        assert!(arrays_overlap(&a, &rev));
        assert!(!overlap_is_harmless(&a, &rev));
    }

    #[test]
    fn test_zero_size_view_never_overlaps() {
        let a = Array::zeros(DType::float64(), &[4, 0], MemoryOrder::C).unwrap();
        let b = a.clone();
        assert!(!arrays_overlap(&a, &b));
    }
}
