//! Iteration-order selection for strided plans.
//!
//! Dimensions are sorted so that the smallest-stride dimension ends up
//! innermost (position 0 of the plan order). The output operand's strides
//! are weighted double: writes benefit more from locality than reads.

pub(crate) fn compute_order(
    dims: &[usize],
    strides_list: &[&[isize]],
    dest_index: Option<usize>,
) -> Vec<usize> {
    let rank = dims.len();
    if rank == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..rank).collect();
    order.sort_by(|&a, &b| {
        let score_a = dim_score(a, strides_list, dest_index);
        let score_b = dim_score(b, strides_list, dest_index);
        score_a.cmp(&score_b).then_with(|| a.cmp(&b))
    });
    order
}

fn dim_score(dim: usize, strides_list: &[&[isize]], dest_index: Option<usize>) -> usize {
    let mut score = 0usize;
    for (i, strides) in strides_list.iter().enumerate() {
        let weight = if dest_index == Some(i) { 2 } else { 1 };
        score = score.saturating_add(weight * strides[dim].unsigned_abs());
    }
    score
}

/// Relative rank of each stride among the non-zero strides (1 = smallest).
/// Zero (broadcast) strides rank 1.
pub(crate) fn index_order(strides: &[isize]) -> Vec<usize> {
    let n = strides.len();
    let mut result = vec![1usize; n];
    for i in 0..n {
        let si = strides[i].unsigned_abs();
        if si == 0 {
            continue;
        }
        let mut k = 1usize;
        for &s in strides {
            if s != 0 && s.unsigned_abs() < si {
                k += 1;
            }
        }
        result[i] = k;
    }
    result
}
