//! Strided iteration plans and the blocked loop driver.
//!
//! The plan pipeline is order -> fuse -> block: dimensions are permuted so
//! the smallest stride iterates innermost, adjacent contiguous dimensions
//! are merged, and the iteration is tiled to the L1 block budget. Ordering
//! runs first so that descending-stride (row-major) layouts present their
//! contiguous pair in the orientation the fuse check matches. The driver
//! then walks the tiles and hands the executor one *inner block* at a time:
//! per-operand byte offsets, a run length, and one fixed byte stride per
//! operand. Kernels are invoked once per inner block, which is what
//! amortizes per-call overhead over the largest contiguous run available.

use crate::fuse::fuse_dims;
use crate::order::compute_order;
use crate::{block, Result};

pub(crate) struct IterPlan {
    /// Iteration dimensions after fusion and reordering, innermost first.
    pub(crate) dims: Vec<usize>,
    /// Per-operand byte strides, permuted to match `dims`.
    pub(crate) strides: Vec<Vec<isize>>,
    /// Block sizes, one per iteration dimension.
    pub(crate) blocks: Vec<usize>,
}

impl IterPlan {
    pub(crate) fn total_len(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Build an iteration plan over `dims` for operands with the given byte
/// strides. `dest_index` marks the output operand whose locality is weighted
/// double when picking the loop order.
pub(crate) fn build_plan(
    dims: &[usize],
    strides_list: &[&[isize]],
    dest_index: Option<usize>,
) -> IterPlan {
    let order = compute_order(dims, strides_list, dest_index);
    let ordered_dims: Vec<usize> = order.iter().map(|&d| dims[d]).collect();
    let ordered_strides: Vec<Vec<isize>> = strides_list
        .iter()
        .map(|s| order.iter().map(|&d| s[d]).collect())
        .collect();
    let stride_refs: Vec<&[isize]> = ordered_strides.iter().map(|s| s.as_slice()).collect();
    let fused = fuse_dims(&ordered_dims, &stride_refs);
    let blocks = block::compute_block_sizes(&fused, &stride_refs);
    IterPlan {
        dims: fused,
        strides: ordered_strides,
        blocks,
    }
}

/// Drive the plan, calling `f(offsets, run_len, inner_strides)` once per
/// inner block. `offsets` holds the current byte offset of each operand,
/// `inner_strides` the per-operand byte stride of the innermost dimension.
///
/// A rank-0 plan yields exactly one call with `run_len == 1` and zero
/// strides. A plan with any zero extent yields no calls. Errors from `f`
/// stop the iteration at the current block boundary.
pub(crate) fn for_each_inner_block<F>(plan: &IterPlan, mut f: F) -> Result<()>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<()>,
{
    let nop = plan.strides.len();
    let mut offsets = vec![0isize; nop];

    if plan.dims.is_empty() {
        let zeros = vec![0isize; nop];
        return f(&offsets, 1, &zeros);
    }
    if plan.dims.contains(&0) {
        return Ok(());
    }

    let inner_strides: Vec<isize> = plan.strides.iter().map(|s| s[0]).collect();
    match plan.dims.len() {
        1 => drive_1d(plan, &inner_strides, &mut offsets, &mut f),
        2 => drive_2d(plan, &inner_strides, &mut offsets, &mut f),
        _ => drive_level(
            plan.dims.len() - 1,
            plan,
            &inner_strides,
            &mut offsets,
            &mut f,
        ),
    }
}

fn drive_1d<F>(
    plan: &IterPlan,
    inner_strides: &[isize],
    offsets: &mut [isize],
    f: &mut F,
) -> Result<()>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<()>,
{
    let d0 = plan.dims[0];
    let b0 = plan.blocks[0].clamp(1, d0);

    let mut j0 = 0usize;
    while j0 < d0 {
        let run = b0.min(d0 - j0);
        f(offsets, run, inner_strides)?;
        for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
            *offset += run as isize * s[0];
        }
        j0 += run;
    }
    for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
        *offset -= d0 as isize * s[0];
    }
    Ok(())
}

fn drive_2d<F>(
    plan: &IterPlan,
    inner_strides: &[isize],
    offsets: &mut [isize],
    f: &mut F,
) -> Result<()>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<()>,
{
    let d0 = plan.dims[0];
    let d1 = plan.dims[1];
    let b0 = plan.blocks[0].clamp(1, d0);
    let b1 = plan.blocks[1].clamp(1, d1);

    let mut j1 = 0usize;
    while j1 < d1 {
        let blen1 = b1.min(d1 - j1);

        let mut j0 = 0usize;
        while j0 < d0 {
            let blen0 = b0.min(d0 - j0);

            for _ in 0..blen1 {
                f(offsets, blen0, inner_strides)?;
                for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
                    *offset += s[1];
                }
            }
            for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
                *offset -= blen1 as isize * s[1];
                *offset += blen0 as isize * s[0];
            }
            j0 += blen0;
        }

        for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
            *offset -= d0 as isize * s[0];
            *offset += blen1 as isize * s[1];
        }
        j1 += blen1;
    }

    for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
        *offset -= d1 as isize * s[1];
    }
    Ok(())
}

/// Recursive driver for rank >= 3. `level` counts down from `rank-1`
/// (outermost) to 0 (innermost, where the callback fires).
fn drive_level<F>(
    level: usize,
    plan: &IterPlan,
    inner_strides: &[isize],
    offsets: &mut [isize],
    f: &mut F,
) -> Result<()>
where
    F: FnMut(&[isize], usize, &[isize]) -> Result<()>,
{
    let d = plan.dims[level];
    let b = plan.blocks[level].clamp(1, d);

    if level == 0 {
        let mut j = 0usize;
        while j < d {
            let run = b.min(d - j);
            f(offsets, run, inner_strides)?;
            for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
                *offset += run as isize * s[0];
            }
            j += run;
        }
        for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
            *offset -= d as isize * s[0];
        }
        return Ok(());
    }

    let mut j = 0usize;
    while j < d {
        let blen = b.min(d - j);
        for _ in 0..blen {
            drive_level(level - 1, plan, inner_strides, offsets, f)?;
            for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
                *offset += s[level];
            }
        }
        j += blen;
    }
    for (offset, s) in offsets.iter_mut().zip(plan.strides.iter()) {
        *offset -= d as isize * s[level];
    }
    Ok(())
}
