//! Block size computation for cache-efficient strided iteration.
//!
//! Given the iteration dimensions (already in iteration order, innermost
//! first) and every operand's byte strides, compute per-dimension block
//! sizes such that one block's memory footprint fits the L1 target
//! ([`crate::BLOCK_MEMORY_SIZE`]). Oversized blocks are reduced by
//! cost-weighted halving, preferring to shrink the dimensions that are most
//! expensive to traverse.

use crate::fuse::compute_costs;
use crate::order::index_order;
use crate::{BLOCK_MEMORY_SIZE, CACHE_LINE_SIZE};

/// Compute block sizes for tiled iteration.
///
/// `dims` and each stride slice in `strides_list` must already be permuted
/// into iteration order (innermost dimension first). Strides are in bytes.
pub(crate) fn compute_block_sizes(dims: &[usize], strides_list: &[&[isize]]) -> Vec<usize> {
    if dims.is_empty() {
        return Vec::new();
    }
    let costs = compute_costs(strides_list);
    let stride_orders: Vec<Vec<usize>> = strides_list.iter().map(|s| index_order(s)).collect();
    let stride_order_refs: Vec<&[usize]> = stride_orders.iter().map(|s| s.as_slice()).collect();
    compute_blocks(dims, &costs, strides_list, &stride_order_refs, BLOCK_MEMORY_SIZE)
}

fn compute_blocks(
    dims: &[usize],
    costs: &[isize],
    byte_strides: &[&[isize]],
    stride_orders: &[&[usize]],
    block_size: usize,
) -> Vec<usize> {
    let n = dims.len();
    if n == 0 {
        return vec![];
    }

    if total_memory_region(dims, byte_strides) <= block_size {
        return dims.to_vec();
    }

    // If the innermost dimension carries the smallest stride of every
    // operand, keep it whole and recurse on the remaining dimensions.
    let min_order = stride_orders
        .iter()
        .filter_map(|orders| orders.iter().min().copied())
        .min()
        .unwrap_or(1);
    if stride_orders
        .iter()
        .all(|orders| !orders.is_empty() && orders[0] == min_order)
    {
        let tail_strides: Vec<&[isize]> = byte_strides.iter().map(|s| &s[1..]).collect();
        let tail_orders: Vec<&[usize]> = stride_orders.iter().map(|s| &s[1..]).collect();
        let tail = compute_blocks(&dims[1..], &costs[1..], &tail_strides, &tail_orders, block_size);
        let mut result = vec![dims[0]];
        result.extend(tail);
        return result;
    }

    // Every element of a block lands on its own cache line; blocking gains
    // nothing.
    let min_stride = byte_strides
        .iter()
        .filter_map(|s| s.iter().map(|x| x.unsigned_abs()).min())
        .min()
        .unwrap_or(0);
    if min_stride > block_size {
        return vec![1; n];
    }

    let mut blocks = dims.to_vec();

    // Halve the most expensive dimension until within 2x of the target.
    while total_memory_region(&blocks, byte_strides) >= 2 * block_size {
        match last_argmax_weighted(&blocks, costs) {
            Some(i) if blocks[i] > 1 => blocks[i] = (blocks[i] + 1) / 2,
            _ => break,
        }
    }

    // Then decrement until within the target.
    while total_memory_region(&blocks, byte_strides) > block_size {
        match last_argmax_weighted(&blocks, costs) {
            Some(i) if blocks[i] > 1 => blocks[i] -= 1,
            _ => break,
        }
    }

    blocks
}

/// Estimate the memory footprint of one block, counting cache-line effects:
/// strides below a cache line extend the contiguous region, strides above it
/// multiply the number of distinct cache-line blocks touched.
fn total_memory_region(dims: &[usize], byte_strides: &[&[isize]]) -> usize {
    let cache_line = CACHE_LINE_SIZE;
    let mut memory_region = 0usize;

    for strides in byte_strides {
        let mut contiguous_bytes = 0usize;
        let mut line_blocks = 1usize;
        for (&d, &s) in dims.iter().zip(strides.iter()) {
            let s_abs = s.unsigned_abs();
            if s_abs < cache_line {
                contiguous_bytes += d.saturating_sub(1) * s_abs;
            } else {
                line_blocks *= d;
            }
        }
        let contiguous_lines = contiguous_bytes / cache_line + 1;
        memory_region += cache_line * contiguous_lines * line_blocks;
    }

    memory_region
}

/// Last index maximizing `(blocks[i] - 1) * costs[i]`, skipping exhausted
/// dimensions.
fn last_argmax_weighted(blocks: &[usize], costs: &[isize]) -> Option<usize> {
    let mut max_score = 0isize;
    let mut max_idx = None;
    for (i, (&b, &c)) in blocks.iter().zip(costs.iter()).enumerate() {
        if b <= 1 {
            continue;
        }
        let score = (b as isize - 1) * c;
        if score >= max_score {
            max_score = score;
            max_idx = Some(i);
        }
    }
    max_idx
}
