//! Reductions: `reduce`, `accumulate` and `reduceat`.
//!
//! All three run on one mechanism, the *combine pass*: a single sweep of the
//! binary kernel computing `dst = f(lhs, rhs)` over the non-reduced space,
//! with the accumulator appearing as both an input and the output. `reduce`
//! seeds the accumulator from the first element (or the identity) and runs
//! one pass per remaining element along the reduced axes, in index order, so
//! non-reorderable operations fold left exactly like a sequential loop
//! would. `accumulate` chains passes between adjacent slices along one axis
//! and `reduceat` does so per index segment.
//!
//! Accumulation happens in the resolved loop dtype throughout. When the
//! input dtype differs, the input is cast up front in one contiguous copy;
//! there is no per-block buffering on this path.

use crate::array::{Array, MemoryOrder};
use crate::broadcast::{broadcast_strides, normalize_axis};
use crate::dtype::{can_cast, Casting, DType, DTypeId};
use crate::execute::{contiguous_copy, copy_into, finish_fp};
use crate::hooks::select_output_hook;
use crate::masked::run_length_apply;
use crate::overlap::{arrays_overlap, overlap_is_harmless};
use crate::plan::{build_plan, for_each_inner_block};
use crate::registry::{LoopContext, LoopEntry};
use crate::threading::maybe_release;
use crate::ufunc::{AccumulateOptions, ReduceOptions, UFunc};
use crate::{Result, UFuncError};

/// Pick the loop a reduction accumulates in. The accumulator feeds back as
/// the first kernel input, so both inputs and the output must share one
/// dtype.
fn resolve_homogeneous<'u>(
    u: &'u UFunc,
    method: &str,
    input: &DType,
    requested: Option<&DType>,
    casting: Casting,
) -> Result<&'u LoopEntry> {
    let widened;
    let want: Option<&DType> = match requested {
        Some(d) => Some(d),
        None => {
            widened = u.reduce_dtype(input);
            (widened.id() != input.id()).then_some(&widened)
        }
    };
    let entry = match want {
        Some(d) => {
            let pair = [*d, *d];
            match u
                .resolver()
                .resolve(u.name(), u.registry(), &pair, Some(d), casting)
            {
                Ok(e) => e,
                // The widening was our own suggestion, not the caller's;
                // fall back to the plain input dtypes.
                Err(_) if requested.is_none() => {
                    let pair = [*input, *input];
                    u.resolver()
                        .resolve(u.name(), u.registry(), &pair, None, casting)?
                }
                Err(e) => return Err(e),
            }
        }
        None => {
            let pair = [*input, *input];
            u.resolver()
                .resolve(u.name(), u.registry(), &pair, None, casting)?
        }
    };
    let acc = &entry.outs[0];
    if entry.ins[0].id() != acc.id() || entry.ins[1].id() != acc.id() {
        return Err(UFuncError::Internal(format!(
            "{}.{} needs a loop with one dtype for both inputs and the output, \
             resolver picked ({}, {}) -> {}",
            u.name(),
            method,
            entry.ins[0].name(),
            entry.ins[1].name(),
            acc.name()
        )));
    }
    Ok(entry)
}

/// One sweep of `dst = f(lhs, rhs)` over `dst`'s shape. All three operands
/// are already in the loop dtype; `lhs` and `rhs` broadcast against `dst`.
/// `lhs` and `dst` may alias element for element.
fn combine_pass(
    entry: &LoopEntry,
    lhs: &Array,
    rhs: &Array,
    dst: &Array,
    mask: Option<&Array>,
    ctx: &mut LoopContext,
) -> Result<()> {
    let shape = dst.shape();
    let s0 = broadcast_strides(lhs.shape(), lhs.strides(), shape)?;
    let s1 = broadcast_strides(rhs.shape(), rhs.strides(), shape)?;
    let s2 = dst.strides().to_vec();
    let mut stride_refs: Vec<&[isize]> = vec![&s0, &s1, &s2];
    let ms;
    if let Some(m) = mask {
        ms = broadcast_strides(m.shape(), m.strides(), shape)?;
        stride_refs.push(&ms);
    }
    let plan = build_plan(shape, &stride_refs, Some(2));

    let bases = [lhs.data_ptr(), rhs.data_ptr(), dst.data_ptr()];
    let mask_base = mask.map(|m| m.data_ptr());
    let mut data = [std::ptr::null_mut::<u8>(); 3];
    for_each_inner_block(&plan, |offsets, len, inner| {
        for i in 0..3 {
            data[i] = unsafe { bases[i].offset(offsets[i]) };
        }
        match mask_base {
            Some(mb) => {
                let mptr = unsafe { mb.offset(offsets[3]) };
                run_length_apply(entry.loop_fn, &data, mptr, inner[3], len, &inner[..3], ctx)
            }
            None => unsafe { (entry.loop_fn)(&data, &[len], &inner[..3], ctx) },
        }
    })
}

/// View of `src` at one point of the reduced axes, those axes removed.
fn reduced_view(src: &Array, axes: &[usize], index: &[usize]) -> Result<Array> {
    let mut v = src.clone();
    for (&ax, &i) in axes.iter().zip(index.iter()) {
        v = v.slice_axis(ax, i, 1, 1)?;
    }
    v.remove_axes(axes)
}

pub(crate) fn reduce(u: &UFunc, array: &Array, opts: &ReduceOptions) -> Result<Array> {
    let rank = array.ndim();
    let mut axes: Vec<usize> = if opts.axes.is_empty() {
        (0..rank).collect()
    } else {
        opts.axes
            .iter()
            .map(|&ax| normalize_axis(ax, rank))
            .collect::<Result<_>>()?
    };
    axes.sort_unstable();
    for w in axes.windows(2) {
        if w[0] == w[1] {
            return Err(UFuncError::DuplicateAxis { axis: w[0] });
        }
    }

    let entry = resolve_homogeneous(u, "reduce", array.dtype(), opts.dtype.as_ref(), opts.casting)?;
    let acc_dtype = entry.outs[0];
    if !can_cast(array.dtype(), &acc_dtype, opts.casting) && opts.dtype.is_some() {
        return Err(UFuncError::CastError {
            from: array.dtype().name(),
            to: acc_dtype.name(),
            rule: opts.casting.name(),
        });
    }

    let kept: Vec<usize> = (0..rank).filter(|d| !axes.contains(d)).collect();
    let kept_dims: Vec<usize> = kept.iter().map(|&d| array.shape()[d]).collect();
    let red_dims: Vec<usize> = axes.iter().map(|&d| array.shape()[d]).collect();
    let red_len: usize = red_dims.iter().product();

    let out_shape: Vec<usize> = if opts.keepdims {
        let mut s = array.shape().to_vec();
        for &ax in &axes {
            s[ax] = 1;
        }
        s
    } else {
        kept_dims.clone()
    };

    // The accumulator always has the kept shape; a supplied output either
    // lends its storage directly or receives a cast copy at the end.
    let (acc_arr, public, copyback) = match &opts.out {
        Some(given) => {
            if given.shape() != out_shape.as_slice() {
                return Err(UFuncError::ShapeMismatch(format!(
                    "{}.reduce: output has shape {:?}, expected {:?}",
                    u.name(),
                    given.shape(),
                    out_shape
                )));
            }
            if !given.is_writable() {
                return Err(UFuncError::NotWritable);
            }
            if given.dtype().id() == acc_dtype.id() {
                let acc = if opts.keepdims {
                    given.remove_axes(&axes)?
                } else {
                    given.clone()
                };
                (acc, Some(given.clone()), false)
            } else {
                if !can_cast(&acc_dtype, given.dtype(), opts.casting) {
                    return Err(UFuncError::CastError {
                        from: acc_dtype.name(),
                        to: given.dtype().name(),
                        rule: opts.casting.name(),
                    });
                }
                let acc = Array::zeros(acc_dtype, &kept_dims, MemoryOrder::C)?;
                (acc, Some(given.clone()), true)
            }
        }
        None => (Array::zeros(acc_dtype, &kept_dims, MemoryOrder::C)?, None, false),
    };

    let src = if array.dtype().id() != acc_dtype.id() {
        contiguous_copy(array, &acc_dtype, MemoryOrder::C)?
    } else if arrays_overlap(&acc_arr, array) {
        contiguous_copy(array, array.dtype(), MemoryOrder::C)?
    } else {
        array.clone()
    };

    let mask_full = match &opts.where_ {
        Some(mask) => {
            if mask.dtype().id() != DTypeId::Bool {
                return Err(UFuncError::Usage(format!(
                    "{}.reduce: where= must be a boolean array",
                    u.name()
                )));
            }
            Some(mask.broadcast_to(array.shape())?)
        }
        None => None,
    };

    let mut ctx = LoopContext::default();

    if red_len == 0 {
        let init = opts
            .initial
            .clone()
            .or_else(|| u.identity().value())
            .ok_or_else(|| UFuncError::NoIdentity {
                ufunc: u.name().to_string(),
            })?;
        acc_arr.fill_scalar(&init)?;
    } else {
        // With a mask (or an explicit initial) every element is folded into
        // a pre-filled accumulator; otherwise the first element seeds it.
        let mut first = if let Some(init) = &opts.initial {
            acc_arr.fill_scalar(init)?;
            false
        } else if mask_full.is_some() {
            let init = u.identity().value().ok_or_else(|| {
                UFuncError::Usage(format!(
                    "reduction operation {} does not have an identity, \
                     so to use a where mask one has to specify 'initial'",
                    u.name()
                ))
            })?;
            acc_arr.fill_scalar(&init)?;
            false
        } else {
            true
        };

        let mut operands: Vec<&Array> = vec![&src, &acc_arr];
        if let Some(m) = &mask_full {
            operands.push(m);
        }
        let _guard = maybe_release(opts.bracket, src.len(), &operands);

        let mut index = vec![0usize; axes.len()];
        let mut remaining = red_len;
        while remaining > 0 {
            let view = reduced_view(&src, &axes, &index)?;
            if first {
                first = false;
                copy_into(&view, &acc_arr)?;
            } else {
                let mview = match &mask_full {
                    Some(m) => Some(reduced_view(m, &axes, &index)?),
                    None => None,
                };
                combine_pass(entry, &acc_arr, &view, &acc_arr, mview.as_ref(), &mut ctx)?;
            }
            remaining -= 1;
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < red_dims[d] {
                    break;
                }
                index[d] = 0;
            }
        }
    }

    finish_fp(u, opts.fp_policy, &ctx)?;

    let result = match public {
        Some(given) => {
            if copyback {
                let shaped = if opts.keepdims {
                    acc_arr.insert_axes(&axes)?
                } else {
                    acc_arr
                };
                copy_into(&shaped, &given)?;
            }
            given
        }
        None if opts.keepdims => acc_arr.insert_axes(&axes)?,
        None => acc_arr,
    };

    match select_output_hook(&opts.output_hooks) {
        Some(h) => h.wrap(u, result, 0),
        None => Ok(result),
    }
}

pub(crate) fn accumulate(u: &UFunc, array: &Array, opts: &AccumulateOptions) -> Result<Array> {
    let axis = normalize_axis(opts.axis, array.ndim())?;
    let entry = resolve_homogeneous(
        u,
        "accumulate",
        array.dtype(),
        opts.dtype.as_ref(),
        opts.casting,
    )?;
    let acc_dtype = entry.outs[0];
    let n = array.shape()[axis];

    let (dest, copyback) = prepare_dest(u, array.shape(), &acc_dtype, &opts.out, opts.casting)?;

    // Running in place over the input itself is fine when the two align
    // element for element; anything shiftier gets a copy.
    let src = if array.dtype().id() != acc_dtype.id() {
        contiguous_copy(array, &acc_dtype, MemoryOrder::C)?
    } else if !overlap_is_harmless(&dest, array) {
        contiguous_copy(array, array.dtype(), MemoryOrder::C)?
    } else {
        array.clone()
    };

    let mut ctx = LoopContext::default();
    if n > 0 {
        let _guard = maybe_release(opts.bracket, src.len(), &[&src, &dest]);
        copy_into(&src.slice_axis(axis, 0, 1, 1)?, &dest.slice_axis(axis, 0, 1, 1)?)?;
        for i in 1..n {
            combine_pass(
                entry,
                &dest.slice_axis(axis, i - 1, 1, 1)?,
                &src.slice_axis(axis, i, 1, 1)?,
                &dest.slice_axis(axis, i, 1, 1)?,
                None,
                &mut ctx,
            )?;
        }
    }
    finish_fp(u, opts.fp_policy, &ctx)?;

    let result = match copyback {
        Some(given) => {
            copy_into(&dest, &given)?;
            given
        }
        None => dest,
    };
    match select_output_hook(&opts.output_hooks) {
        Some(h) => h.wrap(u, result, 0),
        None => Ok(result),
    }
}

pub(crate) fn reduceat(
    u: &UFunc,
    array: &Array,
    indices: &[isize],
    opts: &AccumulateOptions,
) -> Result<Array> {
    let axis = normalize_axis(opts.axis, array.ndim())?;
    let entry = resolve_homogeneous(
        u,
        "reduceat",
        array.dtype(),
        opts.dtype.as_ref(),
        opts.casting,
    )?;
    let acc_dtype = entry.outs[0];
    let n = array.shape()[axis];

    // Every index is validated before any output element is written.
    let mut starts = Vec::with_capacity(indices.len());
    for &raw in indices {
        if raw < 0 || raw as usize >= n {
            return Err(UFuncError::IndexOutOfBounds {
                op: format!("{}.reduceat", u.name()),
                index: raw,
                size: n,
            });
        }
        starts.push(raw as usize);
    }

    let mut out_shape = array.shape().to_vec();
    out_shape[axis] = starts.len();
    let (dest, copyback) = prepare_dest(u, &out_shape, &acc_dtype, &opts.out, opts.casting)?;

    let src = if array.dtype().id() != acc_dtype.id() {
        contiguous_copy(array, &acc_dtype, MemoryOrder::C)?
    } else if arrays_overlap(&dest, array) {
        contiguous_copy(array, array.dtype(), MemoryOrder::C)?
    } else {
        array.clone()
    };

    let mut ctx = LoopContext::default();
    {
        let _guard = maybe_release(opts.bracket, src.len(), &[&src, &dest]);
        for (i, &start) in starts.iter().enumerate() {
            // A segment runs to the next boundary, the last one to the end.
            // An empty or reversed segment yields a plain copy of the
            // element at its start index.
            let end = match starts.get(i + 1) {
                Some(&next) if next > start => next,
                Some(_) => start,
                None => n,
            };
            let dest_i = dest.slice_axis(axis, i, 1, 1)?;
            copy_into(&src.slice_axis(axis, start, 1, 1)?, &dest_i)?;
            for r in start + 1..end {
                combine_pass(
                    entry,
                    &dest_i,
                    &src.slice_axis(axis, r, 1, 1)?,
                    &dest_i,
                    None,
                    &mut ctx,
                )?;
            }
        }
    }
    finish_fp(u, opts.fp_policy, &ctx)?;

    let result = match copyback {
        Some(given) => {
            copy_into(&dest, &given)?;
            given
        }
        None => dest,
    };
    match select_output_hook(&opts.output_hooks) {
        Some(h) => h.wrap(u, result, 0),
        None => Ok(result),
    }
}

/// Validate a supplied output against the expected shape, or allocate one.
/// Returns the array to compute into plus the caller's array when a cast
/// copyback is needed at the end.
fn prepare_dest(
    u: &UFunc,
    shape: &[usize],
    acc_dtype: &DType,
    out: &Option<Array>,
    casting: Casting,
) -> Result<(Array, Option<Array>)> {
    match out {
        Some(given) => {
            if given.shape() != shape {
                return Err(UFuncError::ShapeMismatch(format!(
                    "{}: output has shape {:?}, expected {:?}",
                    u.name(),
                    given.shape(),
                    shape
                )));
            }
            if !given.is_writable() {
                return Err(UFuncError::NotWritable);
            }
            if given.dtype().id() == acc_dtype.id() {
                Ok((given.clone(), None))
            } else {
                if !can_cast(acc_dtype, given.dtype(), casting) {
                    return Err(UFuncError::CastError {
                        from: acc_dtype.name(),
                        to: given.dtype().name(),
                        rule: casting.name(),
                    });
                }
                let scratch = Array::zeros(*acc_dtype, shape, MemoryOrder::C)?;
                Ok((scratch, Some(given.clone())))
            }
        }
        None => Ok((Array::zeros(*acc_dtype, shape, MemoryOrder::C)?, None)),
    }
}
