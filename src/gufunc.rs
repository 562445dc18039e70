//! Generalized (core-signature) execution.
//!
//! Each operand splits into broadcast axes and core axes. Only the
//! broadcast axes are iterated; the kernel receives whole core blocks and
//! their strides and walks them itself. Kernel geometry per call:
//! `dims = [n, size of each distinct core dim...]` and
//! `strides = [one outer stride per operand..., then each operand's
//! declared core strides in signature order]`, with missing flexible dims
//! reported as size 1 and stride 0.
//!
//! This path never buffers. Inputs whose dtype differs from the kernel's,
//! or whose bytes alias a destination, are copied whole up front; a supplied output of a different dtype is
//! computed into a scratch array and copied back only once the whole call
//! has succeeded. Output hooks get no `prepare` stage here because the
//! kernel owns entire core blocks, not single elements; `wrap` still runs.

use crate::array::{Array, MemoryOrder};
use crate::broadcast::{
    axis_to_axes, broadcast_shapes, broadcast_strides, normalize_axes_argument, normalize_axis,
    resolve_core_geometry, resolve_core_ranks, validate_keepdims, CoreGeometry,
};
use crate::dtype::{can_cast, DType};
use crate::execute::{contiguous_copy, copy_into, finish_fp};
use crate::hooks::select_output_hook;
use crate::overlap::arrays_overlap;
use crate::plan::{build_plan, for_each_inner_block};
use crate::registry::LoopContext;
use crate::signature::CoreSignature;
use crate::threading::maybe_release;
use crate::ufunc::{CallOptions, UFunc};
use crate::{Result, UFuncError};

pub(crate) fn generalized(u: &UFunc, inputs: &[Array], opts: &CallOptions) -> Result<Vec<Array>> {
    let sig = u
        .signature()
        .ok_or_else(|| UFuncError::Internal("generalized call without a signature".into()))?;
    if opts.where_.is_some() {
        return Err(UFuncError::Usage(format!(
            "{}: where= is not supported for operations with a core signature",
            u.name()
        )));
    }

    let in_dtypes: Vec<DType> = inputs.iter().map(|a| *a.dtype()).collect();
    let entry = u.resolver().resolve(
        u.name(),
        u.registry(),
        &in_dtypes,
        opts.dtype.as_ref(),
        opts.casting,
    )?;
    for (have, want) in in_dtypes.iter().zip(entry.ins.iter()) {
        if !can_cast(have, want, opts.casting) {
            return Err(UFuncError::CastError {
                from: have.name(),
                to: want.name(),
                rule: opts.casting.name(),
            });
        }
    }

    let nin = sig.nin();
    let nop = sig.nop();

    // Rank prepass decides which flexible dims vanish; that fixes how many
    // core axes each operand contributes before any axis placement.
    let mut ranks: Vec<Option<usize>> = inputs.iter().map(|a| Some(a.ndim())).collect();
    for i in 0..sig.nout() {
        ranks.push(supplied_out(opts, i).map(|o| o.ndim()));
    }
    let (core_counts, missing) = resolve_core_ranks(u.name(), sig, &ranks)?;
    let prelim = CoreGeometry {
        op_core_num_dims: core_counts,
        missing,
        core_sizes: vec![0; sig.num_distinct_dims()],
    };

    let keep_count = if opts.keepdims {
        Some(validate_keepdims(sig, &prelim)?)
    } else {
        None
    };

    // Axis placement, as explicit core-axis lists per operand.
    let core_axes = placement(u, sig, &prelim, opts, inputs, keep_count)?;

    // Move every operand's core axes to the tail.
    let mut work_inputs = Vec::with_capacity(nin);
    for (op, inp) in inputs.iter().enumerate() {
        work_inputs.push(to_tail(inp, &core_axes[op])?);
    }
    let mut work_outs: Vec<Option<Array>> = Vec::with_capacity(sig.nout());
    for i in 0..sig.nout() {
        match supplied_out(opts, i) {
            Some(given) => {
                if !given.is_writable() {
                    return Err(UFuncError::NotWritable);
                }
                let mut view = given.clone();
                if let Some(n) = keep_count {
                    let kept = kept_positions(opts, given.ndim(), n)?;
                    view = view.remove_axes(&kept)?;
                }
                work_outs.push(Some(to_tail(&view, &core_axes[nin + i])?));
            }
            None => work_outs.push(None),
        }
    }

    // Core sizes from the permuted shapes.
    let mut shapes: Vec<Option<&[usize]>> = work_inputs.iter().map(|a| Some(a.shape())).collect();
    for o in &work_outs {
        shapes.push(o.as_ref().map(|a| a.shape()));
    }
    let geom = resolve_core_geometry(u.name(), sig, &shapes)?;

    // Broadcast shape of the non-core axes.
    let outer_shapes: Vec<&[usize]> = work_inputs
        .iter()
        .enumerate()
        .map(|(op, a)| &a.shape()[..a.ndim() - geom.op_core_num_dims[op]])
        .collect();
    let outer_shape = broadcast_shapes(&outer_shapes)?;

    // Internal outputs: outer shape plus present core dims trailing.
    let mut internal_outs = Vec::with_capacity(sig.nout());
    let mut copybacks: Vec<(usize, Array)> = Vec::new();
    for i in 0..sig.nout() {
        let op = nin + i;
        let core_dims: Vec<usize> = geom
            .present_dims(sig, op)
            .map(|ix| geom.core_sizes[ix])
            .collect();
        let full: Vec<usize> = outer_shape.iter().copied().chain(core_dims).collect();
        match &work_outs[i] {
            Some(given) => {
                if given.shape() != full.as_slice() {
                    return Err(UFuncError::ShapeMismatch(format!(
                        "{}: output operand {} has shape {:?}, expected {:?}",
                        u.name(),
                        i,
                        given.shape(),
                        full
                    )));
                }
                if given.dtype().id() == entry.outs[i].id() {
                    internal_outs.push(given.clone());
                } else {
                    if !can_cast(&entry.outs[i], given.dtype(), opts.casting) {
                        return Err(UFuncError::CastError {
                            from: entry.outs[i].name(),
                            to: given.dtype().name(),
                            rule: opts.casting.name(),
                        });
                    }
                    let scratch = Array::zeros(entry.outs[i], &full, opts.order)?;
                    copybacks.push((i, given.clone()));
                    internal_outs.push(scratch);
                }
            }
            None => internal_outs.push(Array::zeros(entry.outs[i], &full, opts.order)?),
        }
    }

    // Inputs are copied whole when their dtype misses the kernel's, and
    // also when they share bytes with a destination: the kernel reads whole
    // core blocks per outer element, so a write to any aliased destination
    // can land before a later block is read.
    let mut staged = Vec::with_capacity(nin);
    for (i, inp) in work_inputs.iter().enumerate() {
        if inp.dtype().id() != entry.ins[i].id() {
            staged.push(contiguous_copy(inp, &entry.ins[i], MemoryOrder::C)?);
        } else if internal_outs.iter().any(|out| arrays_overlap(out, inp)) {
            staged.push(contiguous_copy(inp, inp.dtype(), MemoryOrder::C)?);
        } else {
            staged.push(inp.clone());
        }
    }

    // Kernel geometry.
    let mut kernel_dims = vec![0usize];
    for ix in 0..sig.num_distinct_dims() {
        kernel_dims.push(if geom.missing[ix] { 1 } else { geom.core_sizes[ix] });
    }
    let mut outer_strides: Vec<Vec<isize>> = Vec::with_capacity(nop);
    let mut core_strides: Vec<isize> = Vec::new();
    for (op, a) in staged.iter().chain(internal_outs.iter()).enumerate() {
        let split = a.ndim() - geom.op_core_num_dims[op];
        outer_strides.push(broadcast_strides(
            &a.shape()[..split],
            &a.strides()[..split],
            &outer_shape,
        )?);
        let mut core_axis = split;
        for &ix in sig.dim_indices(op) {
            if geom.missing[ix] {
                core_strides.push(0);
            } else {
                core_strides.push(a.strides()[core_axis]);
                core_axis += 1;
            }
        }
    }

    let stride_refs: Vec<&[isize]> = outer_strides.iter().map(|s| s.as_slice()).collect();
    let plan = build_plan(&outer_shape, &stride_refs, Some(nin));
    let bases: Vec<*mut u8> = staged
        .iter()
        .chain(internal_outs.iter())
        .map(|a| a.data_ptr())
        .collect();

    let core_span: usize = (0..sig.nop()).map(|op| sig.num_core_dims(op)).sum();
    let mut kernel_strides = vec![0isize; nop + core_span];
    kernel_strides[nop..].copy_from_slice(&core_strides);

    let mut ctx = LoopContext::default();
    {
        let all: Vec<&Array> = staged.iter().chain(internal_outs.iter()).collect();
        let total = plan.total_len() * kernel_dims[1..].iter().product::<usize>().max(1);
        let _guard = maybe_release(opts.bracket, total, &all);
        let mut data = vec![std::ptr::null_mut::<u8>(); nop];
        for_each_inner_block(&plan, |offsets, len, inner| {
            for (i, base) in bases.iter().enumerate() {
                data[i] = unsafe { base.offset(offsets[i]) };
            }
            kernel_dims[0] = len;
            kernel_strides[..nop].copy_from_slice(inner);
            unsafe { (entry.loop_fn)(&data, &kernel_dims, &kernel_strides, &mut ctx) }
        })?;
    }
    finish_fp(u, opts.fp_policy, &ctx)?;

    // Deferred copy-back into mismatched supplied outputs.
    for (i, target) in &copybacks {
        copy_into(&internal_outs[*i], target)?;
    }

    // Public views: supplied outputs return as given, allocated ones get
    // their core axes moved to the requested positions.
    let mut outs = Vec::with_capacity(sig.nout());
    for i in 0..sig.nout() {
        let op = nin + i;
        match supplied_out(opts, i) {
            Some(given) => outs.push(given.clone()),
            None => {
                let internal = internal_outs[i].clone();
                let public = if let Some(n) = keep_count {
                    let kept = kept_positions(opts, internal.ndim() + n, n)?;
                    internal.insert_axes(&kept)?
                } else if is_trailing(&core_axes[op], internal.ndim(), geom.op_core_num_dims[op]) {
                    internal
                } else {
                    from_tail(&internal, &core_axes[op])?
                };
                outs.push(public);
            }
        }
    }
    if opts.subok {
        if let Some(h) = select_output_hook(&opts.output_hooks) {
            let mut wrapped = Vec::with_capacity(outs.len());
            for (i, out) in outs.into_iter().enumerate() {
                wrapped.push(h.wrap(u, out, i)?);
            }
            return Ok(wrapped);
        }
    }
    Ok(outs)
}

fn supplied_out<'a>(opts: &'a CallOptions, i: usize) -> Option<&'a Array> {
    opts.out.get(i).and_then(|o| o.as_ref())
}

/// Resolve `axis=`/`axes=` (or the trailing default) into normalized
/// per-operand core-axis lists.
fn placement(
    u: &UFunc,
    sig: &CoreSignature,
    prelim: &CoreGeometry,
    opts: &CallOptions,
    inputs: &[Array],
    keep_count: Option<usize>,
) -> Result<Vec<Vec<usize>>> {
    let out_rank = |i: usize| -> usize {
        supplied_out(opts, i)
            .map(|o| o.ndim().saturating_sub(keep_count.unwrap_or(0)))
            .unwrap_or(prelim.op_core_num_dims[sig.nin() + i])
    };
    let mut ranks: Vec<usize> = inputs.iter().map(|a| a.ndim()).collect();
    for i in 0..sig.nout() {
        ranks.push(out_rank(i));
    }

    let raw: Vec<Vec<isize>> = match (&opts.axes, opts.axis) {
        (Some(_), Some(_)) => {
            return Err(UFuncError::Usage(format!(
                "{}: axis and axes cannot be given together",
                u.name()
            )))
        }
        (Some(axes), None) => axes.clone(),
        (None, Some(axis)) => axis_to_axes(sig, prelim, axis)?,
        (None, None) => {
            // Trailing placement.
            return Ok((0..sig.nop())
                .map(|op| {
                    let n = prelim.op_core_num_dims[op];
                    let rank = ranks[op];
                    (rank.saturating_sub(n)..rank).collect()
                })
                .collect());
        }
    };
    normalize_axes_argument(prelim, &ranks, &raw)
}

/// Positions (ascending) of the kept singleton axes in an output of the
/// given rank. Supported with the default trailing placement and with
/// `axis=`; an explicit `axes=` list is ambiguous here and rejected.
fn kept_positions(opts: &CallOptions, out_rank: usize, n: usize) -> Result<Vec<usize>> {
    if opts.axes.is_some() {
        return Err(UFuncError::Usage(
            "keepdims cannot be combined with axes=".into(),
        ));
    }
    match opts.axis {
        Some(ax) => Ok(vec![normalize_axis(ax, out_rank)?]),
        None => Ok((out_rank - n..out_rank).collect()),
    }
}

fn is_trailing(core: &[usize], rank: usize, n: usize) -> bool {
    core.iter().copied().eq(rank.saturating_sub(n)..rank)
}

/// Permute so the listed core axes become the trailing axes, in order.
fn to_tail(a: &Array, core: &[usize]) -> Result<Array> {
    if is_trailing(core, a.ndim(), core.len()) {
        return Ok(a.clone());
    }
    let mut perm: Vec<usize> = (0..a.ndim()).filter(|d| !core.contains(d)).collect();
    perm.extend_from_slice(core);
    a.permute(&perm)
}

/// Inverse of [`to_tail`] for freshly allocated outputs.
fn from_tail(a: &Array, core: &[usize]) -> Result<Array> {
    let rank = a.ndim();
    let mut perm: Vec<usize> = (0..rank).filter(|d| !core.contains(d)).collect();
    perm.extend_from_slice(core);
    let mut inv = vec![0usize; rank];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    a.permute(&inv)
}
