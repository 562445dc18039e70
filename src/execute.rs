//! Generic elementwise execution.
//!
//! `elementwise` is the main path behind [`crate::UFunc::call`]: resolve a
//! kernel from the operand dtypes, broadcast the inputs, validate or
//! allocate the outputs, give output hooks their look at the destination
//! arrays, neutralize harmful memory overlap, then drive the blocked
//! iteration plan. Operands whose dtype differs from the kernel's are
//! staged through small cast buffers one inner run at a time, so the extra
//! memory stays bounded no matter the operand size.

use crate::array::{Array, MemoryOrder};
use crate::broadcast::{broadcast_shapes, broadcast_strides};
use crate::dtype::{can_cast, cast_block, DType};
use crate::hooks::{select_output_hook, OutputHook};
use crate::overlap::overlap_is_harmless;
use crate::plan::{build_plan, for_each_inner_block};
use crate::registry::{LoopContext, LoopEntry};
use crate::threading::maybe_release;
use crate::trivial::try_trivial;
use crate::ufunc::{CallOptions, FpPolicy, UFunc};
use crate::{masked, Result, UFuncError, BUFFER_BLOCK_SIZE};

/// Everything a loop driver needs, assembled once per call.
pub(crate) struct Frame<'r, 'a> {
    pub(crate) entry: &'r LoopEntry,
    /// Broadcast iteration shape.
    pub(crate) shape: Vec<usize>,
    /// Inputs, re-materialized where they overlapped an output harmfully.
    pub(crate) inputs: Vec<Array>,
    /// Outputs after hook preparation.
    pub(crate) outputs: Vec<Array>,
    pub(crate) hook: Option<&'a dyn OutputHook>,
}

/// Resolve dtypes, broadcast, and set up outputs for an elementwise call.
pub(crate) fn prepare_frame<'r, 'a>(
    u: &'r UFunc,
    inputs: &[Array],
    opts: &CallOptions<'a>,
) -> Result<Frame<'r, 'a>> {
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

    let shapes: Vec<&[usize]> = inputs.iter().map(|a| a.shape()).collect();
    let shape = broadcast_shapes(&shapes)?;

    let hook = select_output_hook(&opts.output_hooks);
    let mut outputs = Vec::with_capacity(u.nout());
    for i in 0..u.nout() {
        let out = match opts.out.get(i).and_then(|o| o.as_ref()) {
            Some(given) => {
                if given.shape() != shape.as_slice() {
                    return Err(UFuncError::ShapeMismatch(format!(
                        "non-broadcastable output operand with shape {:?} doesn't match \
                         the broadcast shape {:?}",
                        given.shape(),
                        shape
                    )));
                }
                if !given.is_writable() {
                    return Err(UFuncError::NotWritable);
                }
                if !can_cast(&entry.outs[i], given.dtype(), opts.casting) {
                    return Err(UFuncError::CastError {
                        from: entry.outs[i].name(),
                        to: given.dtype().name(),
                        rule: opts.casting.name(),
                    });
                }
                given.clone()
            }
            None => Array::zeros(entry.outs[i], &shape, opts.order)?,
        };
        let out = match hook {
            Some(h) => {
                let prepared = h.prepare(u, out, i)?;
                if prepared.shape() != shape.as_slice() {
                    return Err(UFuncError::Internal(
                        "output hook changed the shape of an output".into(),
                    ));
                }
                prepared
            }
            None => out,
        };
        outputs.push(out);
    }

    // Inputs aliasing an output in a non-lockstep way get their own copy.
    let mut staged_inputs = Vec::with_capacity(inputs.len());
    for inp in inputs {
        let harmful = outputs.iter().any(|out| !overlap_is_harmless(out, inp));
        if harmful {
            staged_inputs.push(contiguous_copy(inp, inp.dtype(), MemoryOrder::C)?);
        } else {
            staged_inputs.push(inp.clone());
        }
    }

    Ok(Frame {
        entry,
        shape,
        inputs: staged_inputs,
        outputs,
        hook,
    })
}

/// Post-kernel bookkeeping shared by every execution path.
pub(crate) fn finish_fp(u: &UFunc, policy: FpPolicy, ctx: &LoopContext) -> Result<()> {
    if policy == FpPolicy::Raise && ctx.fp.any() {
        return Err(UFuncError::FloatingPoint {
            ufunc: u.name().to_string(),
            flags: ctx.fp.flags_string(),
        });
    }
    Ok(())
}

pub(crate) fn wrap_outputs(u: &UFunc, frame: Frame, opts: &CallOptions) -> Result<Vec<Array>> {
    let outs = frame.outputs;
    let Some(h) = frame.hook.filter(|_| opts.subok) else {
        return Ok(outs);
    };
    let mut wrapped = Vec::with_capacity(outs.len());
    for (i, out) in outs.into_iter().enumerate() {
        wrapped.push(h.wrap(u, out, i)?);
    }
    Ok(wrapped)
}

/// Full elementwise call: fast path, masked path or the generic loop.
pub(crate) fn elementwise(u: &UFunc, inputs: &[Array], opts: &CallOptions) -> Result<Vec<Array>> {
    if let Some(mask) = &opts.where_ {
        return masked::masked_elementwise(u, inputs, mask, opts);
    }
    let frame = prepare_frame(u, inputs, opts)?;
    if frame.shape.iter().product::<usize>() == 0 {
        return wrap_outputs(u, frame, opts);
    }

    let mut ctx = LoopContext::default();
    if try_trivial(u, &frame, opts, &mut ctx)? {
        if crate::trace_enabled() {
            eprintln!("{}: trivial path shape={:?}", u.name(), frame.shape);
        }
    } else {
        if crate::trace_enabled() {
            eprintln!("{}: generic strided path shape={:?}", u.name(), frame.shape);
        }
        generic_loop(&frame, opts, &mut ctx)?;
    }
    finish_fp(u, opts.fp_policy, &ctx)?;
    wrap_outputs(u, frame, opts)
}

/// One operand of a running loop: base pointer, iteration strides and the
/// cast buffer it is staged through, if any.
struct Operand {
    base: *mut u8,
    strides: Vec<isize>,
    array_dtype: DType,
    loop_dtype: DType,
    /// Contiguous staging storage, `BUFFER_BLOCK_SIZE` elements.
    buffer: Option<Vec<u8>>,
    is_output: bool,
}

impl Operand {
    fn needs_cast(&self) -> bool {
        self.buffer.is_some()
    }
}

fn make_operand(
    array: &Array,
    shape: &[usize],
    loop_dtype: DType,
    is_output: bool,
) -> Result<Operand> {
    let strides = broadcast_strides(array.shape(), array.strides(), shape)?;
    let needs_cast = array.dtype().id() != loop_dtype.id();
    let buffer = if needs_cast {
        Some(vec![0u8; BUFFER_BLOCK_SIZE * loop_dtype.itemsize()])
    } else {
        None
    };
    Ok(Operand {
        base: array.data_ptr(),
        strides,
        array_dtype: *array.dtype(),
        loop_dtype,
        buffer,
        is_output,
    })
}

/// The generic strided loop over the blocked iteration plan.
fn generic_loop(frame: &Frame, opts: &CallOptions, ctx: &mut LoopContext) -> Result<()> {
    let entry = frame.entry;
    let nin = frame.inputs.len();
    let nop = nin + frame.outputs.len();

    let mut operands = Vec::with_capacity(nop);
    for (i, inp) in frame.inputs.iter().enumerate() {
        operands.push(make_operand(inp, &frame.shape, entry.ins[i], false)?);
    }
    for (i, out) in frame.outputs.iter().enumerate() {
        operands.push(make_operand(out, &frame.shape, entry.outs[i], true)?);
    }

    let stride_refs: Vec<&[isize]> = operands.iter().map(|o| o.strides.as_slice()).collect();
    let plan = build_plan(&frame.shape, &stride_refs, Some(nin));

    let all: Vec<&Array> = frame.inputs.iter().chain(frame.outputs.iter()).collect();
    let _guard = maybe_release(opts.bracket, plan.total_len(), &all);

    let any_cast = operands.iter().any(|o| o.needs_cast());
    let mut data = vec![std::ptr::null_mut::<u8>(); nop];
    let mut run_strides = vec![0isize; nop];

    for_each_inner_block(&plan, |offsets, len, inner| {
        if !any_cast {
            for (i, op) in operands.iter().enumerate() {
                data[i] = unsafe { op.base.offset(offsets[i]) };
            }
            unsafe { (entry.loop_fn)(&data, &[len], inner, ctx) }
        } else {
            run_buffered(entry, &mut operands, offsets, len, inner, &mut data, &mut run_strides, ctx)
        }
    })
}

/// Run one inner block in chunks small enough for the staging buffers,
/// casting mismatched inputs in and mismatched outputs back out.
#[allow(clippy::too_many_arguments)]
fn run_buffered(
    entry: &LoopEntry,
    operands: &mut [Operand],
    offsets: &[isize],
    len: usize,
    inner: &[isize],
    data: &mut [*mut u8],
    run_strides: &mut [isize],
    ctx: &mut LoopContext,
) -> Result<()> {
    let mut done = 0usize;
    while done < len {
        let chunk = (len - done).min(BUFFER_BLOCK_SIZE);
        for (i, op) in operands.iter_mut().enumerate() {
            let at = unsafe { op.base.offset(offsets[i] + done as isize * inner[i]) };
            match &mut op.buffer {
                Some(buf) => {
                    let item = op.loop_dtype.itemsize() as isize;
                    if !op.is_output {
                        unsafe {
                            cast_block(
                                &op.array_dtype,
                                &op.loop_dtype,
                                at,
                                inner[i],
                                buf.as_mut_ptr(),
                                item,
                                chunk,
                            )?;
                        }
                    }
                    data[i] = buf.as_mut_ptr();
                    run_strides[i] = item;
                }
                None => {
                    data[i] = at;
                    run_strides[i] = inner[i];
                }
            }
        }
        unsafe { (entry.loop_fn)(data, &[chunk], run_strides, ctx)? };
        for (i, op) in operands.iter().enumerate() {
            if op.is_output {
                if let Some(buf) = &op.buffer {
                    let at = unsafe { op.base.offset(offsets[i] + done as isize * inner[i]) };
                    unsafe {
                        cast_block(
                            &op.loop_dtype,
                            &op.array_dtype,
                            buf.as_ptr(),
                            op.loop_dtype.itemsize() as isize,
                            at,
                            inner[i],
                            chunk,
                        )?;
                    }
                }
            }
        }
        done += chunk;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Copy helpers
// ----------------------------------------------------------------------

/// Copy `src` into `dst`, broadcasting and casting as needed. The two must
/// not overlap harmfully.
pub(crate) fn copy_into(src: &Array, dst: &Array) -> Result<()> {
    if !dst.is_writable() {
        return Err(UFuncError::NotWritable);
    }
    let src_strides = broadcast_strides(src.shape(), src.strides(), dst.shape())?;
    let stride_refs: Vec<&[isize]> = vec![&src_strides, dst.strides()];
    let plan = build_plan(dst.shape(), &stride_refs, Some(1));
    let same = src.dtype().id() == dst.dtype().id();
    let item = dst.itemsize();
    let (sp, dp) = (src.data_ptr(), dst.data_ptr());
    let (sd, dd) = (*src.dtype(), *dst.dtype());
    for_each_inner_block(&plan, |offsets, len, inner| unsafe {
        let s = sp.offset(offsets[0]);
        let d = dp.offset(offsets[1]);
        if !same {
            return cast_block(&sd, &dd, s, inner[0], d, inner[1], len);
        }
        if dd.is_object() {
            for k in 0..len as isize {
                dd.copy_element(d.offset(k * inner[1]), s.offset(k * inner[0]));
            }
        } else if inner[0] == item as isize && inner[1] == item as isize {
            std::ptr::copy(s, d, len * item);
        } else {
            for k in 0..len as isize {
                std::ptr::copy(s.offset(k * inner[0]), d.offset(k * inner[1]), item);
            }
        }
        Ok(())
    })
}

/// Freshly allocated contiguous copy of `src` in the given dtype.
pub(crate) fn contiguous_copy(src: &Array, dtype: &DType, order: MemoryOrder) -> Result<Array> {
    let out = Array::zeros(*dtype, src.shape(), order)?;
    copy_into(src, &out)?;
    Ok(out)
}

// ----------------------------------------------------------------------
// Indexed in-place application (`at`)
// ----------------------------------------------------------------------

/// Apply the operation at the given first-axis indices, in place and
/// unbuffered across visits: a repeated index sees the previous result.
pub(crate) fn index_apply(
    u: &UFunc,
    array: &Array,
    indices: &[isize],
    values: Option<&Array>,
) -> Result<()> {
    if array.ndim() == 0 {
        return Err(UFuncError::Usage(format!(
            "{}.at requires an array with at least one dimension",
            u.name()
        )));
    }
    if !array.is_writable() {
        return Err(UFuncError::NotWritable);
    }
    if let Some(v) = values {
        if v.ndim() > 1 {
            return Err(UFuncError::Usage(format!(
                "{}.at expects a scalar or 1-d second operand",
                u.name()
            )));
        }
        let n = v.len();
        if v.ndim() == 1 && n != 1 && n != indices.len() {
            return Err(UFuncError::ShapeMismatch(format!(
                "{}.at: second operand has length {} but {} indices were given",
                u.name(),
                n,
                indices.len()
            )));
        }
    }

    // All indices are validated before the first write happens.
    let size = array.shape()[0];
    let mut resolved = Vec::with_capacity(indices.len());
    for &raw in indices {
        let idx = if raw < 0 { raw + size as isize } else { raw };
        if idx < 0 || idx as usize >= size {
            return Err(UFuncError::IndexOutOfBounds {
                op: format!("{}.at", u.name()),
                index: raw,
                size,
            });
        }
        resolved.push(idx as usize);
    }

    for (visit, &idx) in resolved.iter().enumerate() {
        let slot = array.slice_axis(0, idx, 1, 1)?;
        let value = match values {
            None => None,
            Some(v) if v.ndim() == 0 => Some(v.clone()),
            Some(v) => {
                let j = if v.len() == 1 { 0 } else { visit };
                Some(v.slice_axis(0, j, 1, 1)?)
            }
        };
        let mut call_inputs = vec![slot.clone()];
        if let Some(v) = value {
            call_inputs.push(v);
        }
        let opts = CallOptions {
            out: vec![Some(slot)],
            ..CallOptions::default()
        };
        elementwise(u, &call_inputs, &opts)?;
    }
    Ok(())
}
