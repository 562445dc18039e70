//! Masked (`where=`) elementwise execution.
//!
//! The boolean mask rides along as one extra iteration operand. Inside each
//! inner block the mask bytes are run-length decoded: maximal runs of equal
//! mask value collapse to one decision, selected runs go to the kernel in a
//! single call, unselected runs are skipped so the output keeps whatever it
//! held before. A broadcast mask axis has stride 0 and therefore decodes to
//! one run for the whole block. Kernels registered with a purpose-built
//! masked variant get the raw mask instead of the run-length scan.

use crate::array::{Array, MemoryOrder};
use crate::broadcast::broadcast_strides;
use crate::dtype::DTypeId;
use crate::execute::{contiguous_copy, finish_fp, prepare_frame, wrap_outputs};
use crate::plan::{build_plan, for_each_inner_block};
use crate::registry::LoopContext;
use crate::threading::maybe_release;
use crate::ufunc::{CallOptions, UFunc};
use crate::{Result, UFuncError};

pub(crate) fn masked_elementwise(
    u: &UFunc,
    inputs: &[Array],
    mask: &Array,
    opts: &CallOptions,
) -> Result<Vec<Array>> {
    if mask.dtype().id() != DTypeId::Bool {
        return Err(UFuncError::Usage(format!(
            "{}: where= must be a boolean array",
            u.name()
        )));
    }
    let frame = prepare_frame(u, inputs, opts)?;
    let entry = frame.entry;
    if frame.shape.iter().product::<usize>() == 0 {
        return wrap_outputs(u, frame, opts);
    }

    // Masked runs write the output directly, so there is no cast-back
    // stage: operands are aligned with the kernel dtypes up front instead.
    let mut staged = Vec::with_capacity(frame.inputs.len());
    for (i, inp) in frame.inputs.iter().enumerate() {
        if inp.dtype().id() == entry.ins[i].id() {
            staged.push(inp.clone());
        } else {
            staged.push(contiguous_copy(inp, &entry.ins[i], MemoryOrder::C)?);
        }
    }
    for (i, out) in frame.outputs.iter().enumerate() {
        if out.dtype().id() != entry.outs[i].id() {
            return Err(UFuncError::Usage(format!(
                "{}: where= requires the output dtype to match the loop ({})",
                u.name(),
                entry.outs[i].name()
            )));
        }
    }

    let nin = staged.len();
    let nop = nin + frame.outputs.len();
    let mut strides: Vec<Vec<isize>> = Vec::with_capacity(nop + 1);
    for a in staged.iter().chain(frame.outputs.iter()) {
        strides.push(broadcast_strides(a.shape(), a.strides(), &frame.shape)?);
    }
    strides.push(broadcast_strides(
        mask.shape(),
        mask.strides(),
        &frame.shape,
    )?);
    let stride_refs: Vec<&[isize]> = strides.iter().map(|s| s.as_slice()).collect();
    let plan = build_plan(&frame.shape, &stride_refs, Some(nin));
    if crate::trace_enabled() {
        eprintln!("{}: masked path shape={:?}", u.name(), frame.shape);
    }

    let bases: Vec<*mut u8> = staged
        .iter()
        .chain(frame.outputs.iter())
        .map(|a| a.data_ptr())
        .collect();
    let mask_base = mask.data_ptr();

    let all: Vec<&Array> = staged
        .iter()
        .chain(frame.outputs.iter())
        .chain(std::iter::once(mask))
        .collect();
    let mut ctx = LoopContext::default();
    {
        let _guard = maybe_release(opts.bracket, plan.total_len(), &all);
        let mut data = vec![std::ptr::null_mut::<u8>(); nop];
        for_each_inner_block(&plan, |offsets, len, inner| {
            for (i, base) in bases.iter().enumerate() {
                data[i] = unsafe { base.offset(offsets[i]) };
            }
            let mptr = unsafe { mask_base.offset(offsets[nop]) };
            let mstride = inner[nop];
            if let Some(masked_fn) = entry.masked {
                return unsafe { masked_fn(&data, mptr, mstride, &[len], &inner[..nop], &mut ctx) };
            }
            run_length_apply(entry.loop_fn, &data, mptr, mstride, len, &inner[..nop], &mut ctx)
        })?;
    }
    finish_fp(u, opts.fp_policy, &ctx)?;
    wrap_outputs(u, frame, opts)
}

/// Decode the mask into maximal equal-valued runs and invoke the kernel on
/// the selected ones.
pub(crate) fn run_length_apply(
    loop_fn: crate::registry::LoopFn,
    data: &[*mut u8],
    mask: *const u8,
    mask_stride: isize,
    len: usize,
    strides: &[isize],
    ctx: &mut LoopContext,
) -> Result<()> {
    let mut k = 0usize;
    while k < len {
        let cur = unsafe { *mask.offset(k as isize * mask_stride) };
        let mut run = 1usize;
        if mask_stride == 0 {
            run = len - k;
        } else {
            while k + run < len
                && unsafe { *mask.offset((k + run) as isize * mask_stride) } == cur
            {
                run += 1;
            }
        }
        if cur != 0 {
            let shifted: Vec<*mut u8> = data
                .iter()
                .zip(strides.iter())
                .map(|(&p, &s)| unsafe { p.offset(k as isize * s) })
                .collect();
            unsafe { loop_fn(&shifted, &[run], strides, ctx)? };
        }
        k += run;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::ufunc::Identity;

    unsafe fn add_f64(
        data: &[*mut u8],
        dims: &[usize],
        strides: &[isize],
        _ctx: &mut LoopContext,
    ) -> Result<()> {
        for k in 0..dims[0] as isize {
            let a = *(data[0].offset(k * strides[0]) as *const f64);
            let b = *(data[1].offset(k * strides[1]) as *const f64);
            *(data[2].offset(k * strides[2]) as *mut f64) = a + b;
        }
        Ok(())
    }

    fn add() -> UFunc {
        UFunc::builder("add", 2, 1)
            .identity(Identity::Zero)
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                add_f64,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_unselected_elements_keep_previous_contents() {
        let u = add();
        let a = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[4]).unwrap();
        let b = Array::from_vec(vec![10.0f64; 4], &[4]).unwrap();
        let out = Array::from_vec(vec![-1.0f64; 4], &[4]).unwrap();
        let opts = CallOptions {
            out: vec![Some(out.clone())],
            where_: Some(Array::from_bool_vec(vec![true, false, true, false], &[4]).unwrap()),
            ..CallOptions::default()
        };
        u.call(&[a, b], &opts).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![11.0, -1.0, 13.0, -1.0]);
    }

    #[test]
    fn test_broadcast_mask_single_run() {
        let u = add();
        let a = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let b = Array::from_vec(vec![1.0f64; 6], &[2, 3]).unwrap();
        let out = Array::from_vec(vec![0.0f64; 6], &[2, 3]).unwrap();
        // One mask value per row, stretched across the row.
        let mask = Array::from_bool_vec(vec![true, false], &[2])
            .unwrap()
            .reshape(&[2, 1])
            .unwrap();
        let opts = CallOptions {
            out: vec![Some(out.clone())],
            where_: Some(mask),
            ..CallOptions::default()
        };
        u.call(&[a, b], &opts).unwrap();
        assert_eq!(
            out.to_vec::<f64>().unwrap(),
            vec![2.0, 3.0, 4.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_all_false_mask_writes_nothing() {
        let u = add();
        let a = Array::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
        let b = Array::from_vec(vec![1.0f64, 1.0], &[2]).unwrap();
        let out = Array::from_vec(vec![7.0f64, 7.0], &[2]).unwrap();
        let opts = CallOptions {
            out: vec![Some(out.clone())],
            where_: Some(Array::from_bool_vec(vec![false, false], &[2]).unwrap()),
            ..CallOptions::default()
        };
        u.call(&[a, b], &opts).unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![7.0, 7.0]);
    }

    #[test]
    fn test_non_bool_mask_rejected() {
        let u = add();
        let a = Array::from_vec(vec![1.0f64], &[1]).unwrap();
        let opts = CallOptions {
            where_: Some(Array::from_vec(vec![1i32], &[1]).unwrap()),
            ..CallOptions::default()
        };
        let err = u.call(&[a.clone(), a], &opts).unwrap_err();
        assert!(matches!(err, UFuncError::Usage(_)));
    }

    #[test]
    fn test_masked_cast_staging() {
        let u = add();
        let a = Array::from_vec(vec![1i32, 2, 3], &[3]).unwrap();
        let b = Array::from_vec(vec![1i32, 1, 1], &[3]).unwrap();
        let opts = CallOptions {
            where_: Some(Array::from_bool_vec(vec![true, true, false], &[3]).unwrap()),
            ..CallOptions::default()
        };
        let out = u.call(&[a, b], &opts).unwrap();
        // Freshly allocated outputs start zeroed, unselected stays zero.
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![2.0, 3.0, 0.0]);
    }
}
