//! Single-call fast path for elementwise execution.
//!
//! When every operand already matches the kernel's dtypes and they agree on
//! a contiguous layout, the whole call is one kernel invocation over the
//! flattened element count: no plan, no blocking, no staging. Operands that
//! miss the dtype requirement are still admitted for rank 0 and rank 1,
//! where a contiguous cast copy is cheaper than setting up the buffered
//! loop.

use crate::array::{Array, MemoryOrder};
use crate::execute::{contiguous_copy, Frame};
use crate::registry::LoopContext;
use crate::threading::maybe_release;
use crate::ufunc::{CallOptions, UFunc};
use crate::Result;

/// Try the fast path. `Ok(false)` means the generic loop must run instead.
pub(crate) fn try_trivial(
    _u: &UFunc,
    frame: &Frame,
    opts: &CallOptions,
    ctx: &mut LoopContext,
) -> Result<bool> {
    let entry = frame.entry;
    if frame.outputs.len() != 1 {
        return Ok(false);
    }
    let out = &frame.outputs[0];
    if out.dtype().id() != entry.outs[0].id() {
        return Ok(false);
    }

    // Every full-size operand must share one contiguous layout.
    let mut c_ok = out.is_c_contiguous();
    let mut f_ok = out.is_f_contiguous();
    for inp in &frame.inputs {
        if inp.len() == 1 {
            continue;
        }
        if inp.shape() != frame.shape.as_slice() {
            return Ok(false);
        }
        c_ok &= inp.is_c_contiguous();
        f_ok &= inp.is_f_contiguous();
    }
    if !c_ok && !f_ok {
        return Ok(false);
    }

    // Mismatched input dtypes only pass for small ranks, by copy.
    let mut staged: Vec<Array> = Vec::with_capacity(frame.inputs.len());
    for (i, inp) in frame.inputs.iter().enumerate() {
        if inp.dtype().id() == entry.ins[i].id() {
            staged.push(inp.clone());
        } else if inp.ndim() <= 1 || inp.len() == 1 {
            staged.push(contiguous_copy(inp, &entry.ins[i], MemoryOrder::C)?);
        } else {
            return Ok(false);
        }
    }

    let total: usize = frame.shape.iter().product();
    let mut data = Vec::with_capacity(staged.len() + 1);
    let mut strides = Vec::with_capacity(staged.len() + 1);
    for inp in &staged {
        data.push(inp.data_ptr());
        strides.push(if inp.len() == 1 {
            0
        } else {
            inp.itemsize() as isize
        });
    }
    data.push(out.data_ptr());
    strides.push(out.itemsize() as isize);

    let all: Vec<&Array> = staged.iter().chain(std::iter::once(out)).collect();
    let _guard = maybe_release(opts.bracket, total, &all);
    unsafe { (entry.loop_fn)(&data, &[total], &strides, ctx)? };
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::execute::prepare_frame;
    use crate::ufunc::Identity;

    unsafe fn mul_f64(
        data: &[*mut u8],
        dims: &[usize],
        strides: &[isize],
        _ctx: &mut LoopContext,
    ) -> Result<()> {
        for k in 0..dims[0] as isize {
            let a = *(data[0].offset(k * strides[0]) as *const f64);
            let b = *(data[1].offset(k * strides[1]) as *const f64);
            *(data[2].offset(k * strides[2]) as *mut f64) = a * b;
        }
        Ok(())
    }

    fn multiply() -> UFunc {
        UFunc::builder("multiply", 2, 1)
            .identity(Identity::One)
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                mul_f64,
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_contiguous_same_dtype_takes_fast_path() {
        let u = multiply();
        let a = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = Array::from_vec(vec![5.0f64, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, b], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
        assert_eq!(
            frame.outputs[0].to_vec::<f64>().unwrap(),
            vec![5.0, 12.0, 21.0, 32.0]
        );
    }

    #[test]
    fn test_scalar_operand_allowed() {
        let u = multiply();
        let a = Array::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
        let s = Array::scalar(10.0f64).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, s], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
        assert_eq!(
            frame.outputs[0].to_vec::<f64>().unwrap(),
            vec![10.0, 20.0, 30.0]
        );
    }

    #[test]
    fn test_broadcast_input_falls_back() {
        let u = multiply();
        let a = Array::from_vec(vec![1.0f64; 6], &[2, 3]).unwrap();
        let b = Array::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, b], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(!try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
    }

    #[test]
    fn test_rank1_dtype_mismatch_cast_copies() {
        let u = multiply();
        let a = Array::from_vec(vec![1i32, 2, 3], &[3]).unwrap();
        let b = Array::from_vec(vec![2.0f64, 2.0, 2.0], &[3]).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, b], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
        assert_eq!(
            frame.outputs[0].to_vec::<f64>().unwrap(),
            vec![2.0, 4.0, 6.0]
        );
    }

    #[test]
    fn test_rank2_dtype_mismatch_falls_back() {
        let u = multiply();
        let a = Array::from_vec(vec![1i32, 2, 3, 4], &[2, 2]).unwrap();
        let b = Array::from_vec(vec![2.0f64; 4], &[2, 2]).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, b], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(!try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
    }

    #[test]
    fn test_strided_view_falls_back() {
        let u = multiply();
        let base = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[6]).unwrap();
        let a = base.slice_axis(0, 0, 3, 2).unwrap();
        let b = Array::from_vec(vec![1.0f64, 1.0, 1.0], &[3]).unwrap();
        let opts = CallOptions::default();
        let frame = prepare_frame(&u, &[a, b], &opts).unwrap();
        let mut ctx = LoopContext::default();
        assert!(!try_trivial(&u, &frame, &opts, &mut ctx).unwrap());
    }

    #[test]
    fn test_fast_and_generic_agree_bitwise() {
        let u = multiply();
        let vals: Vec<f64> = (0..64).map(|i| (i as f64) * 0.37 + 0.1).collect();
        let a = Array::from_vec(vals.clone(), &[64]).unwrap();
        let b = Array::from_vec(vals.clone(), &[64]).unwrap();
        let fast = u
            .call(&[a.clone(), b.clone()], &CallOptions::default())
            .unwrap();

        // The same values through a stride-2 view, forcing the generic loop.
        let mut wide = vec![0.0f64; 128];
        for (i, v) in vals.iter().enumerate() {
            wide[2 * i] = *v;
        }
        let strided = Array::from_vec(wide, &[128])
            .unwrap()
            .slice_axis(0, 0, 64, 2)
            .unwrap();
        let slow = u.call(&[strided, b], &CallOptions::default()).unwrap();

        let f = fast[0].to_vec::<f64>().unwrap();
        let s = slow[0].to_vec::<f64>().unwrap();
        for (x, y) in f.iter().zip(s.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }
}
