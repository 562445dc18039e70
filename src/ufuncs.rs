//! Reference operation set.
//!
//! Factory functions building the stock operations with their strided loops
//! registered, standing in for a generated loop table. The kernels are
//! plain scalar loops over `dims[0]`; blocking, casting, masking and
//! broadcasting all happen in the engine around them. Element access goes
//! through unaligned reads and writes because views may sit at any byte
//! offset of a shared buffer.

use std::sync::Arc;

use crate::dtype::{object_read, object_write, DType, ObjectCell};
use crate::registry::LoopContext;
use crate::ufunc::{Identity, UFunc};
use crate::Result;

macro_rules! binary_loop {
    ($fname:ident, $ty:ty, |$a:ident, $b:ident| $body:expr) => {
        unsafe fn $fname(
            data: &[*mut u8],
            dims: &[usize],
            strides: &[isize],
            _ctx: &mut LoopContext,
        ) -> Result<()> {
            for k in 0..dims[0] as isize {
                let $a = (data[0].offset(k * strides[0]) as *const $ty).read_unaligned();
                let $b = (data[1].offset(k * strides[1]) as *const $ty).read_unaligned();
                (data[2].offset(k * strides[2]) as *mut $ty).write_unaligned($body);
            }
            Ok(())
        }
    };
}

macro_rules! unary_loop {
    ($fname:ident, $ty:ty, |$a:ident| $body:expr) => {
        unsafe fn $fname(
            data: &[*mut u8],
            dims: &[usize],
            strides: &[isize],
            _ctx: &mut LoopContext,
        ) -> Result<()> {
            for k in 0..dims[0] as isize {
                let $a = (data[0].offset(k * strides[0]) as *const $ty).read_unaligned();
                (data[1].offset(k * strides[1]) as *mut $ty).write_unaligned($body);
            }
            Ok(())
        }
    };
}

binary_loop!(add_i64, i64, |a, b| a.wrapping_add(b));
binary_loop!(add_f32, f32, |a, b| a + b);
binary_loop!(add_f64, f64, |a, b| a + b);
binary_loop!(add_c128, num_complex::Complex<f64>, |a, b| a + b);

binary_loop!(sub_i64, i64, |a, b| a.wrapping_sub(b));
binary_loop!(sub_f32, f32, |a, b| a - b);
binary_loop!(sub_f64, f64, |a, b| a - b);

binary_loop!(mul_i64, i64, |a, b| a.wrapping_mul(b));
binary_loop!(mul_f32, f32, |a, b| a * b);
binary_loop!(mul_f64, f64, |a, b| a * b);
binary_loop!(mul_c128, num_complex::Complex<f64>, |a, b| a * b);

binary_loop!(min_i64, i64, |a, b| a.min(b));
binary_loop!(max_i64, i64, |a, b| a.max(b));
// NaN propagates from either side, like the analytic min/max of a set
// containing an undefined value.
binary_loop!(min_f64, f64, |a, b| if a.is_nan() || a < b { a } else { b });
binary_loop!(max_f64, f64, |a, b| if a.is_nan() || a > b { a } else { b });

unary_loop!(neg_i64, i64, |a| a.wrapping_neg());
unary_loop!(neg_f32, f32, |a| -a);
unary_loop!(neg_f64, f64, |a| -a);

unary_loop!(sin_f32, f32, |a| a.sin());
unary_loop!(sin_f64, f64, |a| a.sin());

unsafe fn div_f64(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    ctx: &mut LoopContext,
) -> Result<()> {
    for k in 0..dims[0] as isize {
        let a = (data[0].offset(k * strides[0]) as *const f64).read_unaligned();
        let b = (data[1].offset(k * strides[1]) as *const f64).read_unaligned();
        if b == 0.0 {
            if a == 0.0 || a.is_nan() {
                ctx.fp.invalid = true;
            } else {
                ctx.fp.divide_by_zero = true;
            }
        }
        (data[2].offset(k * strides[2]) as *mut f64).write_unaligned(a / b);
    }
    Ok(())
}

unsafe fn div_f32(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    ctx: &mut LoopContext,
) -> Result<()> {
    for k in 0..dims[0] as isize {
        let a = (data[0].offset(k * strides[0]) as *const f32).read_unaligned();
        let b = (data[1].offset(k * strides[1]) as *const f32).read_unaligned();
        if b == 0.0 {
            if a == 0.0 || a.is_nan() {
                ctx.fp.invalid = true;
            } else {
                ctx.fp.divide_by_zero = true;
            }
        }
        (data[2].offset(k * strides[2]) as *mut f32).write_unaligned(a / b);
    }
    Ok(())
}

// Object loops. Empty slots read as 0.0; every write transfers a fresh
// reference and releases the previous occupant, which keeps full aliasing
// (out is also an input) safe.

unsafe fn obj_value(ptr: *const u8) -> f64 {
    object_read(ptr).map(|c| c.value).unwrap_or(0.0)
}

unsafe fn add_obj(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    _ctx: &mut LoopContext,
) -> Result<()> {
    for k in 0..dims[0] as isize {
        let a = obj_value(data[0].offset(k * strides[0]));
        let b = obj_value(data[1].offset(k * strides[1]));
        object_write(
            data[2].offset(k * strides[2]),
            Some(Arc::new(ObjectCell { value: a + b })),
        );
    }
    Ok(())
}

unsafe fn mul_obj(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    _ctx: &mut LoopContext,
) -> Result<()> {
    for k in 0..dims[0] as isize {
        let a = obj_value(data[0].offset(k * strides[0]));
        let b = obj_value(data[1].offset(k * strides[1]));
        object_write(
            data[2].offset(k * strides[2]),
            Some(Arc::new(ObjectCell { value: a * b })),
        );
    }
    Ok(())
}

// Generalized kernels. Convention: dims = [n_outer, distinct core sizes...],
// strides = [outer stride per operand..., then each operand's declared core
// strides in signature order].

unsafe fn inner1d_f64(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    _ctx: &mut LoopContext,
) -> Result<()> {
    let (n, di) = (dims[0], dims[1]);
    for k in 0..n as isize {
        let a = data[0].offset(k * strides[0]);
        let b = data[1].offset(k * strides[1]);
        let out = data[2].offset(k * strides[2]);
        let mut acc = 0.0f64;
        for j in 0..di as isize {
            let x = (a.offset(j * strides[3]) as *const f64).read_unaligned();
            let y = (b.offset(j * strides[4]) as *const f64).read_unaligned();
            acc += x * y;
        }
        (out as *mut f64).write_unaligned(acc);
    }
    Ok(())
}

unsafe fn matmul_f64(
    data: &[*mut u8],
    dims: &[usize],
    strides: &[isize],
    _ctx: &mut LoopContext,
) -> Result<()> {
    // Distinct core dims in order of appearance: m, n, p. Flexible dims
    // dropped from a call come through as size 1 with stride 0.
    let (outer, dm, dn, dp) = (dims[0], dims[1], dims[2], dims[3]);
    let (sa_m, sa_n) = (strides[3], strides[4]);
    let (sb_n, sb_p) = (strides[5], strides[6]);
    let (sc_m, sc_p) = (strides[7], strides[8]);
    for k in 0..outer as isize {
        let a = data[0].offset(k * strides[0]);
        let b = data[1].offset(k * strides[1]);
        let c = data[2].offset(k * strides[2]);
        for i in 0..dm as isize {
            for l in 0..dp as isize {
                let mut acc = 0.0f64;
                for t in 0..dn as isize {
                    let x = (a.offset(i * sa_m + t * sa_n) as *const f64).read_unaligned();
                    let y = (b.offset(t * sb_n + l * sb_p) as *const f64).read_unaligned();
                    acc += x * y;
                }
                (c.offset(i * sc_m + l * sc_p) as *mut f64).write_unaligned(acc);
            }
        }
    }
    Ok(())
}

fn f64_pair() -> (Vec<DType>, Vec<DType>) {
    (
        vec![DType::float64(), DType::float64()],
        vec![DType::float64()],
    )
}

/// Elementwise addition. Sum-like: integer reductions widen to 64 bits.
pub fn add() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("add", 2, 1)
        .identity(Identity::Zero)
        .promotes_integers(true)
        .loop_for(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            add_i64,
        )
        .loop_for(
            vec![DType::float32(), DType::float32()],
            vec![DType::float32()],
            add_f32,
        )
        .loop_for(ins, outs, add_f64)
        .loop_for(
            vec![DType::complex128(), DType::complex128()],
            vec![DType::complex128()],
            add_c128,
        )
        .loop_for(
            vec![DType::object(), DType::object()],
            vec![DType::object()],
            add_obj,
        )
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise subtraction.
pub fn subtract() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("subtract", 2, 1)
        .loop_for(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            sub_i64,
        )
        .loop_for(
            vec![DType::float32(), DType::float32()],
            vec![DType::float32()],
            sub_f32,
        )
        .loop_for(ins, outs, sub_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise multiplication. Product-like: integer reductions widen.
pub fn multiply() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("multiply", 2, 1)
        .identity(Identity::One)
        .promotes_integers(true)
        .loop_for(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            mul_i64,
        )
        .loop_for(
            vec![DType::float32(), DType::float32()],
            vec![DType::float32()],
            mul_f32,
        )
        .loop_for(ins, outs, mul_f64)
        .loop_for(
            vec![DType::complex128(), DType::complex128()],
            vec![DType::complex128()],
            mul_c128,
        )
        .loop_for(
            vec![DType::object(), DType::object()],
            vec![DType::object()],
            mul_obj,
        )
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise division, raising the sticky divide-by-zero and invalid
/// flags the way IEEE division does.
pub fn divide() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("divide", 2, 1)
        .loop_for(
            vec![DType::float32(), DType::float32()],
            vec![DType::float32()],
            div_f32,
        )
        .loop_for(ins, outs, div_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise minimum, NaN-propagating.
pub fn minimum() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("minimum", 2, 1)
        .identity(Identity::ReorderableNone)
        .loop_for(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            min_i64,
        )
        .loop_for(ins, outs, min_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise maximum, NaN-propagating.
pub fn maximum() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("maximum", 2, 1)
        .identity(Identity::ReorderableNone)
        .loop_for(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            max_i64,
        )
        .loop_for(ins, outs, max_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise negation.
pub fn negative() -> UFunc {
    UFunc::builder("negative", 1, 1)
        .loop_for(vec![DType::int64()], vec![DType::int64()], neg_i64)
        .loop_for(vec![DType::float32()], vec![DType::float32()], neg_f32)
        .loop_for(vec![DType::float64()], vec![DType::float64()], neg_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Elementwise sine.
pub fn sin() -> UFunc {
    UFunc::builder("sin", 1, 1)
        .loop_for(vec![DType::float32()], vec![DType::float32()], sin_f32)
        .loop_for(vec![DType::float64()], vec![DType::float64()], sin_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Generalized inner product over the last axis: `(i),(i)->()`.
pub fn inner1d() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("inner1d", 2, 1)
        .signature("(i),(i)->()")
        .loop_for(ins, outs, inner1d_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}

/// Generalized matrix product with flexible one-dimensional operands:
/// `(m?,n),(n,p?)->(m?,p?)`.
pub fn matmul() -> UFunc {
    let (ins, outs) = f64_pair();
    UFunc::builder("matmul", 2, 1)
        .signature("(m?,n),(n,p?)->(m?,p?)")
        .loop_for(ins, outs, matmul_f64)
        .build()
        .unwrap_or_else(|_| unreachable!("static ufunc definition"))
}
