//! Element type descriptors, casting rules and strided cast loops.
//!
//! A [`DType`] describes the storage of one array element: identity, byte
//! size, alignment, and whether the element kind requires exclusive runtime
//! access (reference-counted object elements do; plain numeric elements do
//! not). The engine never interprets element bytes itself beyond what these
//! descriptors expose: moves of object elements go through explicit
//! `acquire`/`release`, and dtype conversions go through [`cast_block`].

use crate::{Result, UFuncError};
use num_complex::Complex;
use num_traits::AsPrimitive;
use std::sync::Arc;

/// Identity of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeId {
    Bool,
    UInt8,
    Int32,
    Int64,
    UInt64,
    Float32,
    Float64,
    Complex128,
    /// Reference-counted boxed element (see [`ObjectCell`]).
    Object,
    /// User-registered element type, identified by its registration number.
    Custom(u32),
}

/// Coarse kind grouping used by the casting lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    Bool,
    UInt,
    Int,
    Float,
    Complex,
    Object,
    Custom,
}

/// An element type descriptor: size, alignment and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DType {
    id: DTypeId,
    size: usize,
    align: usize,
}

impl DType {
    pub fn bool_() -> Self {
        Self { id: DTypeId::Bool, size: 1, align: 1 }
    }
    pub fn uint8() -> Self {
        Self { id: DTypeId::UInt8, size: 1, align: 1 }
    }
    pub fn int32() -> Self {
        Self { id: DTypeId::Int32, size: 4, align: 4 }
    }
    pub fn int64() -> Self {
        Self { id: DTypeId::Int64, size: 8, align: 8 }
    }
    pub fn uint64() -> Self {
        Self { id: DTypeId::UInt64, size: 8, align: 8 }
    }
    pub fn float32() -> Self {
        Self { id: DTypeId::Float32, size: 4, align: 4 }
    }
    pub fn float64() -> Self {
        Self { id: DTypeId::Float64, size: 8, align: 8 }
    }
    pub fn complex128() -> Self {
        Self { id: DTypeId::Complex128, size: 16, align: 8 }
    }

    /// Reference-counted object element; one pointer-sized slot per element.
    pub fn object() -> Self {
        Self {
            id: DTypeId::Object,
            size: std::mem::size_of::<*const ObjectCell>(),
            align: std::mem::align_of::<*const ObjectCell>(),
        }
    }

    /// A user-registered element type with an explicit layout.
    pub fn custom(num: u32, size: usize, align: usize) -> Self {
        Self { id: DTypeId::Custom(num), size, align }
    }

    #[inline]
    pub fn id(&self) -> DTypeId {
        self.id
    }

    /// Size of one element in bytes.
    #[inline]
    pub fn itemsize(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.align
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        self.id == DTypeId::Object
    }

    /// Whether elements of this kind may only be touched while holding the
    /// ambient single-threaded runtime. Disqualifies the thread bracket.
    #[inline]
    pub fn needs_exclusive_runtime(&self) -> bool {
        self.is_object()
    }

    pub fn name(&self) -> &'static str {
        match self.id {
            DTypeId::Bool => "bool",
            DTypeId::UInt8 => "uint8",
            DTypeId::Int32 => "int32",
            DTypeId::Int64 => "int64",
            DTypeId::UInt64 => "uint64",
            DTypeId::Float32 => "float32",
            DTypeId::Float64 => "float64",
            DTypeId::Complex128 => "complex128",
            DTypeId::Object => "object",
            DTypeId::Custom(_) => "custom",
        }
    }

    fn kind(&self) -> Kind {
        match self.id {
            DTypeId::Bool => Kind::Bool,
            DTypeId::UInt8 | DTypeId::UInt64 => Kind::UInt,
            DTypeId::Int32 | DTypeId::Int64 => Kind::Int,
            DTypeId::Float32 | DTypeId::Float64 => Kind::Float,
            DTypeId::Complex128 => Kind::Complex,
            DTypeId::Object => Kind::Object,
            DTypeId::Custom(_) => Kind::Custom,
        }
    }

    // ------------------------------------------------------------------
    // Element move semantics
    // ------------------------------------------------------------------

    /// Acquire a new reference to the element at `ptr`. No-op for all
    /// non-object kinds.
    ///
    /// # Safety
    /// `ptr` must point at a validly initialized element of this dtype.
    #[inline]
    pub unsafe fn acquire(&self, ptr: *mut u8) {
        if self.is_object() {
            object_acquire(ptr)
        }
    }

    /// Release the reference held by the element at `ptr`. No-op for all
    /// non-object kinds.
    ///
    /// # Safety
    /// See [`DType::acquire`].
    #[inline]
    pub unsafe fn release(&self, ptr: *mut u8) {
        if self.is_object() {
            object_release(ptr)
        }
    }

    /// Copy one element from `src` to `dst`.
    ///
    /// For object elements the new reference is acquired before the old one
    /// is released, so `dst == src` (in-place self-copy) is safe and leaves
    /// the refcount unchanged.
    ///
    /// # Safety
    /// Both pointers must reference validly initialized elements of this
    /// dtype; `dst` must be writable.
    #[inline]
    pub unsafe fn copy_element(&self, dst: *mut u8, src: *const u8) {
        if self.is_object() {
            object_acquire(src as *mut u8);
            object_release(dst);
        }
        std::ptr::copy(src, dst, self.size);
    }

    /// Materialize a typed scalar into this dtype's byte representation.
    pub fn scalar_bytes(&self, value: &ScalarValue) -> Result<Vec<u8>> {
        let f = match value {
            ScalarValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            ScalarValue::Int(v) => *v as f64,
            ScalarValue::UInt(v) => *v as f64,
            ScalarValue::Float(v) => *v,
            ScalarValue::Complex(c) => {
                if self.id == DTypeId::Complex128 {
                    let mut out = vec![0u8; self.size];
                    out.copy_from_slice(bytemuck::bytes_of(&PodC128 { re: c.re, im: c.im }));
                    return Ok(out);
                }
                c.re
            }
            ScalarValue::Object(cell) => {
                if self.id == DTypeId::Object {
                    let raw = Arc::into_raw(cell.clone());
                    return Ok(raw_ptr_bytes(raw));
                }
                cell.value
            }
        };
        let mut out = vec![0u8; self.size];
        match self.id {
            DTypeId::Bool => out[0] = (f != 0.0) as u8,
            DTypeId::UInt8 => out[0] = f as u8,
            DTypeId::Int32 => out.copy_from_slice(&(f as i32).to_ne_bytes()),
            DTypeId::Int64 => out.copy_from_slice(&(f as i64).to_ne_bytes()),
            DTypeId::UInt64 => out.copy_from_slice(&(f as u64).to_ne_bytes()),
            DTypeId::Float32 => out.copy_from_slice(&(f as f32).to_ne_bytes()),
            DTypeId::Float64 => out.copy_from_slice(&f.to_ne_bytes()),
            DTypeId::Complex128 => {
                out.copy_from_slice(bytemuck::bytes_of(&PodC128 { re: f, im: 0.0 }))
            }
            DTypeId::Object => {
                let raw = Arc::into_raw(Arc::new(ObjectCell { value: f }));
                return Ok(raw_ptr_bytes(raw));
            }
            DTypeId::Custom(_) => {
                return Err(UFuncError::Usage(
                    "cannot materialize a scalar for a custom dtype".into(),
                ))
            }
        }
        Ok(out)
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct PodC128 {
    re: f64,
    im: f64,
}

fn raw_ptr_bytes(raw: *const ObjectCell) -> Vec<u8> {
    let mut out = vec![0u8; std::mem::size_of::<*const ObjectCell>()];
    out.copy_from_slice(&(raw as usize).to_ne_bytes());
    out
}

// ============================================================================
// Typed scalars
// ============================================================================

/// A typed scalar value, used for reduction identities and `initial=`.
#[derive(Debug, Clone)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Complex(Complex<f64>),
    Object(Arc<ObjectCell>),
}

// ============================================================================
// Casting rules
// ============================================================================

/// Casting safety rule, from strictest to loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Casting {
    No,
    Equiv,
    #[default]
    Safe,
    SameKind,
    Unsafe,
}

impl Casting {
    pub fn name(&self) -> &'static str {
        match self {
            Casting::No => "no",
            Casting::Equiv => "equiv",
            Casting::Safe => "safe",
            Casting::SameKind => "same_kind",
            Casting::Unsafe => "unsafe",
        }
    }
}

/// Whether `from` can be cast to `to` under `casting`.
pub fn can_cast(from: &DType, to: &DType, casting: Casting) -> bool {
    if from.id() == to.id() {
        return true;
    }
    match casting {
        Casting::No | Casting::Equiv => false,
        Casting::Safe => can_cast_safe(from, to),
        Casting::SameKind => {
            can_cast_safe(from, to)
                || (numeric_kind(from) && numeric_kind(to) && to.kind() >= from.kind())
        }
        Casting::Unsafe => {
            (numeric_kind(from) && numeric_kind(to)) || to.id() == DTypeId::Object
        }
    }
}

fn numeric_kind(dt: &DType) -> bool {
    matches!(
        dt.kind(),
        Kind::Bool | Kind::UInt | Kind::Int | Kind::Float | Kind::Complex
    )
}

fn can_cast_safe(from: &DType, to: &DType) -> bool {
    use DTypeId::*;
    if to.id() == Object && numeric_kind(from) {
        return true;
    }
    match from.id() {
        Bool => numeric_kind(to),
        UInt8 => matches!(to.id(), Int32 | Int64 | UInt64 | Float32 | Float64 | Complex128),
        Int32 => matches!(to.id(), Int64 | Float64 | Complex128),
        Int64 => matches!(to.id(), Float64 | Complex128),
        UInt64 => matches!(to.id(), Float64 | Complex128),
        Float32 => matches!(to.id(), Float64 | Complex128),
        Float64 => matches!(to.id(), Complex128),
        Complex128 | Object | Custom(_) => false,
    }
}

// ============================================================================
// Strided cast-copy loops
// ============================================================================

#[inline]
unsafe fn cast_loop<S: Copy, D>(
    src: *const u8,
    src_stride: isize,
    dst: *mut u8,
    dst_stride: isize,
    count: usize,
    conv: impl Fn(S) -> D,
) {
    let mut sp = src;
    let mut dp = dst;
    for _ in 0..count {
        let v = std::ptr::read_unaligned(sp as *const S);
        std::ptr::write_unaligned(dp as *mut D, conv(v));
        sp = sp.offset(src_stride);
        dp = dp.offset(dst_stride);
    }
}

macro_rules! cast_from_numeric {
    ($S:ty, $to:expr, $src:expr, $ss:expr, $dst:expr, $ds:expr, $n:expr) => {{
        match $to {
            DTypeId::Bool => cast_loop::<$S, u8>($src, $ss, $dst, $ds, $n, |v| {
                (v != <$S as num_traits::Zero>::zero()) as u8
            }),
            DTypeId::UInt8 => cast_loop::<$S, u8>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::Int32 => cast_loop::<$S, i32>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::Int64 => cast_loop::<$S, i64>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::UInt64 => cast_loop::<$S, u64>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::Float32 => cast_loop::<$S, f32>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::Float64 => cast_loop::<$S, f64>($src, $ss, $dst, $ds, $n, |v| v.as_()),
            DTypeId::Complex128 => cast_loop::<$S, Complex<f64>>($src, $ss, $dst, $ds, $n, |v| {
                Complex::new(v.as_(), 0.0)
            }),
            _ => unreachable!("non-numeric cast target"),
        }
    }};
}

/// Strided cast-copy of `count` elements from `src` dtype to `dst` dtype.
///
/// Strides are in bytes. Object and custom dtypes are never castable through
/// this path; a mismatch there is reported as a cast error up front.
///
/// # Safety
/// Both pointers must address `count` valid strided elements of the stated
/// dtypes, and the regions must either not overlap or be identical layouts.
pub(crate) unsafe fn cast_block(
    from: &DType,
    to: &DType,
    src: *const u8,
    src_stride: isize,
    dst: *mut u8,
    dst_stride: isize,
    count: usize,
) -> Result<()> {
    use DTypeId::*;
    if !numeric_kind(from) || !numeric_kind(to) {
        return Err(UFuncError::CastError {
            from: from.name(),
            to: to.name(),
            rule: "unsafe",
        });
    }
    match from.id() {
        Bool | UInt8 => cast_from_numeric!(u8, to.id(), src, src_stride, dst, dst_stride, count),
        Int32 => cast_from_numeric!(i32, to.id(), src, src_stride, dst, dst_stride, count),
        Int64 => cast_from_numeric!(i64, to.id(), src, src_stride, dst, dst_stride, count),
        UInt64 => cast_from_numeric!(u64, to.id(), src, src_stride, dst, dst_stride, count),
        Float32 => cast_from_numeric!(f32, to.id(), src, src_stride, dst, dst_stride, count),
        Float64 => cast_from_numeric!(f64, to.id(), src, src_stride, dst, dst_stride, count),
        Complex128 => match to.id() {
            Complex128 => cast_loop::<Complex<f64>, Complex<f64>>(
                src, src_stride, dst, dst_stride, count, |v| v,
            ),
            Bool => cast_loop::<Complex<f64>, u8>(src, src_stride, dst, dst_stride, count, |v| {
                (v.re != 0.0 || v.im != 0.0) as u8
            }),
            UInt8 => {
                cast_loop::<Complex<f64>, u8>(src, src_stride, dst, dst_stride, count, |v| {
                    v.re as u8
                })
            }
            Int32 => {
                cast_loop::<Complex<f64>, i32>(src, src_stride, dst, dst_stride, count, |v| {
                    v.re as i32
                })
            }
            Int64 => {
                cast_loop::<Complex<f64>, i64>(src, src_stride, dst, dst_stride, count, |v| {
                    v.re as i64
                })
            }
            UInt64 => {
                cast_loop::<Complex<f64>, u64>(src, src_stride, dst, dst_stride, count, |v| {
                    v.re as u64
                })
            }
            Float32 => {
                cast_loop::<Complex<f64>, f32>(src, src_stride, dst, dst_stride, count, |v| {
                    v.re as f32
                })
            }
            Float64 => {
                cast_loop::<Complex<f64>, f64>(src, src_stride, dst, dst_stride, count, |v| v.re)
            }
            _ => unreachable!("non-numeric cast target"),
        },
        Object | Custom(_) => unreachable!("checked above"),
    }
    Ok(())
}

/// Read the element at `ptr` widened to `f64`, when the dtype allows it.
///
/// # Safety
/// `ptr` must address a valid element of `dtype`.
pub(crate) unsafe fn element_to_f64(dtype: &DType, ptr: *const u8) -> Option<f64> {
    Some(match dtype.id() {
        DTypeId::Bool | DTypeId::UInt8 => std::ptr::read_unaligned(ptr) as f64,
        DTypeId::Int32 => std::ptr::read_unaligned(ptr as *const i32) as f64,
        DTypeId::Int64 => std::ptr::read_unaligned(ptr as *const i64) as f64,
        DTypeId::UInt64 => std::ptr::read_unaligned(ptr as *const u64) as f64,
        DTypeId::Float32 => std::ptr::read_unaligned(ptr as *const f32) as f64,
        DTypeId::Float64 => std::ptr::read_unaligned(ptr as *const f64),
        DTypeId::Complex128 => std::ptr::read_unaligned(ptr as *const Complex<f64>).re,
        DTypeId::Object => object_read(ptr).map(|c| c.value)?,
        DTypeId::Custom(_) => return None,
    })
}

// ============================================================================
// Object element kind
// ============================================================================

/// Payload of one reference-counted object element.
///
/// Stand-in for an arbitrary host-runtime object: the engine only ever moves
/// these by pointer and adjusts the reference count through
/// `acquire`/`release`.
#[derive(Debug)]
pub struct ObjectCell {
    pub value: f64,
}

#[inline]
unsafe fn object_slot(ptr: *const u8) -> *const ObjectCell {
    usize::from_ne_bytes(
        std::slice::from_raw_parts(ptr, std::mem::size_of::<usize>())
            .try_into()
            .unwrap_or([0; std::mem::size_of::<usize>()]),
    ) as *const ObjectCell
}

/// Increment the refcount of the object stored at `ptr` (null slots allowed).
pub(crate) unsafe fn object_acquire(ptr: *mut u8) {
    let raw = object_slot(ptr);
    if !raw.is_null() {
        Arc::increment_strong_count(raw);
    }
}

/// Decrement the refcount of the object stored at `ptr` (null slots allowed).
pub(crate) unsafe fn object_release(ptr: *const u8) {
    let raw = object_slot(ptr);
    if !raw.is_null() {
        Arc::decrement_strong_count(raw);
    }
}

/// Clone out the object stored at `ptr`, if any.
pub(crate) unsafe fn object_read(ptr: *const u8) -> Option<Arc<ObjectCell>> {
    let raw = object_slot(ptr);
    if raw.is_null() {
        return None;
    }
    Arc::increment_strong_count(raw);
    Some(Arc::from_raw(raw))
}

/// Store `cell` into the slot at `ptr`, releasing whatever was there.
pub(crate) unsafe fn object_write(ptr: *mut u8, cell: Option<Arc<ObjectCell>>) {
    let new_raw = match cell {
        Some(c) => Arc::into_raw(c),
        None => std::ptr::null(),
    };
    object_release(ptr);
    std::ptr::copy_nonoverlapping(
        (new_raw as usize).to_ne_bytes().as_ptr(),
        ptr,
        std::mem::size_of::<usize>(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_cast_lattice() {
        assert!(can_cast(&DType::bool_(), &DType::float64(), Casting::Safe));
        assert!(can_cast(&DType::int32(), &DType::int64(), Casting::Safe));
        assert!(can_cast(&DType::float64(), &DType::complex128(), Casting::Safe));
        assert!(!can_cast(&DType::int64(), &DType::int32(), Casting::Safe));
        assert!(!can_cast(&DType::float64(), &DType::float32(), Casting::Safe));
        assert!(can_cast(&DType::int64(), &DType::int32(), Casting::SameKind));
        assert!(can_cast(&DType::float64(), &DType::int32(), Casting::Unsafe));
        assert!(!can_cast(&DType::complex128(), &DType::float64(), Casting::Safe));
    }

    #[test]
    fn test_cast_block_i32_to_f64() {
        let src: Vec<i32> = vec![1, -2, 3, -4];
        let mut dst = vec![0.0_f64; 4];
        unsafe {
            cast_block(
                &DType::int32(),
                &DType::float64(),
                src.as_ptr() as *const u8,
                4,
                dst.as_mut_ptr() as *mut u8,
                8,
                4,
            )
            .unwrap();
        }
        assert_eq!(dst, vec![1.0, -2.0, 3.0, -4.0]);
    }

    #[test]
    fn test_cast_block_strided_bool() {
        // Every other element of the source, written to bool.
        let src: Vec<f64> = vec![0.0, 9.0, 2.0, 9.0, 0.0, 9.0];
        let mut dst = vec![7u8; 3];
        unsafe {
            cast_block(
                &DType::float64(),
                &DType::bool_(),
                src.as_ptr() as *const u8,
                16,
                dst.as_mut_ptr() as *mut u8,
                1,
                3,
            )
            .unwrap();
        }
        assert_eq!(dst, vec![0, 1, 0]);
    }

    #[test]
    fn test_object_slot_roundtrip() {
        let mut slot = vec![0u8; DType::object().itemsize()];
        let cell = Arc::new(ObjectCell { value: 2.5 });
        unsafe {
            object_write(slot.as_mut_ptr(), Some(cell.clone()));
            assert_eq!(Arc::strong_count(&cell), 2);
            let read = object_read(slot.as_ptr()).unwrap();
            assert_eq!(read.value, 2.5);
            drop(read);
            object_release(slot.as_ptr());
        }
        assert_eq!(Arc::strong_count(&cell), 1);
    }

    #[test]
    fn test_copy_element_self_copy_object() {
        let dt = DType::object();
        let mut slot = vec![0u8; dt.itemsize()];
        let cell = Arc::new(ObjectCell { value: 1.0 });
        unsafe {
            object_write(slot.as_mut_ptr(), Some(cell.clone()));
            // In-place self-copy must leave the refcount unchanged.
            dt.copy_element(slot.as_mut_ptr(), slot.as_ptr());
            assert_eq!(Arc::strong_count(&cell), 2);
            object_release(slot.as_ptr());
        }
        assert_eq!(Arc::strong_count(&cell), 1);
    }

    #[test]
    fn test_scalar_bytes_identity() {
        let bytes = DType::float64().scalar_bytes(&ScalarValue::Int(1)).unwrap();
        assert_eq!(f64::from_ne_bytes(bytes.try_into().unwrap()), 1.0);
        let bytes = DType::int64().scalar_bytes(&ScalarValue::Int(0)).unwrap();
        assert_eq!(i64::from_ne_bytes(bytes.try_into().unwrap()), 0);
    }
}
