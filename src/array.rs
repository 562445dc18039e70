//! Shared-buffer strided N-d arrays.
//!
//! [`Array`] is a cheap-to-clone handle onto a reference-counted byte buffer:
//! dtype descriptor, shape, byte strides and a byte offset. Clones share
//! storage, so supplied output operands can be written in place and returned
//! to the caller. The engine itself only ever borrows operands for the
//! duration of one call; freshly allocated outputs come back as new handles.
//!
//! Views (`permute`, `slice_axis`, `reshape`) are zero-copy and may carry
//! negative strides. A rank-0 array is a scalar. The backing buffer releases
//! object elements when the last handle drops.

use crate::dtype::{element_to_f64, object_read, object_release, object_write};
use crate::{DType, ObjectCell, Result, ScalarValue, UFuncError};
use num_complex::Complex;
use std::cell::UnsafeCell;
use std::sync::Arc;

/// Requested memory order for freshly allocated arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryOrder {
    /// Row-major (last axis fastest).
    #[default]
    C,
    /// Column-major (first axis fastest).
    F,
}

struct Buffer {
    data: UnsafeCell<Vec<u8>>,
    dtype: DType,
    elements: usize,
}

impl Buffer {
    #[inline]
    fn base(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }

    #[inline]
    fn len(&self) -> usize {
        unsafe { (*self.data.get()).len() }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.dtype.is_object() {
            let item = self.dtype.itemsize();
            let base = self.base();
            for i in 0..self.elements {
                unsafe { object_release(base.add(i * item)) };
            }
        }
    }
}

/// A strided N-d array handle over shared, dtype-erased storage.
pub struct Array {
    buf: Arc<Buffer>,
    dtype: DType,
    dims: Vec<usize>,
    strides: Vec<isize>,
    offset: isize,
    writable: bool,
}

impl Clone for Array {
    /// Shallow clone: shares the backing buffer.
    fn clone(&self) -> Self {
        Self {
            buf: Arc::clone(&self.buf),
            dtype: self.dtype,
            dims: self.dims.clone(),
            strides: self.strides.clone(),
            offset: self.offset,
            writable: self.writable,
        }
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("dtype", &self.dtype.name())
            .field("dims", &self.dims)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish()
    }
}

/// Default byte strides for the given shape and order.
pub(crate) fn contiguous_strides(dims: &[usize], itemsize: usize, order: MemoryOrder) -> Vec<isize> {
    let mut strides = vec![0isize; dims.len()];
    let mut acc = itemsize as isize;
    match order {
        MemoryOrder::C => {
            for i in (0..dims.len()).rev() {
                strides[i] = acc;
                acc *= dims[i].max(1) as isize;
            }
        }
        MemoryOrder::F => {
            for i in 0..dims.len() {
                strides[i] = acc;
                acc *= dims[i].max(1) as isize;
            }
        }
    }
    strides
}

impl Array {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Allocate a zero-initialized array (numeric zero; object slots empty).
    pub fn zeros(dtype: DType, dims: &[usize], order: MemoryOrder) -> Result<Self> {
        let elements: usize = dims.iter().product();
        let nbytes = elements
            .checked_mul(dtype.itemsize())
            .ok_or(UFuncError::OffsetOverflow)?;
        let mut data = Vec::new();
        data.try_reserve_exact(nbytes)
            .map_err(|_| UFuncError::Allocation { bytes: nbytes })?;
        data.resize(nbytes, 0);
        let strides = contiguous_strides(dims, dtype.itemsize(), order);
        Ok(Self {
            buf: Arc::new(Buffer {
                data: UnsafeCell::new(data),
                dtype,
                elements,
            }),
            dtype,
            dims: dims.to_vec(),
            strides,
            offset: 0,
            writable: true,
        })
    }

    /// Allocate an array filled with the given scalar.
    pub fn full(
        dtype: DType,
        dims: &[usize],
        value: &ScalarValue,
        order: MemoryOrder,
    ) -> Result<Self> {
        let out = Self::zeros(dtype, dims, order)?;
        out.fill_scalar(value)?;
        Ok(out)
    }

    /// Build a C-order array from a typed vector.
    pub fn from_vec<T: PodElement>(data: Vec<T>, dims: &[usize]) -> Result<Self> {
        let elements: usize = dims.iter().product();
        if data.len() != elements {
            return Err(UFuncError::Usage(format!(
                "cannot shape a vector of length {} into {:?}",
                data.len(),
                dims
            )));
        }
        let dtype = T::dtype();
        let out = Self::zeros(dtype, dims, MemoryOrder::C)?;
        let bytes: &[u8] = bytemuck::cast_slice(&data);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.buf.base(), bytes.len());
        }
        Ok(out)
    }

    /// Build a C-order boolean array (stored one byte per element).
    pub fn from_bool_vec(data: Vec<bool>, dims: &[usize]) -> Result<Self> {
        let elements: usize = dims.iter().product();
        if data.len() != elements {
            return Err(UFuncError::Usage(format!(
                "cannot shape a vector of length {} into {:?}",
                data.len(),
                dims
            )));
        }
        let out = Self::zeros(DType::bool_(), dims, MemoryOrder::C)?;
        let base = out.buf.base();
        for (i, b) in data.iter().enumerate() {
            unsafe { *base.add(i) = *b as u8 };
        }
        Ok(out)
    }

    /// Build a C-order object array.
    pub fn from_objects(cells: Vec<Option<Arc<ObjectCell>>>, dims: &[usize]) -> Result<Self> {
        let elements: usize = dims.iter().product();
        if cells.len() != elements {
            return Err(UFuncError::Usage(format!(
                "cannot shape a vector of length {} into {:?}",
                cells.len(),
                dims
            )));
        }
        let out = Self::zeros(DType::object(), dims, MemoryOrder::C)?;
        let item = out.dtype.itemsize();
        let base = out.buf.base();
        for (i, cell) in cells.into_iter().enumerate() {
            unsafe { object_write(base.add(i * item), cell) };
        }
        Ok(out)
    }

    /// A rank-0 (scalar) array holding one element.
    pub fn scalar<T: PodElement>(value: T) -> Result<Self> {
        Self::from_vec(vec![value], &[])
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    #[inline]
    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.dims
    }

    /// Byte strides, one per dimension.
    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    #[inline]
    pub fn itemsize(&self) -> usize {
        self.dtype.itemsize()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Return this handle with writes disallowed.
    pub fn readonly(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn is_c_contiguous(&self) -> bool {
        dims_contiguous(&self.dims, &self.strides, self.itemsize(), MemoryOrder::C)
    }

    pub fn is_f_contiguous(&self) -> bool {
        dims_contiguous(&self.dims, &self.strides, self.itemsize(), MemoryOrder::F)
    }

    /// Whether the element storage is aligned to the dtype's requirement.
    pub fn is_aligned(&self) -> bool {
        let align = self.dtype.alignment();
        if align <= 1 {
            return true;
        }
        let base = self.data_ptr() as usize;
        if base % align != 0 {
            return false;
        }
        self.strides.iter().all(|s| s.unsigned_abs() % align == 0)
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Permute the axes (generalized transpose). Zero-copy.
    pub fn permute(&self, axes: &[usize]) -> Result<Self> {
        if axes.len() != self.ndim() {
            return Err(UFuncError::RankMismatch(axes.len(), self.ndim()));
        }
        let mut seen = vec![false; self.ndim()];
        for &ax in axes {
            if ax >= self.ndim() {
                return Err(UFuncError::InvalidAxis {
                    axis: ax as isize,
                    rank: self.ndim(),
                });
            }
            if seen[ax] {
                return Err(UFuncError::DuplicateAxis { axis: ax });
            }
            seen[ax] = true;
        }
        let mut out = self.clone();
        out.dims = axes.iter().map(|&a| self.dims[a]).collect();
        out.strides = axes.iter().map(|&a| self.strides[a]).collect();
        Ok(out)
    }

    /// View with size-1 axes inserted at `positions` (positions are in the
    /// result's coordinate space, ascending). Zero-copy.
    pub(crate) fn insert_axes(&self, positions: &[usize]) -> Result<Self> {
        let rank = self.ndim() + positions.len();
        let mut out = self.clone();
        let mut dims = Vec::with_capacity(rank);
        let mut strides = Vec::with_capacity(rank);
        let mut src = 0usize;
        let mut next = positions.iter().peekable();
        for pos in 0..rank {
            if next.peek() == Some(&&pos) {
                next.next();
                dims.push(1);
                strides.push(0);
            } else {
                if src >= self.ndim() {
                    return Err(UFuncError::InvalidAxis {
                        axis: pos as isize,
                        rank,
                    });
                }
                dims.push(self.dims[src]);
                strides.push(self.strides[src]);
                src += 1;
            }
        }
        if next.next().is_some() || src != self.ndim() {
            return Err(UFuncError::Internal("bad axis insertion list".into()));
        }
        out.dims = dims;
        out.strides = strides;
        Ok(out)
    }

    /// View with the size-1 axes at `positions` removed. Zero-copy.
    pub(crate) fn remove_axes(&self, positions: &[usize]) -> Result<Self> {
        let mut out = self.clone();
        let mut dims = Vec::new();
        let mut strides = Vec::new();
        for d in 0..self.ndim() {
            if positions.contains(&d) {
                if self.dims[d] != 1 {
                    return Err(UFuncError::ShapeMismatch(format!(
                        "cannot remove axis {} of size {}",
                        d, self.dims[d]
                    )));
                }
            } else {
                dims.push(self.dims[d]);
                strides.push(self.strides[d]);
            }
        }
        out.dims = dims;
        out.strides = strides;
        Ok(out)
    }

    /// View with `n` extra size-1 axes appended. Zero-copy.
    pub(crate) fn with_trailing_axes(&self, n: usize) -> Self {
        let mut out = self.clone();
        out.dims.extend(std::iter::repeat(1).take(n));
        out.strides.extend(std::iter::repeat(0).take(n));
        out
    }

    /// Reverse all axes (matrix transpose for rank 2). Zero-copy.
    pub fn t(&self) -> Self {
        let mut out = self.clone();
        out.dims.reverse();
        out.strides.reverse();
        out
    }

    /// Read-only view stretched to `shape` with stride 0 on broadcast axes.
    pub(crate) fn broadcast_to(&self, shape: &[usize]) -> Result<Self> {
        let strides = crate::broadcast::broadcast_strides(&self.dims, &self.strides, shape)?;
        let mut out = self.clone();
        out.dims = shape.to_vec();
        out.strides = strides;
        out.writable = false;
        Ok(out)
    }

    /// Slice one axis: `len` elements starting at `start`, stepping by
    /// `step` (negative steps walk backwards). Zero-copy.
    pub fn slice_axis(&self, axis: usize, start: usize, len: usize, step: isize) -> Result<Self> {
        if axis >= self.ndim() {
            return Err(UFuncError::InvalidAxis {
                axis: axis as isize,
                rank: self.ndim(),
            });
        }
        if step == 0 {
            return Err(UFuncError::Usage("slice step cannot be zero".into()));
        }
        let span = if len == 0 {
            0
        } else {
            start as isize + (len as isize - 1) * step
        };
        if start > self.dims[axis].saturating_sub(1) && len > 0 {
            return Err(UFuncError::IndexOutOfBounds {
                op: "slice_axis".into(),
                index: start as isize,
                size: self.dims[axis],
            });
        }
        if len > 0 && (span < 0 || span as usize >= self.dims[axis]) {
            return Err(UFuncError::IndexOutOfBounds {
                op: "slice_axis".into(),
                index: span,
                size: self.dims[axis],
            });
        }
        let mut out = self.clone();
        out.offset += start as isize * self.strides[axis];
        out.dims[axis] = len;
        out.strides[axis] *= step;
        Ok(out)
    }

    /// Reshape a C-contiguous array. Zero-copy.
    pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
        let new_len: usize = dims.iter().product();
        if new_len != self.len() {
            return Err(UFuncError::Usage(format!(
                "cannot reshape array of size {} into shape {:?}",
                self.len(),
                dims
            )));
        }
        if !self.is_c_contiguous() {
            return Err(UFuncError::Usage(
                "reshape requires a C-contiguous array".into(),
            ));
        }
        let mut out = self.clone();
        out.dims = dims.to_vec();
        out.strides = contiguous_strides(dims, self.itemsize(), MemoryOrder::C);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Element access
    // ------------------------------------------------------------------

    pub(crate) fn element_offset(&self, index: &[usize]) -> Result<isize> {
        if index.len() != self.ndim() {
            return Err(UFuncError::RankMismatch(index.len(), self.ndim()));
        }
        let mut off = 0isize;
        for (d, (&i, &s)) in index.iter().zip(self.strides.iter()).enumerate() {
            if i >= self.dims[d] {
                return Err(UFuncError::IndexOutOfBounds {
                    op: "index".into(),
                    index: i as isize,
                    size: self.dims[d],
                });
            }
            off += i as isize * s;
        }
        Ok(off)
    }

    /// Read one element widened to `f64` (numeric and object dtypes).
    pub fn get_f64(&self, index: &[usize]) -> Result<f64> {
        let off = self.element_offset(index)?;
        unsafe { element_to_f64(&self.dtype, self.data_ptr().offset(off)) }.ok_or_else(|| {
            UFuncError::Usage(format!("cannot read dtype {} as f64", self.dtype.name()))
        })
    }

    /// Read one object element.
    pub fn get_object(&self, index: &[usize]) -> Result<Option<Arc<ObjectCell>>> {
        if !self.dtype.is_object() {
            return Err(UFuncError::Usage("not an object array".into()));
        }
        let off = self.element_offset(index)?;
        Ok(unsafe { object_read(self.data_ptr().offset(off) as *const u8) })
    }

    /// Write every element from the given scalar.
    pub fn fill_scalar(&self, value: &ScalarValue) -> Result<()> {
        if !self.writable {
            return Err(UFuncError::NotWritable);
        }
        let bytes = self.dtype.scalar_bytes(value)?;
        let ptr = self.data_ptr();
        let mut result = Ok(());
        for_each_index(&self.dims, |index| {
            if result.is_err() {
                return;
            }
            let mut off = 0isize;
            for (i, s) in index.iter().zip(self.strides.iter()) {
                off += *i as isize * s;
            }
            unsafe {
                let dst = ptr.offset(off);
                if self.dtype.is_object() {
                    // Transfer a fresh reference per slot.
                    match self.dtype.scalar_bytes(value) {
                        Ok(fresh) => {
                            object_release(dst);
                            std::ptr::copy_nonoverlapping(fresh.as_ptr(), dst, fresh.len());
                        }
                        Err(e) => result = Err(e),
                    }
                } else {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
                }
            }
        });
        if self.dtype.is_object() {
            // The probe copy made for `bytes` owns one reference; drop it.
            unsafe { object_release(bytes.as_ptr()) };
        }
        result
    }

    /// Copy out all elements in logical C order.
    pub fn to_vec<T: PodElement>(&self) -> Result<Vec<T>> {
        if T::dtype().id() != self.dtype.id() {
            return Err(UFuncError::Usage(format!(
                "to_vec dtype mismatch: array is {}",
                self.dtype.name()
            )));
        }
        let mut out = Vec::with_capacity(self.len());
        let ptr = self.data_ptr();
        for_each_index(&self.dims, |index| {
            let mut off = 0isize;
            for (i, s) in index.iter().zip(self.strides.iter()) {
                off += *i as isize * s;
            }
            out.push(unsafe { std::ptr::read_unaligned(ptr.offset(off) as *const T) });
        });
        Ok(out)
    }

    /// Borrow the storage as a typed slice when C-contiguous and aligned.
    pub fn as_slice<T: PodElement>(&self) -> Option<&[T]> {
        if T::dtype().id() != self.dtype.id() || !self.is_c_contiguous() || !self.is_aligned() {
            return None;
        }
        unsafe {
            Some(std::slice::from_raw_parts(
                self.data_ptr() as *const T,
                self.len(),
            ))
        }
    }

    // ------------------------------------------------------------------
    // Raw access (engine internal)
    // ------------------------------------------------------------------

    /// Pointer to the first logical element.
    #[inline]
    pub(crate) fn data_ptr(&self) -> *mut u8 {
        unsafe { self.buf.base().offset(self.offset) }
    }

    #[inline]
    /// True when both handles share one backing buffer.
    pub fn same_buffer(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    /// Conservative byte bounds `[low, high)` of the addressed region.
    pub(crate) fn byte_bounds(&self) -> (usize, usize) {
        let base = self.data_ptr() as usize;
        let mut low = 0isize;
        let mut high = self.itemsize() as isize;
        for (&d, &s) in self.dims.iter().zip(self.strides.iter()) {
            if d == 0 {
                return (base, base);
            }
            let span = (d as isize - 1) * s;
            if span > 0 {
                high += span;
            } else {
                low += span;
            }
        }
        ((base as isize + low) as usize, (base as isize + high) as usize)
    }

    /// Identical memory layout: same base pointer, dims and strides.
    pub(crate) fn same_layout(&self, other: &Array) -> bool {
        self.data_ptr() == other.data_ptr()
            && self.dims == other.dims
            && self.strides == other.strides
            && self.dtype.id() == other.dtype.id()
    }
}

fn dims_contiguous(dims: &[usize], strides: &[isize], itemsize: usize, order: MemoryOrder) -> bool {
    let mut expected = itemsize as isize;
    let idx: Vec<usize> = match order {
        MemoryOrder::C => (0..dims.len()).rev().collect(),
        MemoryOrder::F => (0..dims.len()).collect(),
    };
    for i in idx {
        if dims[i] <= 1 {
            continue;
        }
        if strides[i] != expected {
            return false;
        }
        expected = expected.saturating_mul(dims[i] as isize);
    }
    true
}

/// Odometer loop over all indices of `dims`, last axis fastest.
pub(crate) fn for_each_index(dims: &[usize], mut f: impl FnMut(&[usize])) {
    if dims.contains(&0) {
        return;
    }
    let mut index = vec![0usize; dims.len()];
    loop {
        f(&index);
        let mut axis = dims.len();
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

/// Typed elements that can back an [`Array`] directly.
pub trait PodElement: bytemuck::Pod {
    fn dtype() -> DType;
}

impl PodElement for u8 {
    fn dtype() -> DType {
        DType::uint8()
    }
}
impl PodElement for i32 {
    fn dtype() -> DType {
        DType::int32()
    }
}
impl PodElement for i64 {
    fn dtype() -> DType {
        DType::int64()
    }
}
impl PodElement for u64 {
    fn dtype() -> DType {
        DType::uint64()
    }
}
impl PodElement for f32 {
    fn dtype() -> DType {
        DType::float32()
    }
}
impl PodElement for f64 {
    fn dtype() -> DType {
        DType::float64()
    }
}
impl PodElement for Complex<f64> {
    fn dtype() -> DType {
        DType::complex128()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_shape_and_strides() {
        let a = Array::from_vec(vec![1.0_f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.strides(), &[24, 8]);
        assert!(a.is_c_contiguous());
        assert!(!a.is_f_contiguous());
        assert_eq!(a.get_f64(&[1, 2]).unwrap(), 6.0);
    }

    #[test]
    fn test_permute_and_slice() {
        let a = Array::from_vec((0..12).map(|v| v as f64).collect(), &[3, 4]).unwrap();
        let t = a.permute(&[1, 0]).unwrap();
        assert_eq!(t.shape(), &[4, 3]);
        assert_eq!(t.get_f64(&[2, 1]).unwrap(), a.get_f64(&[1, 2]).unwrap());

        let s = a.slice_axis(1, 1, 2, 2).unwrap();
        assert_eq!(s.shape(), &[3, 2]);
        assert_eq!(s.get_f64(&[0, 0]).unwrap(), 1.0);
        assert_eq!(s.get_f64(&[0, 1]).unwrap(), 3.0);
    }

    #[test]
    fn test_negative_step_slice() {
        let a = Array::from_vec((0..5).map(|v| v as f64).collect(), &[5]).unwrap();
        let r = a.slice_axis(0, 4, 5, -1).unwrap();
        assert_eq!(r.to_vec::<f64>().unwrap(), vec![4.0, 3.0, 2.0, 1.0, 0.0]);
        assert!(!r.is_c_contiguous());
    }

    #[test]
    fn test_zero_size_array() {
        let a = Array::zeros(DType::float64(), &[3, 0, 2], MemoryOrder::C).unwrap();
        assert!(a.is_empty());
        assert_eq!(a.len(), 0);
        assert_eq!(a.to_vec::<f64>().unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn test_scalar_rank0() {
        let a = Array::scalar(7.5_f64).unwrap();
        assert_eq!(a.ndim(), 0);
        assert_eq!(a.len(), 1);
        assert_eq!(a.get_f64(&[]).unwrap(), 7.5);
    }

    #[test]
    fn test_shared_storage_clone() {
        let a = Array::from_vec(vec![1.0_f64, 2.0], &[2]).unwrap();
        let b = a.clone();
        assert!(a.same_buffer(&b));
        assert!(a.same_layout(&b));
    }

    #[test]
    fn test_object_buffer_release_on_drop() {
        let cell = Arc::new(ObjectCell { value: 3.0 });
        {
            let a = Array::from_objects(vec![Some(cell.clone()), None], &[2]).unwrap();
            assert_eq!(Arc::strong_count(&cell), 2);
            assert_eq!(a.get_object(&[0]).unwrap().unwrap().value, 3.0);
            assert!(a.get_object(&[1]).unwrap().is_none());
        }
        assert_eq!(Arc::strong_count(&cell), 1);
    }

    #[test]
    fn test_byte_bounds_negative_stride() {
        let a = Array::from_vec((0..6).map(|v| v as f64).collect(), &[6]).unwrap();
        let r = a.slice_axis(0, 5, 6, -1).unwrap();
        let (lo, hi) = r.byte_bounds();
        let (alo, ahi) = a.byte_bounds();
        assert_eq!((lo, hi), (alo, ahi));
    }

    #[test]
    fn test_fill_scalar() {
        let a = Array::zeros(DType::int64(), &[2, 2], MemoryOrder::C).unwrap();
        a.fill_scalar(&ScalarValue::Int(-3)).unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![-3, -3, -3, -3]);
    }
}
