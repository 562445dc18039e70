//! Dispatch and execution engine for array "universal functions".
//!
//! Given an operation (add, multiply, sin, ...) and a set of N-dimensional
//! strided operands of possibly different shapes and element types, this crate
//! determines the common broadcast iteration shape, selects the concrete
//! per-element kernel for the operand dtypes, and drives that kernel across
//! all elements with the cheapest viable strategy: a single trivial kernel
//! call for contiguous operands, or a cache-blocked strided iteration plan
//! otherwise. Reductions (`reduce`/`accumulate`/`reduceat`), generalized
//! signature-based operations ("stacked matrix" style), masked (`where=`)
//! execution and in-place output semantics all run on the same machinery.
//!
//! # Core Types
//!
//! - [`Array`]: a shared-buffer strided N-d array handle (byte strides,
//!   dtype-erased storage)
//! - [`DType`] / [`ScalarValue`]: element type descriptors and typed scalars
//! - [`UFunc`]: an operation descriptor with its registered strided loops
//!
//! # Entry Points
//!
//! Every [`UFunc`] exposes six public operations:
//!
//! - [`UFunc::call`]: broadcast elementwise application
//! - [`UFunc::reduce`]: fold along one or more axes
//! - [`UFunc::accumulate`]: running fold along one axis
//! - [`UFunc::reduceat`]: segmented fold driven by boundary indices
//! - [`UFunc::outer`]: full outer-product broadcast
//! - [`UFunc::at`]: in-place indexed apply (repeated indices each visited)
//!
//! # Example
//!
//! ```rust
//! use ufunc_rs::{ufuncs, Array, CallOptions};
//!
//! let add = ufuncs::add();
//! let a = Array::from_vec(vec![1.0_f64, 2.0, 3.0], &[3]).unwrap();
//! let b = Array::from_vec(vec![10.0_f64, 20.0, 30.0], &[3]).unwrap();
//! let out = add.call(&[a, b], &CallOptions::default()).unwrap();
//! assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![11.0, 22.0, 33.0]);
//! ```
//!
//! # Cache Optimization
//!
//! Strided iteration reuses an order -> fuse -> block planning pipeline:
//! dimensions are sorted by stride magnitude, contiguous dimensions are
//! fused, and iteration is tiled to fit L1 ([`BLOCK_MEMORY_SIZE`]).
//! Contiguous operand sets bypass the planner entirely via the trivial loop.

mod array;
mod block;
mod broadcast;
mod dtype;
mod execute;
mod fuse;
mod gufunc;
mod hooks;
mod masked;
mod order;
mod overlap;
mod plan;
mod reduction;
mod registry;
mod signature;
mod threading;
mod trivial;
mod ufunc;
pub mod ufuncs;

// ============================================================================
// Array and dtype model
// ============================================================================
pub use array::{Array, MemoryOrder, PodElement};
pub use dtype::{Casting, DType, DTypeId, ObjectCell, ScalarValue};

// ============================================================================
// Operation descriptors and entry points
// ============================================================================
pub use ufunc::{
    AccumulateOptions, CallOptions, FpPolicy, Identity, ReduceOptions, UFunc, UFuncBuilder,
    UFuncMethod,
};

// ============================================================================
// Kernel registry and collaborator seams
// ============================================================================
pub use hooks::{select_output_hook, OutputHook, OverrideHook};
pub use registry::{
    DefaultResolver, FpStatus, LoopContext, LoopFn, LoopRegistry, MaskedLoopFn, TypeResolver,
};
pub use threading::ThreadBracket;

// ============================================================================
// Signature model
// ============================================================================
pub use signature::CoreSignature;

// ============================================================================
// Constants
// ============================================================================

/// Block memory size for cache-optimized iteration (L1 cache target).
///
/// Strided iteration is blocked into tiles that fit within this size.
pub const BLOCK_MEMORY_SIZE: usize = 32 * 1024;

/// Cache line size in bytes, used for memory region estimation.
pub const CACHE_LINE_SIZE: usize = 64;

/// Minimum total element count before the cooperative thread bracket is
/// entered. Below this the fixed bracket overhead is not worth paying.
pub const MIN_THREAD_LENGTH: usize = 1 << 15;

/// Element capacity of a per-operand staging buffer used when an operand's
/// dtype does not match the resolved loop dtype.
pub const BUFFER_BLOCK_SIZE: usize = 8192;

// ============================================================================
// Error types
// ============================================================================

/// Errors produced by the dispatch and execution engine.
#[derive(Debug, thiserror::Error)]
pub enum UFuncError {
    /// Array ranks do not match.
    #[error("rank mismatch: {0} vs {1}")]
    RankMismatch(usize, usize),

    /// Operand shapes cannot be broadcast together or do not match.
    #[error("{0}")]
    ShapeMismatch(String),

    /// Invalid axis index for the given array rank.
    #[error("axis {axis} is out of bounds for array of dimension {rank}")]
    InvalidAxis { axis: isize, rank: usize },

    /// The same axis was given more than once.
    #[error("duplicate value in axis: {axis}")]
    DuplicateAxis { axis: usize },

    /// Malformed generalized-ufunc signature string.
    #[error("{message} at position {position} in \"{signature}\"")]
    SignatureParse {
        message: &'static str,
        position: usize,
        signature: String,
    },

    /// An operand has fewer dimensions than its core signature requires.
    #[error(
        "{ufunc}: {kind} operand {index} does not have enough dimensions \
         (has {rank}, gufunc core with signature {signature} requires {required})"
    )]
    CoreDimsMissing {
        ufunc: String,
        kind: &'static str,
        index: usize,
        rank: usize,
        signature: String,
        required: usize,
    },

    /// A shared named core dimension resolved to two different sizes.
    #[error(
        "{ufunc}: {kind} operand {index} has a mismatch in its core dimension {dim} \
         (size {actual} is different from {expected})"
    )]
    CoreDimMismatch {
        ufunc: String,
        kind: &'static str,
        index: usize,
        dim: String,
        actual: usize,
        expected: usize,
    },

    /// An output-only core dimension was never supplied by any operand.
    #[error("{ufunc}: could not determine size of core dimension {dim}")]
    UnresolvedCoreDim { ufunc: String, dim: String },

    /// No registered loop matches the operand dtypes.
    #[error("ufunc '{ufunc}' not supported for the input types {dtypes}")]
    NoMatchingLoop { ufunc: String, dtypes: String },

    /// Empty reduction with no identity and no `initial=` value.
    #[error("zero-size array to reduction operation {ufunc} which has no identity")]
    NoIdentity { ufunc: String },

    /// An index argument lies outside the valid range.
    #[error("index {index} out-of-bounds in {op} [0, {size})")]
    IndexOutOfBounds {
        op: String,
        index: isize,
        size: usize,
    },

    /// A cast between two dtypes is not possible under the given casting rule.
    #[error("cannot cast array data from {from} to {to} according to the rule '{rule}'")]
    CastError {
        from: &'static str,
        to: &'static str,
        rule: &'static str,
    },

    /// Destination operand is not writable.
    #[error("output array is read-only")]
    NotWritable,

    /// Allocation of an output array or staging buffer failed.
    #[error("failed to allocate {bytes} bytes")]
    Allocation { bytes: usize },

    /// Integer overflow while computing a byte offset.
    #[error("offset overflow while computing pointer")]
    OffsetOverflow,

    /// Sticky floating-point status flags were raised and the caller asked
    /// for them to be fatal.
    #[error("floating point error ({flags}) encountered in {ufunc}")]
    FloatingPoint { ufunc: String, flags: String },

    /// The kernel itself signalled an error mid-iteration.
    #[error("kernel error: {0}")]
    Kernel(String),

    /// A collaborator violated its contract (type resolver, hook, ...).
    /// Distinct from usage errors: this is not bad caller input.
    #[error("internal consistency error: {0}")]
    Internal(String),

    /// Bad argument combination not covered by a more specific variant.
    #[error("{0}")]
    Usage(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, UFuncError>;

#[inline]
pub(crate) fn trace_enabled() -> bool {
    matches!(std::env::var("UFUNC_TRACE"), Ok(ref v) if v == "1")
}
