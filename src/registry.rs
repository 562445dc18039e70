//! Kernel registration and dtype-based loop selection.
//!
//! Every operation owns a [`LoopRegistry`]: an ordered table of kernels
//! keyed by their operand dtypes. Built-in dtypes live in one flat list
//! searched in registration order; user-registered dtypes hang off a map
//! keyed by their registration number so lookups for them skip the built-in
//! scan. Which kernel serves a call is decided by a [`TypeResolver`]; the
//! [`DefaultResolver`] takes the first kernel whose inputs every operand
//! can safely cast to.

use std::collections::HashMap;

use crate::dtype::{can_cast, Casting, DType, DTypeId};
use crate::{Result, UFuncError};

// ----------------------------------------------------------------------
// Floating-point status
// ----------------------------------------------------------------------

/// Sticky floating-point condition flags accumulated by kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpStatus {
    pub divide_by_zero: bool,
    pub overflow: bool,
    pub underflow: bool,
    pub invalid: bool,
}

impl FpStatus {
    pub fn any(&self) -> bool {
        self.divide_by_zero || self.overflow || self.underflow || self.invalid
    }

    pub fn merge(&mut self, other: FpStatus) {
        self.divide_by_zero |= other.divide_by_zero;
        self.overflow |= other.overflow;
        self.underflow |= other.underflow;
        self.invalid |= other.invalid;
    }

    /// Comma-separated flag names, for error text.
    pub fn flags_string(&self) -> String {
        let mut names = Vec::new();
        if self.divide_by_zero {
            names.push("divide by zero");
        }
        if self.overflow {
            names.push("overflow");
        }
        if self.underflow {
            names.push("underflow");
        }
        if self.invalid {
            names.push("invalid value");
        }
        names.join(", ")
    }
}

/// Per-call state threaded through every kernel invocation.
#[derive(Debug, Default)]
pub struct LoopContext {
    pub fp: FpStatus,
}

/// A strided kernel.
///
/// `data` holds one base pointer per operand (inputs then outputs). For
/// elementwise kernels `dims` is `[n]` and `strides` has one byte stride
/// per operand. Generalized kernels see `dims = [n, core sizes...]` and
/// `strides = [outer stride per operand..., core strides per operand...]`.
///
/// # Safety
/// Pointers must stay in bounds for the strided footprint described by
/// `dims` and `strides`, and aliasing between outputs and inputs must be
/// the harmless element-for-element kind.
pub type LoopFn =
    unsafe fn(data: &[*mut u8], dims: &[usize], strides: &[isize], ctx: &mut LoopContext) -> Result<()>;

/// A kernel that consumes a boolean selection mask alongside the operands.
/// Elements where the mask byte is zero must be left untouched.
pub type MaskedLoopFn = unsafe fn(
    data: &[*mut u8],
    mask: *const u8,
    mask_stride: isize,
    dims: &[usize],
    strides: &[isize],
    ctx: &mut LoopContext,
) -> Result<()>;

// ----------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------

/// One registered kernel and the dtypes it serves.
#[derive(Clone)]
pub struct LoopEntry {
    pub ins: Vec<DType>,
    pub outs: Vec<DType>,
    pub loop_fn: LoopFn,
    /// Optional purpose-built masked variant. Absent, masked execution
    /// run-length decodes the mask and calls `loop_fn` per run.
    pub masked: Option<MaskedLoopFn>,
}

impl std::fmt::Debug for LoopEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopEntry")
            .field("ins", &self.ins)
            .field("outs", &self.outs)
            .field("masked", &self.masked.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct LoopRegistry {
    builtin: Vec<LoopEntry>,
    custom: HashMap<u32, Vec<LoopEntry>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a kernel. Order matters: resolution takes the first match.
    pub fn register(&mut self, ins: Vec<DType>, outs: Vec<DType>, loop_fn: LoopFn) {
        self.builtin.push(LoopEntry {
            ins,
            outs,
            loop_fn,
            masked: None,
        });
    }

    pub fn register_masked(
        &mut self,
        ins: Vec<DType>,
        outs: Vec<DType>,
        loop_fn: LoopFn,
        masked: MaskedLoopFn,
    ) {
        self.builtin.push(LoopEntry {
            ins,
            outs,
            loop_fn,
            masked: Some(masked),
        });
    }

    /// Register a kernel for a user dtype under its registration number.
    pub fn register_custom(&mut self, key: u32, ins: Vec<DType>, outs: Vec<DType>, loop_fn: LoopFn) {
        self.custom.entry(key).or_default().push(LoopEntry {
            ins,
            outs,
            loop_fn,
            masked: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.builtin.is_empty() && self.custom.is_empty()
    }

    /// Entries to scan for the given input dtypes, in resolution order.
    /// A custom input dtype restricts the scan to its own chain.
    pub fn candidates(&self, inputs: &[DType]) -> &[LoopEntry] {
        let custom_key = inputs.iter().find_map(|d| match d.id() {
            DTypeId::Custom(key) => Some(key),
            _ => None,
        });
        match custom_key {
            Some(key) => self.custom.get(&key).map_or(&[], |v| v.as_slice()),
            None => &self.builtin,
        }
    }
}

// ----------------------------------------------------------------------
// Type resolution
// ----------------------------------------------------------------------

/// Decides which registered kernel serves a call, and therefore which
/// dtypes the operands are staged through.
pub trait TypeResolver {
    fn resolve<'r>(
        &self,
        ufunc: &str,
        registry: &'r LoopRegistry,
        inputs: &[DType],
        requested: Option<&DType>,
        casting: Casting,
    ) -> Result<&'r LoopEntry>;
}

/// First-match resolution in registration order. An input matches a kernel
/// slot when it has the slot's dtype or casts to it safely; a `dtype=`
/// request narrows the search to kernels computing in that dtype, with the
/// input casts then judged by the call's casting rule.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultResolver;

impl DefaultResolver {
    fn entry_matches(
        entry: &LoopEntry,
        inputs: &[DType],
        requested: Option<&DType>,
        casting: Casting,
    ) -> bool {
        if entry.ins.len() != inputs.len() {
            return false;
        }
        if let Some(req) = requested {
            if entry.ins.iter().any(|d| d.id() != req.id())
                || entry.outs.iter().any(|d| d.id() != req.id())
            {
                return false;
            }
            return inputs
                .iter()
                .zip(entry.ins.iter())
                .all(|(have, want)| can_cast(have, want, casting));
        }
        inputs
            .iter()
            .zip(entry.ins.iter())
            .all(|(have, want)| can_cast(have, want, Casting::Safe))
    }
}

impl TypeResolver for DefaultResolver {
    fn resolve<'r>(
        &self,
        ufunc: &str,
        registry: &'r LoopRegistry,
        inputs: &[DType],
        requested: Option<&DType>,
        casting: Casting,
    ) -> Result<&'r LoopEntry> {
        registry
            .candidates(inputs)
            .iter()
            .find(|entry| Self::entry_matches(entry, inputs, requested, casting))
            .ok_or_else(|| UFuncError::NoMatchingLoop {
                ufunc: ufunc.to_string(),
                dtypes: dtype_list_string(inputs),
            })
    }
}

pub(crate) fn dtype_list_string(dtypes: &[DType]) -> String {
    dtypes
        .iter()
        .map(|d| d.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn noop_loop(
        _data: &[*mut u8],
        _dims: &[usize],
        _strides: &[isize],
        _ctx: &mut LoopContext,
    ) -> Result<()> {
        Ok(())
    }

    fn binary_registry() -> LoopRegistry {
        let mut reg = LoopRegistry::new();
        reg.register(
            vec![DType::int64(), DType::int64()],
            vec![DType::int64()],
            noop_loop,
        );
        reg.register(
            vec![DType::float64(), DType::float64()],
            vec![DType::float64()],
            noop_loop,
        );
        reg
    }

    #[test]
    fn test_exact_match_preferred() {
        let reg = binary_registry();
        let entry = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::int64(), DType::int64()],
                None,
                Casting::Safe,
            )
            .unwrap();
        assert_eq!(entry.ins[0].id(), DTypeId::Int64);
    }

    #[test]
    fn test_safe_promotion_in_registration_order() {
        let reg = binary_registry();
        // int32 casts safely to int64, so the first entry still wins.
        let entry = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::int32(), DType::int64()],
                None,
                Casting::Safe,
            )
            .unwrap();
        assert_eq!(entry.outs[0].id(), DTypeId::Int64);
        // int64 + float64 skips the integer loop.
        let entry = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::int64(), DType::float64()],
                None,
                Casting::Safe,
            )
            .unwrap();
        assert_eq!(entry.outs[0].id(), DTypeId::Float64);
    }

    #[test]
    fn test_no_matching_loop() {
        let reg = binary_registry();
        let err = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::complex128(), DType::complex128()],
                None,
                Casting::Safe,
            )
            .unwrap_err();
        match err {
            UFuncError::NoMatchingLoop { ufunc, dtypes } => {
                assert_eq!(ufunc, "add");
                assert_eq!(dtypes, "complex128, complex128");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_requested_dtype_narrows_search() {
        let reg = binary_registry();
        let entry = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::int64(), DType::int64()],
                Some(&DType::float64()),
                Casting::Safe,
            )
            .unwrap();
        assert_eq!(entry.outs[0].id(), DTypeId::Float64);
        // Casting::No forbids staging int64 through the float64 loop.
        let err = DefaultResolver
            .resolve(
                "add",
                &reg,
                &[DType::int64(), DType::int64()],
                Some(&DType::float64()),
                Casting::No,
            )
            .unwrap_err();
        assert!(matches!(err, UFuncError::NoMatchingLoop { .. }));
    }

    #[test]
    fn test_custom_dtype_scans_its_own_chain() {
        let mut reg = binary_registry();
        let rational = DType::custom(7, 16, 8);
        reg.register_custom(
            7,
            vec![rational, rational],
            vec![rational],
            noop_loop,
        );
        let entry = DefaultResolver
            .resolve("add", &reg, &[rational, rational], None, Casting::Safe)
            .unwrap();
        assert_eq!(entry.ins[0].id(), DTypeId::Custom(7));
        // A custom input never falls back to the built-in chain.
        let other = DType::custom(9, 4, 4);
        let err = DefaultResolver
            .resolve("add", &reg, &[other, other], None, Casting::Safe)
            .unwrap_err();
        assert!(matches!(err, UFuncError::NoMatchingLoop { .. }));
    }

    #[test]
    fn test_fp_status_merge_and_text() {
        let mut a = FpStatus::default();
        assert!(!a.any());
        a.merge(FpStatus {
            divide_by_zero: true,
            ..Default::default()
        });
        a.merge(FpStatus {
            invalid: true,
            ..Default::default()
        });
        assert!(a.any());
        assert_eq!(a.flags_string(), "divide by zero, invalid value");
    }
}
