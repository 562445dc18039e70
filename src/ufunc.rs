//! Operation descriptors and the public entry points.
//!
//! A [`UFunc`] bundles a kernel registry, a type resolver and call-shape
//! metadata (arity, identity, optional core signature). The entry points
//! `call`, `reduce`, `accumulate`, `reduceat`, `outer` and `at` validate
//! arguments, give an [`OverrideHook`] one chance to take over, and then
//! hand off to the execution modules.

use crate::array::{Array, MemoryOrder};
use crate::dtype::{Casting, DType, DTypeId, ScalarValue};
use crate::hooks::{OutputHook, OverrideHook};
use crate::registry::{LoopFn, LoopRegistry, TypeResolver};
use crate::signature::CoreSignature;
use crate::threading::ThreadBracket;
use crate::{execute, gufunc, reduction};
use crate::{Result, UFuncError};

/// Which entry point a call came through, as seen by override hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UFuncMethod {
    Call,
    Reduce,
    Accumulate,
    ReduceAt,
    Outer,
    At,
}

/// Identity element used to seed empty and whole-array reductions.
#[derive(Debug, Clone)]
pub enum Identity {
    Zero,
    One,
    /// A custom identity value.
    Value(ScalarValue),
    /// No identity; empty reductions fail.
    None,
    /// No identity, but terms may still be reassociated (min/max style).
    ReorderableNone,
}

impl Identity {
    /// Materialize the identity for a concrete dtype, if there is one.
    pub(crate) fn value(&self) -> Option<ScalarValue> {
        match self {
            Identity::Zero => Some(ScalarValue::Int(0)),
            Identity::One => Some(ScalarValue::Int(1)),
            Identity::Value(v) => Some(v.clone()),
            Identity::None | Identity::ReorderableNone => None,
        }
    }
}

/// What to do with sticky floating-point flags once a call finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FpPolicy {
    /// Discard the flags.
    #[default]
    Ignore,
    /// Fail the call if any flag was raised.
    Raise,
}

/// Options shared by `call` and `outer`.
pub struct CallOptions<'a> {
    /// Caller-supplied outputs, one slot per declared output. Empty means
    /// allocate everything.
    pub out: Vec<Option<Array>>,
    /// Force the computation dtype.
    pub dtype: Option<DType>,
    pub casting: Casting,
    /// Memory order of allocated outputs.
    pub order: MemoryOrder,
    /// When false, `wrap` hooks are skipped.
    pub subok: bool,
    /// Boolean selection mask; unselected output elements keep their
    /// previous contents.
    pub where_: Option<Array>,
    /// Core-axis placement for generalized operations.
    pub axis: Option<isize>,
    pub axes: Option<Vec<Vec<isize>>>,
    pub keepdims: bool,
    pub override_hook: Option<&'a dyn OverrideHook>,
    pub output_hooks: Vec<&'a dyn OutputHook>,
    pub bracket: Option<&'a dyn ThreadBracket>,
    pub fp_policy: FpPolicy,
}

impl Default for CallOptions<'_> {
    fn default() -> Self {
        Self {
            out: Vec::new(),
            dtype: None,
            casting: Casting::Safe,
            order: MemoryOrder::C,
            subok: true,
            where_: None,
            axis: None,
            axes: None,
            keepdims: false,
            override_hook: None,
            output_hooks: Vec::new(),
            bracket: None,
            fp_policy: FpPolicy::Ignore,
        }
    }
}

/// Options for `reduce`.
pub struct ReduceOptions<'a> {
    /// Axes to reduce over. Empty reduces over every axis.
    pub axes: Vec<isize>,
    pub dtype: Option<DType>,
    pub out: Option<Array>,
    pub keepdims: bool,
    /// Seed value; takes precedence over the operation's identity.
    pub initial: Option<ScalarValue>,
    /// Boolean mask selecting which elements participate.
    pub where_: Option<Array>,
    pub casting: Casting,
    pub override_hook: Option<&'a dyn OverrideHook>,
    pub output_hooks: Vec<&'a dyn OutputHook>,
    pub bracket: Option<&'a dyn ThreadBracket>,
    pub fp_policy: FpPolicy,
}

impl Default for ReduceOptions<'_> {
    fn default() -> Self {
        Self {
            axes: Vec::new(),
            dtype: None,
            out: None,
            keepdims: false,
            initial: None,
            where_: None,
            casting: Casting::Safe,
            override_hook: None,
            output_hooks: Vec::new(),
            bracket: None,
            fp_policy: FpPolicy::Ignore,
        }
    }
}

/// Options for `accumulate` and `reduceat`.
pub struct AccumulateOptions<'a> {
    pub axis: isize,
    pub dtype: Option<DType>,
    pub out: Option<Array>,
    pub casting: Casting,
    pub override_hook: Option<&'a dyn OverrideHook>,
    pub output_hooks: Vec<&'a dyn OutputHook>,
    pub bracket: Option<&'a dyn ThreadBracket>,
    pub fp_policy: FpPolicy,
}

impl Default for AccumulateOptions<'_> {
    fn default() -> Self {
        Self {
            axis: 0,
            dtype: None,
            out: None,
            casting: Casting::Safe,
            override_hook: None,
            output_hooks: Vec::new(),
            bracket: None,
            fp_policy: FpPolicy::Ignore,
        }
    }
}

/// A registered elementwise or generalized operation.
pub struct UFunc {
    name: String,
    nin: usize,
    nout: usize,
    identity: Identity,
    /// Reductions over bool and narrow integers accumulate in the native
    /// machine width (sum/prod style operations).
    promotes_integers: bool,
    signature: Option<CoreSignature>,
    registry: LoopRegistry,
    resolver: Option<Box<dyn TypeResolver + Send + Sync>>,
}

impl std::fmt::Debug for UFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UFunc")
            .field("name", &self.name)
            .field("nin", &self.nin)
            .field("nout", &self.nout)
            .field("signature", &self.signature.as_ref().map(|s| s.text()))
            .finish()
    }
}

impl UFunc {
    pub fn builder(name: &str, nin: usize, nout: usize) -> UFuncBuilder {
        UFuncBuilder {
            name: name.to_string(),
            nin,
            nout,
            identity: Identity::None,
            promotes_integers: false,
            signature: None,
            registry: LoopRegistry::new(),
            resolver: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nin(&self) -> usize {
        self.nin
    }

    pub fn nout(&self) -> usize {
        self.nout
    }

    pub fn nop(&self) -> usize {
        self.nin + self.nout
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The parsed core signature, when the operation is generalized.
    pub fn signature(&self) -> Option<&CoreSignature> {
        self.signature.as_ref().filter(|s| s.enabled())
    }

    pub fn registry(&self) -> &LoopRegistry {
        &self.registry
    }

    pub(crate) fn resolver(&self) -> &dyn TypeResolver {
        self.resolver.as_deref().unwrap_or(&crate::registry::DefaultResolver)
    }

    pub(crate) fn promotes_integers(&self) -> bool {
        self.promotes_integers
    }

    /// Accumulation dtype for a reduction over `input` when the caller
    /// requested none. Sum-like operations widen bool and sub-native
    /// integers to the native width.
    pub(crate) fn reduce_dtype(&self, input: &DType) -> DType {
        if !self.promotes_integers {
            return *input;
        }
        match input.id() {
            DTypeId::Bool | DTypeId::Int32 => DType::int64(),
            DTypeId::UInt8 => DType::uint64(),
            _ => *input,
        }
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Elementwise (or generalized) application over broadcast operands.
    pub fn call(&self, inputs: &[Array], opts: &CallOptions) -> Result<Vec<Array>> {
        self.check_arity(inputs.len())?;
        if let Some(hook) = opts.override_hook {
            if let Some(result) = hook.try_override(self, UFuncMethod::Call, inputs) {
                return result;
            }
        }
        if !opts.out.is_empty() && opts.out.len() != self.nout {
            return Err(UFuncError::Usage(format!(
                "'{}' expects {} outputs, got {}",
                self.name,
                self.nout,
                opts.out.len()
            )));
        }
        if self.signature().is_some() {
            return gufunc::generalized(self, inputs, opts);
        }
        if opts.axis.is_some() || opts.axes.is_some() || opts.keepdims {
            return Err(UFuncError::Usage(format!(
                "{}: axis, axes and keepdims are only allowed for operations with a core signature",
                self.name
            )));
        }
        execute::elementwise(self, inputs, opts)
    }

    /// Repeated application along one or more axes, collapsing them.
    pub fn reduce(&self, array: &Array, opts: &ReduceOptions) -> Result<Array> {
        self.check_reducible()?;
        if let Some(hook) = opts.override_hook {
            if let Some(result) =
                hook.try_override(self, UFuncMethod::Reduce, std::slice::from_ref(array))
            {
                return result.and_then(one_output);
            }
        }
        reduction::reduce(self, array, opts)
    }

    /// Running reduction along one axis; output length matches the input.
    pub fn accumulate(&self, array: &Array, opts: &AccumulateOptions) -> Result<Array> {
        self.check_reducible()?;
        if let Some(hook) = opts.override_hook {
            if let Some(result) =
                hook.try_override(self, UFuncMethod::Accumulate, std::slice::from_ref(array))
            {
                return result.and_then(one_output);
            }
        }
        reduction::accumulate(self, array, opts)
    }

    /// Segmented reduction: one reduced value per index interval.
    pub fn reduceat(
        &self,
        array: &Array,
        indices: &[isize],
        opts: &AccumulateOptions,
    ) -> Result<Array> {
        self.check_reducible()?;
        if let Some(hook) = opts.override_hook {
            if let Some(result) =
                hook.try_override(self, UFuncMethod::ReduceAt, std::slice::from_ref(array))
            {
                return result.and_then(one_output);
            }
        }
        reduction::reduceat(self, array, indices, opts)
    }

    /// Apply to every pair drawn from `a` and `b`: the result has shape
    /// `a.shape + b.shape`.
    pub fn outer(&self, a: &Array, b: &Array, opts: &CallOptions) -> Result<Vec<Array>> {
        if self.nin != 2 {
            return Err(UFuncError::Usage(format!(
                "outer is only supported for binary operations, '{}' takes {} inputs",
                self.name, self.nin
            )));
        }
        if self.signature().is_some() {
            return Err(UFuncError::Usage(format!(
                "'{}' has a core signature and does not support outer",
                self.name
            )));
        }
        if let Some(hook) = opts.override_hook {
            let inputs = vec![a.clone(), b.clone()];
            if let Some(result) = hook.try_override(self, UFuncMethod::Outer, &inputs) {
                return result;
            }
        }
        let lifted = a.with_trailing_axes(b.ndim());
        let inner = CallOptions {
            override_hook: None,
            out: opts.out.clone(),
            dtype: opts.dtype,
            casting: opts.casting,
            order: opts.order,
            subok: opts.subok,
            where_: opts.where_.clone(),
            axis: None,
            axes: None,
            keepdims: false,
            output_hooks: opts.output_hooks.clone(),
            bracket: opts.bracket,
            fp_policy: opts.fp_policy,
        };
        execute::elementwise(self, &[lifted, b.clone()], &inner)
    }

    /// Unbuffered in-place application at the given indices along the first
    /// axis of `array`. Repeated indices are visited once per occurrence,
    /// each seeing the previous visit's result.
    pub fn at(
        &self,
        array: &Array,
        indices: &[isize],
        values: Option<&Array>,
        hook: Option<&dyn OverrideHook>,
    ) -> Result<()> {
        if let Some(h) = hook {
            let mut inputs = vec![array.clone()];
            if let Some(v) = values {
                inputs.push(v.clone());
            }
            if let Some(result) = h.try_override(self, UFuncMethod::At, &inputs) {
                return result.map(|_| ());
            }
        }
        match (self.nin, values) {
            (1, None) | (2, Some(_)) => {}
            (2, None) => {
                return Err(UFuncError::Usage(format!(
                    "'{}' takes two inputs, so a second operand is required for at",
                    self.name
                )))
            }
            _ => {
                return Err(UFuncError::Usage(format!(
                    "at is only supported for unary and binary operations, '{}' takes {} inputs",
                    self.name, self.nin
                )))
            }
        }
        if self.nout != 1 || self.signature().is_some() {
            return Err(UFuncError::Usage(format!(
                "'{}' does not support at",
                self.name
            )));
        }
        execute::index_apply(self, array, indices, values)
    }

    fn check_arity(&self, got: usize) -> Result<()> {
        if got != self.nin {
            return Err(UFuncError::Usage(format!(
                "'{}' takes {} inputs, got {}",
                self.name, self.nin, got
            )));
        }
        Ok(())
    }

    fn check_reducible(&self) -> Result<()> {
        if self.nin != 2 || self.nout != 1 {
            return Err(UFuncError::Usage(format!(
                "reduce only supported for binary functions with one output, \
                 '{}' has {} inputs and {} outputs",
                self.name, self.nin, self.nout
            )));
        }
        if self.signature().is_some() {
            return Err(UFuncError::Usage(format!(
                "reduction not defined on operations with a core signature like '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

fn one_output(mut outs: Vec<Array>) -> Result<Array> {
    match outs.len() {
        1 => Ok(outs.remove(0)),
        n => Err(UFuncError::Internal(format!(
            "override returned {n} outputs for a single-output method"
        ))),
    }
}

/// Builder for [`UFunc`].
pub struct UFuncBuilder {
    name: String,
    nin: usize,
    nout: usize,
    identity: Identity,
    promotes_integers: bool,
    signature: Option<String>,
    registry: LoopRegistry,
    resolver: Option<Box<dyn TypeResolver + Send + Sync>>,
}

impl UFuncBuilder {
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    pub fn promotes_integers(mut self, yes: bool) -> Self {
        self.promotes_integers = yes;
        self
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_string());
        self
    }

    pub fn loop_for(mut self, ins: Vec<DType>, outs: Vec<DType>, loop_fn: LoopFn) -> Self {
        self.registry.register(ins, outs, loop_fn);
        self
    }

    pub fn resolver(mut self, resolver: Box<dyn TypeResolver + Send + Sync>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn registry_mut(&mut self) -> &mut LoopRegistry {
        &mut self.registry
    }

    pub fn build(self) -> Result<UFunc> {
        if self.nin == 0 || self.nout == 0 {
            return Err(UFuncError::Usage(format!(
                "'{}' must declare at least one input and one output",
                self.name
            )));
        }
        let signature = match &self.signature {
            Some(text) => Some(CoreSignature::parse(self.nin, self.nout, text)?),
            None => None,
        };
        Ok(UFunc {
            name: self.name,
            nin: self.nin,
            nout: self.nout,
            identity: self.identity,
            promotes_integers: self.promotes_integers,
            signature,
            registry: self.registry,
            resolver: self.resolver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LoopContext;

    unsafe fn noop_loop(
        _data: &[*mut u8],
        _dims: &[usize],
        _strides: &[isize],
        _ctx: &mut LoopContext,
    ) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_builder_basic() {
        let u = UFunc::builder("add", 2, 1)
            .identity(Identity::Zero)
            .promotes_integers(true)
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                noop_loop,
            )
            .build()
            .unwrap();
        assert_eq!(u.name(), "add");
        assert_eq!(u.nop(), 3);
        assert!(u.signature().is_none());
        assert_eq!(u.reduce_dtype(&DType::bool_()).id(), DTypeId::Int64);
        assert_eq!(u.reduce_dtype(&DType::uint8()).id(), DTypeId::UInt64);
        assert_eq!(u.reduce_dtype(&DType::float32()).id(), DTypeId::Float32);
    }

    #[test]
    fn test_trivial_signature_is_elementwise() {
        let u = UFunc::builder("add", 2, 1)
            .signature("(),()->()")
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                noop_loop,
            )
            .build()
            .unwrap();
        assert!(u.signature().is_none());
    }

    #[test]
    fn test_bad_signature_fails_build() {
        let err = UFunc::builder("weird", 2, 1)
            .signature("(i),(i)")
            .build()
            .unwrap_err();
        assert!(matches!(err, UFuncError::SignatureParse { .. }));
    }

    #[test]
    fn test_reduce_rejected_for_gufunc() {
        let u = UFunc::builder("inner1d", 2, 1)
            .signature("(i),(i)->()")
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                noop_loop,
            )
            .build()
            .unwrap();
        let err = u
            .reduce(
                &Array::from_vec(vec![1.0f64], &[1]).unwrap(),
                &ReduceOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, UFuncError::Usage(_)));
    }

    #[test]
    fn test_at_checks_override_hook_first() {
        use crate::hooks::OverrideHook;
        use std::cell::Cell;

        struct Takeover {
            seen: Cell<Option<UFuncMethod>>,
        }
        impl OverrideHook for Takeover {
            fn try_override(
                &self,
                _ufunc: &UFunc,
                method: UFuncMethod,
                _inputs: &[Array],
            ) -> Option<Result<Vec<Array>>> {
                self.seen.set(Some(method));
                Some(Ok(Vec::new()))
            }
        }

        let u = UFunc::builder("add", 2, 1)
            .loop_for(
                vec![DType::float64(), DType::float64()],
                vec![DType::float64()],
                noop_loop,
            )
            .build()
            .unwrap();
        let a = Array::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
        let v = Array::from_vec(vec![5.0f64], &[1]).unwrap();
        let hook = Takeover {
            seen: Cell::new(None),
        };
        // Indices that would fail validation; the hook runs first.
        u.at(&a, &[9], Some(&v), Some(&hook)).unwrap();
        assert_eq!(hook.seen.get(), Some(UFuncMethod::At));
        assert_eq!(a.to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_identity_values() {
        assert!(matches!(Identity::Zero.value(), Some(ScalarValue::Int(0))));
        assert!(matches!(Identity::One.value(), Some(ScalarValue::Int(1))));
        assert!(Identity::ReorderableNone.value().is_none());
    }
}
