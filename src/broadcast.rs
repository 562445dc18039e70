//! Shape broadcasting and generalized core-dimension geometry.
//!
//! Plain elementwise calls use [`broadcast_shapes`] and
//! [`broadcast_strides`]: shapes align right, size-1 and missing axes
//! stretch with byte stride 0. Generalized operations additionally split
//! each operand into broadcast axes and trailing core axes; this module
//! resolves the shared core-dimension sizes across operands, drops
//! ignorable dimensions consistently, and normalizes the `axis=`/`axes=`/
//! `keepdims=` conveniences into per-operand core-axis lists.

use crate::signature::CoreSignature;
use crate::{Result, UFuncError};

/// Broadcast an operand list's shapes NumPy-style: align right, a size-1
/// axis stretches to match, anything else must agree exactly.
pub(crate) fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1usize; rank];
    for shape in shapes {
        let lead = rank - shape.len();
        for (i, &d) in shape.iter().enumerate() {
            let o = &mut out[lead + i];
            if *o == 1 {
                *o = d;
            } else if d != 1 && d != *o {
                return Err(UFuncError::ShapeMismatch(format!(
                    "operands could not be broadcast together with shapes {:?}",
                    shapes
                )));
            }
        }
    }
    Ok(out)
}

/// Byte strides of an operand viewed at the broadcast shape `target`.
/// Stretched axes (missing or size 1) get stride 0 so the same element is
/// revisited.
pub(crate) fn broadcast_strides(
    dims: &[usize],
    strides: &[isize],
    target: &[usize],
) -> Result<Vec<isize>> {
    let lead = target.len() - dims.len();
    let mut out = vec![0isize; target.len()];
    for (i, (&d, &s)) in dims.iter().zip(strides.iter()).enumerate() {
        if d == target[lead + i] {
            out[lead + i] = s;
        } else if d != 1 {
            return Err(UFuncError::ShapeMismatch(format!(
                "shape {:?} is not broadcastable to {:?}",
                dims, target
            )));
        }
    }
    Ok(out)
}

/// Resolve a possibly negative axis against `rank`.
pub(crate) fn normalize_axis(axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(UFuncError::InvalidAxis { axis, rank });
    }
    Ok(resolved as usize)
}

// ----------------------------------------------------------------------
// Core-dimension geometry
// ----------------------------------------------------------------------

/// Per-call resolution of a signature against concrete operand shapes.
#[derive(Debug)]
pub(crate) struct CoreGeometry {
    /// Core-dimension count of each operand after ignorable dims were
    /// dropped. Indexed like the signature's operands.
    pub op_core_num_dims: Vec<usize>,
    /// Per distinct dimension: true when a short-ranked operand caused the
    /// dimension to be dropped from every operand that names it.
    pub missing: Vec<bool>,
    /// Resolved size of each distinct dimension. Missing dims resolve to 1.
    pub core_sizes: Vec<usize>,
}

impl CoreGeometry {
    /// Declared core dims of `op` with the dropped ones filtered out.
    pub(crate) fn present_dims<'a>(
        &'a self,
        sig: &'a CoreSignature,
        op: usize,
    ) -> impl Iterator<Item = usize> + 'a {
        sig.dim_indices(op)
            .iter()
            .copied()
            .filter(|&ix| !self.missing[ix])
    }
}

fn operand_kind(sig: &CoreSignature, op: usize) -> (&'static str, usize) {
    if op < sig.nin() {
        ("input", op)
    } else {
        ("output", op - sig.nin())
    }
}

/// Match operand shapes against the signature. `shapes[i]` is `None` for an
/// output the caller did not supply. Short-ranked operands drop ignorable
/// dims, one at a time in declaration order, and the drop applies to every
/// operand naming that dimension. Shared dims take their size from the
/// first operand that mentions them; later mentions must agree.
/// Rank-only half of signature matching: how many core dims each operand
/// ends up with once short ranks have dropped ignorable dims. Needs no
/// axis placement, so it runs before any `axes=` permutation.
pub(crate) fn resolve_core_ranks(
    name: &str,
    sig: &CoreSignature,
    ranks: &[Option<usize>],
) -> Result<(Vec<usize>, Vec<bool>)> {
    let ndistinct = sig.num_distinct_dims();
    let mut op_core_num_dims: Vec<usize> = (0..sig.nop()).map(|op| sig.num_core_dims(op)).collect();
    let mut missing = vec![false; ndistinct];
    let mut ignorable: Vec<bool> = (0..ndistinct).map(|ix| sig.can_ignore(ix)).collect();

    for op in 0..sig.nop() {
        let Some(rank) = ranks[op] else { continue };
        let mut mismatch = op_core_num_dims[op].saturating_sub(rank);
        if mismatch > 0 {
            for &ix in sig.dim_indices(op) {
                if mismatch == 0 {
                    break;
                }
                if ignorable[ix] {
                    ignorable[ix] = false;
                    missing[ix] = true;
                    for other in 0..sig.nop() {
                        let uses = sig.dim_indices(other).iter().filter(|&&j| j == ix).count();
                        op_core_num_dims[other] -= uses;
                    }
                    mismatch = op_core_num_dims[op].saturating_sub(rank);
                }
            }
        }
        if rank < op_core_num_dims[op] {
            let (kind, index) = operand_kind(sig, op);
            return Err(UFuncError::CoreDimsMissing {
                ufunc: name.to_string(),
                kind,
                index,
                rank,
                signature: sig.text().to_string(),
                required: op_core_num_dims[op],
            });
        }
    }
    Ok((op_core_num_dims, missing))
}

pub(crate) fn resolve_core_geometry(
    name: &str,
    sig: &CoreSignature,
    shapes: &[Option<&[usize]>],
) -> Result<CoreGeometry> {
    let ndistinct = sig.num_distinct_dims();
    let ranks: Vec<Option<usize>> = shapes.iter().map(|s| s.map(|s| s.len())).collect();
    let (op_core_num_dims, missing) = resolve_core_ranks(name, sig, &ranks)?;
    let mut geom = CoreGeometry {
        op_core_num_dims,
        missing,
        core_sizes: vec![0; ndistinct],
    };
    let mut resolved: Vec<Option<usize>> = (0..ndistinct).map(|ix| sig.frozen_size(ix)).collect();

    // Resolve shared sizes from the trailing core axes.
    for op in 0..sig.nop() {
        let Some(shape) = shapes[op] else { continue };
        let core_start = shape.len() - geom.op_core_num_dims[op];
        let mut delta = 0usize;
        for (idim, &ix) in sig.dim_indices(op).iter().enumerate() {
            let size = if geom.missing[ix] {
                delta += 1;
                1
            } else {
                shape[core_start + idim - delta]
            };
            match resolved[ix] {
                None => resolved[ix] = Some(size),
                Some(expected) if expected != size => {
                    let (kind, index) = operand_kind(sig, op);
                    return Err(UFuncError::CoreDimMismatch {
                        ufunc: name.to_string(),
                        kind,
                        index,
                        dim: sig.dim_name(ix).to_string(),
                        actual: size,
                        expected,
                    });
                }
                Some(_) => {}
            }
        }
    }

    for ix in 0..ndistinct {
        match resolved[ix] {
            Some(size) => geom.core_sizes[ix] = size,
            None => {
                return Err(UFuncError::UnresolvedCoreDim {
                    ufunc: name.to_string(),
                    dim: sig.dim_name(ix).to_string(),
                })
            }
        }
    }
    Ok(geom)
}

// ----------------------------------------------------------------------
// axis= / axes= / keepdims= normalization
// ----------------------------------------------------------------------

/// Normalize per-operand `axes=` lists into absolute core-axis positions.
/// Each operand needs exactly as many entries as it has (present) core
/// dims; entries must be in range and distinct.
pub(crate) fn normalize_axes_argument(
    geom: &CoreGeometry,
    ranks: &[usize],
    axes: &[Vec<isize>],
) -> Result<Vec<Vec<usize>>> {
    if axes.len() != geom.op_core_num_dims.len() {
        return Err(UFuncError::Usage(format!(
            "axes should be a list with an entry for all {} operands",
            geom.op_core_num_dims.len()
        )));
    }
    let mut out = Vec::with_capacity(axes.len());
    for (op, entry) in axes.iter().enumerate() {
        let ncore = geom.op_core_num_dims[op];
        if entry.len() != ncore {
            return Err(UFuncError::Usage(format!(
                "operand {} has {} core dimensions, but {} axes were given",
                op,
                ncore,
                entry.len()
            )));
        }
        let mut normalized = Vec::with_capacity(ncore);
        for &ax in entry {
            let ax = normalize_axis(ax, ranks[op])?;
            if normalized.contains(&ax) {
                return Err(UFuncError::DuplicateAxis { axis: ax });
            }
            normalized.push(ax);
        }
        out.push(normalized);
    }
    Ok(out)
}

/// Expand a single `axis=` into `axes=` form. Legal only when every core
/// dimension in the signature refers to one shared distinct dimension, so
/// "the" axis is unambiguous.
pub(crate) fn axis_to_axes(
    sig: &CoreSignature,
    geom: &CoreGeometry,
    axis: isize,
) -> Result<Vec<Vec<isize>>> {
    let mut shared: Option<usize> = None;
    for op in 0..sig.nop() {
        for ix in geom.present_dims(sig, op) {
            match shared {
                None => shared = Some(ix),
                Some(s) if s != ix => {
                    return Err(UFuncError::Usage(
                        "axis can only be used with a single shared core dimension, \
                         like in a reduction, but not with the signature found"
                            .into(),
                    ))
                }
                Some(_) => {}
            }
        }
    }
    Ok((0..sig.nop())
        .map(|op| {
            if geom.op_core_num_dims[op] == 1 {
                vec![axis]
            } else {
                Vec::new()
            }
        })
        .collect())
}

/// `keepdims=` is only meaningful when all inputs share one core-dimension
/// count and no output has core dimensions, so the kept axes line up.
pub(crate) fn validate_keepdims(sig: &CoreSignature, geom: &CoreGeometry) -> Result<usize> {
    let n = geom.op_core_num_dims[0];
    for op in 1..sig.nin() {
        if geom.op_core_num_dims[op] != n {
            return Err(UFuncError::Usage(
                "keepdims requires all inputs to share the same number of core dimensions".into(),
            ));
        }
    }
    for op in sig.nin()..sig.nop() {
        if geom.op_core_num_dims[op] != 0 {
            return Err(UFuncError::Usage(
                "keepdims is only allowed when the outputs have no core dimensions".into(),
            ));
        }
    }
    Ok(n)
}
