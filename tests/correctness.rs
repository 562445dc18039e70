use approx::assert_relative_eq;
use ufunc_rs::{
    ufuncs, AccumulateOptions, Array, CallOptions, DType, DTypeId, MemoryOrder, ReduceOptions,
    UFuncError,
};

fn linspace(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64 * 0.37 + 0.1).collect()
}

#[test]
fn test_broadcast_row_against_matrix() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    let row = Array::from_vec(vec![10.0f64, 20.0, 30.0], &[3]).unwrap();
    let out = add.call(&[a, row], &CallOptions::default()).unwrap();
    assert_eq!(out[0].shape(), &[2, 3]);
    assert_eq!(
        out[0].to_vec::<f64>().unwrap(),
        vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]
    );
}

#[test]
fn test_trivial_and_generic_paths_agree_bitwise() {
    let mul = ufuncs::multiply();
    let vals = linspace(32);

    // Contiguous operands take the single-call fast path.
    let dense = Array::from_vec(vals.iter().step_by(2).copied().collect(), &[16]).unwrap();
    let fast = mul
        .call(&[dense.clone(), dense.clone()], &CallOptions::default())
        .unwrap();

    // A stride-2 view of the same values forces the blocked plan.
    let big = Array::from_vec(vals, &[32]).unwrap();
    let view = big.slice_axis(0, 0, 16, 2).unwrap();
    let slow = mul
        .call(&[view.clone(), view], &CallOptions::default())
        .unwrap();

    let f = fast[0].to_vec::<f64>().unwrap();
    let s = slow[0].to_vec::<f64>().unwrap();
    for (x, y) in f.iter().zip(s.iter()) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
}

#[test]
fn test_reduce_empty_identity_and_no_identity() {
    let add = ufuncs::add();
    let empty = Array::zeros(DType::float64(), &[0], MemoryOrder::C).unwrap();
    let r = add.reduce(&empty, &ReduceOptions::default()).unwrap();
    assert_eq!(r.to_vec::<f64>().unwrap(), vec![0.0]);

    let max = ufuncs::maximum();
    let err = max.reduce(&empty, &ReduceOptions::default()).unwrap_err();
    assert!(matches!(err, UFuncError::NoIdentity { .. }));
}

#[test]
fn test_reduce_is_a_left_fold() {
    let sub = ufuncs::subtract();
    let a = Array::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
    let r = sub.reduce(&a, &ReduceOptions::default()).unwrap();
    assert_eq!(r.to_vec::<f64>().unwrap(), vec![-4.0]);
}

#[test]
fn test_accumulate_shape_and_first_element() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1.5f64, 2.5, 3.5, 4.5, 5.5, 6.5], &[2, 3]).unwrap();
    let r = add
        .accumulate(
            &a,
            &AccumulateOptions {
                axis: 1,
                ..AccumulateOptions::default()
            },
        )
        .unwrap();
    assert_eq!(r.shape(), &[2, 3]);
    let got = r.to_vec::<f64>().unwrap();
    // The first slice along the axis is a bit-identical copy of the input.
    assert_eq!(got[0].to_bits(), 1.5f64.to_bits());
    assert_eq!(got[3].to_bits(), 4.5f64.to_bits());
    assert_eq!(got, vec![1.5, 4.0, 7.5, 4.5, 10.0, 16.5]);
}

#[test]
fn test_accumulate_in_place_over_input() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[4]).unwrap();
    let r = add
        .accumulate(
            &a,
            &AccumulateOptions {
                out: Some(a.clone()),
                ..AccumulateOptions::default()
            },
        )
        .unwrap();
    assert!(r.same_buffer(&a));
    assert_eq!(a.to_vec::<f64>().unwrap(), vec![1.0, 3.0, 6.0, 10.0]);
}

#[test]
fn test_reduceat_segments_and_degenerate_copy() {
    let add = ufuncs::add();
    let a = Array::from_vec((0..8).map(|v| v as f64).collect(), &[8]).unwrap();
    let r = add
        .reduceat(&a, &[0, 4, 1, 5, 2], &AccumulateOptions::default())
        .unwrap();
    assert_eq!(r.shape(), &[5]);
    // Boundaries running backwards yield a copy of the element at the start
    // index, not an empty reduction.
    assert_eq!(
        r.to_vec::<f64>().unwrap(),
        vec![6.0, 4.0, 10.0, 5.0, 27.0]
    );
}

#[test]
fn test_where_leaves_unselected_untouched() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
    let b = Array::from_vec(vec![10.0f64, 20.0, 30.0], &[3]).unwrap();
    let out = Array::from_vec(vec![9.0f64, 9.0, 9.0], &[3]).unwrap();
    add.call(
        &[a, b],
        &CallOptions {
            out: vec![Some(out.clone())],
            where_: Some(Array::from_bool_vec(vec![true, false, true], &[3]).unwrap()),
            ..CallOptions::default()
        },
    )
    .unwrap();
    assert_eq!(out.to_vec::<f64>().unwrap(), vec![11.0, 9.0, 33.0]);
}

#[test]
fn test_outer_product() {
    let mul = ufuncs::multiply();
    let a = Array::from_vec(vec![1.0f64, 2.0, 3.0], &[3]).unwrap();
    let b = Array::from_vec(vec![10.0f64, 100.0], &[2]).unwrap();
    let out = mul.outer(&a, &b, &CallOptions::default()).unwrap();
    assert_eq!(out[0].shape(), &[3, 2]);
    assert_eq!(
        out[0].to_vec::<f64>().unwrap(),
        vec![10.0, 100.0, 20.0, 200.0, 30.0, 300.0]
    );
}

#[test]
fn test_at_repeated_indices_each_apply() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![0.0f64, 0.0, 0.0, 0.0], &[4]).unwrap();
    let v = Array::from_vec(vec![1.0f64], &[1]).unwrap();
    add.at(&a, &[3, 1, 1, 1], Some(&v), None).unwrap();
    assert_eq!(a.to_vec::<f64>().unwrap(), vec![0.0, 3.0, 0.0, 1.0]);
}

#[test]
fn test_zero_size_short_circuits() {
    let add = ufuncs::add();
    let empty = Array::zeros(DType::float64(), &[0, 3], MemoryOrder::C).unwrap();

    let out = add
        .call(&[empty.clone(), empty.clone()], &CallOptions::default())
        .unwrap();
    assert_eq!(out[0].shape(), &[0, 3]);

    let r = add
        .reduce(
            &empty,
            &ReduceOptions {
                axes: vec![0],
                ..ReduceOptions::default()
            },
        )
        .unwrap();
    assert_eq!(r.shape(), &[3]);
    assert_eq!(r.to_vec::<f64>().unwrap(), vec![0.0, 0.0, 0.0]);

    let r = add
        .reduceat(&empty, &[], &AccumulateOptions::default())
        .unwrap();
    assert_eq!(r.shape(), &[0, 3]);
}

#[test]
fn test_inner1d_core_mismatch_cites_both_sizes() {
    let inner = ufuncs::inner1d();
    let a = Array::from_vec(vec![0.0f64; 4], &[4]).unwrap();
    let b = Array::from_vec(vec![0.0f64; 5], &[5]).unwrap();
    let err = inner.call(&[a, b], &CallOptions::default()).unwrap_err();
    match err {
        UFuncError::CoreDimMismatch {
            actual, expected, ..
        } => assert_eq!((actual, expected), (5, 4)),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_matmul_batched_stack() {
    let matmul = ufuncs::matmul();
    // Two stacked 2x2 matrices against one shared 2x2.
    let a = Array::from_vec(
        vec![1.0f64, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0],
        &[2, 2, 2],
    )
    .unwrap();
    let b = Array::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let out = matmul.call(&[a, b], &CallOptions::default()).unwrap();
    assert_eq!(out[0].shape(), &[2, 2, 2]);
    assert_eq!(
        out[0].to_vec::<f64>().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 6.0, 8.0]
    );
}

#[test]
fn test_output_cast_requires_looser_rule() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
    let out = Array::zeros(DType::int64(), &[2], MemoryOrder::C).unwrap();
    let err = add
        .call(
            &[a.clone(), a],
            &CallOptions {
                out: vec![Some(out)],
                ..CallOptions::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, UFuncError::CastError { .. }));
}

#[test]
fn test_int32_inputs_promote_through_staging() {
    let add = ufuncs::add();
    let a = Array::from_vec(vec![1i32, 2, 3], &[3]).unwrap();
    let b = Array::from_vec(vec![10i32, 20, 30], &[3]).unwrap();
    let out = add.call(&[a, b], &CallOptions::default()).unwrap();
    assert_eq!(out[0].dtype().id(), DTypeId::Int64);
    assert_eq!(out[0].to_vec::<i64>().unwrap(), vec![11, 22, 33]);
}

#[test]
fn test_sin_on_transposed_view() {
    let sin = ufuncs::sin();
    let a = Array::from_vec(linspace(12), &[3, 4]).unwrap();
    let out = sin.call(&[a.t()], &CallOptions::default()).unwrap();
    assert_eq!(out[0].shape(), &[4, 3]);
    let src = a.to_vec::<f64>().unwrap();
    let got = out[0].to_vec::<f64>().unwrap();
    for i in 0..4 {
        for j in 0..3 {
            assert_relative_eq!(got[i * 3 + j], src[j * 4 + i].sin(), epsilon = 1e-12);
        }
    }
}
