//! Integration tests for the QR expansion
//!
//! Tests verify, on the reference backend:
//! - Shapes: Q is [*B, m, m], R is [*B, m, n]
//! - Triangularity: R is upper triangular
//! - Orthogonality: Q^T @ Q ≈ I per batch element
//! - Reconstruction: Q @ R ≈ A per batch element
//! - Batch independence, block-size invariance, determinism
//! - Edge cases: 1x1, zero matrix, tall/wide, block_size >= min(m, n)

use expandr::dtype::{machine_epsilon, DType};
use expandr::error::Error;
use expandr::expand::{build_qr, QrExpander};
use expandr::graph::{Graph, Precision};
use expandr::runtime::{Evaluator, Value};
use expandr::tensor::Tensor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Helper Functions
// ============================================================================

/// Build, evaluate, and unpack a QR expansion for one input.
fn run_qr(input: &Tensor, block_size: usize, precision: Precision) -> (Tensor, Tensor) {
    let mut g = Graph::new();
    let a = g.parameter(input.shape().clone(), input.dtype());
    let qr = build_qr(&mut g, a, block_size, precision).unwrap();
    g.set_outputs(&[qr]);
    unpack_qr(Evaluator::new(&g).run(&[input.clone()]).unwrap())
}

fn unpack_qr(mut outputs: Vec<Value>) -> (Tensor, Tensor) {
    let root = outputs.remove(0);
    let elems = root.as_tuple().unwrap();
    (
        elems[0].as_tensor().unwrap().clone(),
        elems[1].as_tensor().unwrap().clone(),
    )
}

fn qr_f64(data: &[f64], shape: &[usize], block_size: usize) -> (Tensor, Tensor) {
    let input = Tensor::from_slice(data, shape);
    run_qr(&input, block_size, Precision::Highest)
}

/// Plain row-major matmul used as the test oracle.
fn mat_mul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            for l in 0..k {
                acc += a[i * k + l] * b[l * n + j];
            }
            out[i * n + j] = acc;
        }
    }
    out
}

fn assert_allclose(a: &[f64], b: &[f64], tol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol,
            "{}: element {} differs: {} vs {} (tol={})",
            msg,
            i,
            x,
            y,
            tol
        );
    }
}

/// Orthogonality, triangularity, and reconstruction for every batch slice.
fn check_qr_invariants(input: &Tensor, q: &Tensor, r: &Tensor, tol: f64) {
    let shape = input.shape();
    let rank = shape.ndim();
    let (m, n) = (shape[rank - 2], shape[rank - 1]);
    let batch: usize = shape[..rank - 2].iter().product();

    let mut expected_q_shape: Vec<usize> = shape[..rank - 2].to_vec();
    expected_q_shape.extend([m, m]);
    assert_eq!(q.shape().as_slice(), expected_q_shape.as_slice());
    assert_eq!(r.shape().as_slice(), shape.as_slice());

    let a_data = input.to_f64_vec();
    let q_data = q.to_f64_vec();
    let r_data = r.to_f64_vec();

    for b in 0..batch {
        let a_b = &a_data[b * m * n..(b + 1) * m * n];
        let q_b = &q_data[b * m * m..(b + 1) * m * m];
        let r_b = &r_data[b * m * n..(b + 1) * m * n];

        for v in q_b.iter().chain(r_b) {
            assert!(v.is_finite(), "batch {}: non-finite output {}", b, v);
        }

        // R upper triangular
        for i in 0..m {
            for j in 0..n.min(i) {
                assert!(
                    r_b[i * n + j].abs() <= tol,
                    "batch {}: R[{}, {}] = {} below the diagonal",
                    b,
                    i,
                    j,
                    r_b[i * n + j]
                );
            }
        }

        // Q^T Q = I
        let mut qt = vec![0.0; m * m];
        for i in 0..m {
            for j in 0..m {
                qt[i * m + j] = q_b[j * m + i];
            }
        }
        let gram = mat_mul(&qt, q_b, m, m, m);
        for i in 0..m {
            for j in 0..m {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[i * m + j] - expected).abs() <= tol,
                    "batch {}: (Q^T Q)[{}, {}] = {}",
                    b,
                    i,
                    j,
                    gram[i * m + j]
                );
            }
        }

        // Q R = A
        let recon = mat_mul(q_b, r_b, m, m, n);
        assert_allclose(&recon, a_b, tol, &format!("batch {}: Q @ R", b));
    }
}

fn random_matrix(rng: &mut StdRng, len: usize) -> Vec<f64> {
    (0..len).map(|_| rng.gen_range(-5.0..5.0)).collect()
}

// ============================================================================
// Concrete scenarios
// ============================================================================

#[test]
fn test_identity_input() {
    let (q, r) = qr_f64(&[1.0, 0.0, 0.0, 1.0], &[2, 2], 128);
    assert_allclose(&q.to_f64_vec(), &[1.0, 0.0, 0.0, 1.0], 1e-12, "Q");
    assert_allclose(&r.to_f64_vec(), &[1.0, 0.0, 0.0, 1.0], 1e-12, "R");
}

#[test]
fn test_permutation_input() {
    let a = [0.0, 1.0, 1.0, 0.0];
    let input = Tensor::from_slice(&a, [2, 2]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-10);
    // Up to the Householder sign convention Q is the same permutation and R
    // the identity.
    let q_abs: Vec<f64> = q.to_f64_vec().iter().map(|v| v.abs()).collect();
    let r_abs: Vec<f64> = r.to_f64_vec().iter().map(|v| v.abs()).collect();
    assert_allclose(&q_abs, &[0.0, 1.0, 1.0, 0.0], 1e-10, "|Q|");
    assert_allclose(&r_abs, &[1.0, 0.0, 0.0, 1.0], 1e-10, "|R|");
}

#[test]
fn test_golub_van_loan_example() {
    let a = [12.0, -51.0, 4.0, 6.0, 167.0, -68.0, -4.0, 24.0, -41.0];
    let input = Tensor::from_slice(&a, [3, 3]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-9);
    let r_abs: Vec<f64> = r.to_f64_vec().iter().map(|v| v.abs()).collect();
    let expected = [14.0, 21.0, 14.0, 0.0, 175.0, 70.0, 0.0, 0.0, 35.0];
    assert_allclose(&r_abs, &expected, 1e-5, "|R|");
}

#[test]
fn test_tall_input() {
    let input = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [3, 2]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-10);
    // Rows past min(m, n) of R are zero.
    let r_data = r.to_f64_vec();
    assert_allclose(&r_data[4..6], &[0.0, 0.0], 1e-10, "R bottom row");
}

#[test]
fn test_wide_input() {
    let input = Tensor::from_slice(&[1.0, 4.0, 2.0, -1.0, 0.5, 3.0], [2, 3]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-10);
}

#[test]
fn test_batched_input() {
    let a = [1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 3.0];
    let input = Tensor::from_slice(&a, [2, 2, 2]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-12);
}

#[test]
fn test_zero_matrix() {
    let input = Tensor::from_slice(&[0.0, 0.0, 0.0, 0.0], [2, 2]);
    let (q, r) = run_qr(&input, 128, Precision::Highest);
    // The zero-norm branch must not produce NaN: tau = 0, Q = I, R = 0.
    assert_allclose(&q.to_f64_vec(), &[1.0, 0.0, 0.0, 1.0], 0.0, "Q");
    assert_allclose(&r.to_f64_vec(), &[0.0; 4], 0.0, "R");
}

#[test]
fn test_one_by_one() {
    let (q, r) = qr_f64(&[-3.0], &[1, 1], 128);
    let qv = q.to_f64_vec()[0];
    let rv = r.to_f64_vec()[0];
    assert!((qv.abs() - 1.0).abs() < 1e-12, "Q = [[{}]]", qv);
    assert!((rv.abs() - 3.0).abs() < 1e-12, "R = [[{}]]", rv);
    assert!((qv * rv + 3.0).abs() < 1e-12);
}

// ============================================================================
// Universal invariants
// ============================================================================

#[test]
fn test_random_square() {
    let mut rng = StdRng::seed_from_u64(7);
    let data = random_matrix(&mut rng, 25);
    let input = Tensor::from_slice(&data, [5, 5]);
    let (q, r) = run_qr(&input, 2, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-9);
}

#[test]
fn test_random_tall_and_wide() {
    let mut rng = StdRng::seed_from_u64(11);
    for shape in [[7, 3], [3, 7], [6, 6]] {
        let data = random_matrix(&mut rng, shape[0] * shape[1]);
        let input = Tensor::from_slice(&data, shape);
        let (q, r) = run_qr(&input, 3, Precision::Highest);
        check_qr_invariants(&input, &q, &r, 1e-9);
    }
}

#[test]
fn test_random_batched() {
    let mut rng = StdRng::seed_from_u64(13);
    let data = random_matrix(&mut rng, 3 * 4 * 3);
    let input = Tensor::from_slice(&data, [3, 4, 3]);
    let (q, r) = run_qr(&input, 2, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-9);
}

#[test]
fn test_batch_independence() {
    // qr over a permuted batch equals the permuted qr, bitwise: the batch
    // axis is data-parallel by construction.
    let mut rng = StdRng::seed_from_u64(17);
    let first = random_matrix(&mut rng, 9);
    let second = random_matrix(&mut rng, 9);

    let mut stacked = first.clone();
    stacked.extend_from_slice(&second);
    let mut swapped = second.clone();
    swapped.extend_from_slice(&first);

    let (q_a, r_a) = qr_f64(&stacked, &[2, 3, 3], 2);
    let (q_b, r_b) = qr_f64(&swapped, &[2, 3, 3], 2);

    let (qa, ra) = (q_a.to_f64_vec(), r_a.to_f64_vec());
    let (qb, rb) = (q_b.to_f64_vec(), r_b.to_f64_vec());
    assert_eq!(qa[..9], qb[9..], "Q batch 0 vs permuted batch 1");
    assert_eq!(qa[9..], qb[..9], "Q batch 1 vs permuted batch 0");
    assert_eq!(ra[..9], rb[9..], "R batch 0 vs permuted batch 1");
    assert_eq!(ra[9..], rb[..9], "R batch 1 vs permuted batch 0");
}

#[test]
fn test_block_size_invariance() {
    let mut rng = StdRng::seed_from_u64(19);
    let data = random_matrix(&mut rng, 6 * 5);
    let input = Tensor::from_slice(&data, [6, 5]);

    let (q_ref, r_ref) = run_qr(&input, 1, Precision::Highest);
    for block_size in [2, 3, 5, 128] {
        let (q, r) = run_qr(&input, block_size, Precision::Highest);
        check_qr_invariants(&input, &q, &r, 1e-9);
        // Same reflectors regardless of blocking, so the results agree to
        // roundoff without any sign fixup.
        assert_allclose(
            &q.to_f64_vec(),
            &q_ref.to_f64_vec(),
            1e-9,
            &format!("Q, block_size {}", block_size),
        );
        assert_allclose(
            &r.to_f64_vec(),
            &r_ref.to_f64_vec(),
            1e-9,
            &format!("R, block_size {}", block_size),
        );
    }
}

#[test]
fn test_determinism() {
    let mut rng = StdRng::seed_from_u64(23);
    let data = random_matrix(&mut rng, 16);

    let build = || {
        let mut g = Graph::new();
        let a = g.parameter([4, 4], DType::F64);
        let qr = build_qr(&mut g, a, 2, Precision::Highest).unwrap();
        g.set_outputs(&[qr]);
        g
    };
    let g1 = build();
    let g2 = build();
    assert_eq!(g1, g2, "same signature must build structurally equal graphs");

    let input = Tensor::from_slice(&data, [4, 4]);
    let run = |g: &Graph| unpack_qr(Evaluator::new(g).run(&[input.clone()]).unwrap());
    let (q1, r1) = run(&g1);
    let (q2, r2) = run(&g2);
    assert_eq!(q1.to_f64_vec(), q2.to_f64_vec(), "Q must be bitwise equal");
    assert_eq!(r1.to_f64_vec(), r2.to_f64_vec(), "R must be bitwise equal");
}

// ============================================================================
// f32 and the cached expander
// ============================================================================

#[test]
fn test_f32_through_expander() {
    let a: Vec<f32> = vec![12.0, -51.0, 4.0, 6.0, 167.0, -68.0, -4.0, 24.0, -41.0];
    let input = Tensor::from_slice(&a, [3, 3]);
    let expander = QrExpander::new();
    let graph = expander.expand(&[3, 3], DType::F32).unwrap();
    let (q, r) = unpack_qr(Evaluator::new(&graph).run(&[input.clone()]).unwrap());
    check_qr_invariants(&input, &q, &r, 1e5 * machine_epsilon(DType::F32));
    let r_abs: Vec<f64> = r.to_f64_vec().iter().map(|v| v.abs()).collect();
    let expected = [14.0, 21.0, 14.0, 0.0, 175.0, 70.0, 0.0, 0.0, 35.0];
    assert_allclose(&r_abs, &expected, 1e-2, "|R|");
}

#[test]
fn test_f32_batched() {
    let mut rng = StdRng::seed_from_u64(29);
    let data: Vec<f32> = (0..2 * 4 * 4).map(|_| rng.gen_range(-2.0..2.0)).collect();
    let input = Tensor::from_slice(&data, [2, 4, 4]);
    let (q, r) = run_qr(&input, 2, Precision::Highest);
    check_qr_invariants(&input, &q, &r, 1e-4);
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_rank_too_small() {
    let mut g = Graph::new();
    let a = g.parameter([5], DType::F64);
    let err = build_qr(&mut g, a, 128, Precision::Highest).unwrap_err();
    match err {
        Error::InvalidArgument { arg, reason } => {
            assert_eq!(arg, "a");
            assert!(reason.contains("[5]"), "shape missing from: {}", reason);
        }
        other => panic!("expected InvalidArgument, got {:?}", other),
    }
}

#[test]
fn test_zero_block_size() {
    let mut g = Graph::new();
    let a = g.parameter([3, 3], DType::F64);
    let err = build_qr(&mut g, a, 0, Precision::Highest).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidArgument {
            arg: "block_size",
            ..
        }
    ));
}

#[test]
fn test_integer_dtype_rejected() {
    let mut g = Graph::new();
    let a = g.parameter([3, 3], DType::I32);
    let err = build_qr(&mut g, a, 128, Precision::Highest).unwrap_err();
    assert!(matches!(err, Error::UnsupportedDType { .. }));
}
