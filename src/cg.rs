//! Matrix-free conjugate gradient for symmetric positive-definite systems.
//!
//! Imaging forward operators are expensive and implicit, so the solver only
//! ever sees a matrix-vector-product closure; no matrix is materialized.
//!
//! Non-convergence within the iteration budget is **not** an error: the best
//! iterate found is returned and the caller treats it as an approximation.
//! The decomposed data-consistency predictor relies on exactly this early-stop
//! behavior (a handful of iterations per reverse-time step).

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use tracing::trace;

/// What the solver did, alongside the returned iterate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgSummary {
    /// Iterations actually performed.
    pub iterations: usize,
    /// Euclidean norm of the final residual `b - A x`.
    pub residual_norm: f32,
    /// Whether `residual_norm <= tol` was reached within the budget.
    pub converged: bool,
}

/// Solve `A x = b` for SPD `A` given only `matvec: v -> A v`.
///
/// - `b`: right-hand side
/// - `x0`: initial guess (same length as `b`)
/// - `max_iter`: iteration budget (>= 1)
/// - `tol`: residual-norm convergence threshold (> 0, finite)
///
/// Returns the iterate together with a [`CgSummary`]. If the matvec closure
/// ever produces a non-SPD direction (`p·Ap <= 0`), iteration stops and the
/// current iterate is returned; callers see this as ordinary partial
/// convergence.
pub fn conjugate_gradient<F>(
    matvec: F,
    b: &ArrayView1<f32>,
    x0: &ArrayView1<f32>,
    max_iter: usize,
    tol: f32,
) -> Result<(Array1<f32>, CgSummary)>
where
    F: Fn(&ArrayView1<f32>) -> Array1<f32>,
{
    if b.is_empty() {
        return Err(Error::Domain("rhs must be non-empty"));
    }
    if b.len() != x0.len() {
        return Err(Error::Shape("rhs and initial guess must have equal length"));
    }
    if max_iter == 0 {
        return Err(Error::Domain("max_iter must be >= 1"));
    }
    if !tol.is_finite() || !(tol > 0.0) {
        return Err(Error::Domain("tol must be positive and finite"));
    }

    let mut x = x0.to_owned();
    let ax = matvec(&x.view());
    if ax.len() != b.len() {
        return Err(Error::Shape("matvec output length must match rhs"));
    }

    let mut r = b - &ax;
    let mut p = r.clone();
    let mut rs = r.dot(&r);

    let mut iterations = 0usize;
    for _ in 0..max_iter {
        if rs.sqrt() <= tol {
            break;
        }
        let ap = matvec(&p.view());
        let pap = p.dot(&ap);
        if !(pap > 0.0) || !pap.is_finite() {
            // Lost positive-definiteness (numerically); keep the best iterate.
            trace!(pap, "cg: non-positive curvature, stopping early");
            break;
        }
        let alpha = rs / pap;
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &ap);
        let rs_new = r.dot(&r);
        let beta = rs_new / rs;
        p = &r + &(p * beta);
        rs = rs_new;
        iterations += 1;
    }

    let residual_norm = rs.sqrt();
    let converged = residual_norm <= tol;
    trace!(iterations, residual_norm, converged, "cg finished");

    Ok((
        x,
        CgSummary {
            iterations,
            residual_norm,
            converged,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use proptest::prelude::*;

    fn dense_matvec(a: &Array2<f32>) -> impl Fn(&ArrayView1<f32>) -> Array1<f32> + '_ {
        |v: &ArrayView1<f32>| a.dot(v)
    }

    #[test]
    fn identity_system_converges_immediately() {
        let b = Array1::from_vec(vec![1.0f32, -2.0, 3.0]);
        let x0 = Array1::zeros(3);
        let (x, summary) =
            conjugate_gradient(|v| v.to_owned(), &b.view(), &x0.view(), 10, 1e-6).unwrap();
        assert!(summary.converged);
        assert!(summary.iterations <= 1);
        for i in 0..3 {
            assert!((x[i] - b[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn budget_exhaustion_returns_best_iterate() {
        // Moderately conditioned 4x4 SPD system; one iteration cannot solve it,
        // but the iterate must still move toward the solution.
        let a = Array2::from_shape_vec(
            (4, 4),
            vec![
                4.0f32, 1.0, 0.0, 0.0, //
                1.0, 3.0, 1.0, 0.0, //
                0.0, 1.0, 2.0, 1.0, //
                0.0, 0.0, 1.0, 2.0,
            ],
        )
        .unwrap();
        let b = Array1::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]);
        let x0 = Array1::zeros(4);

        let (x, summary) =
            conjugate_gradient(dense_matvec(&a), &b.view(), &x0.view(), 1, 1e-10).unwrap();
        assert!(!summary.converged);
        assert_eq!(summary.iterations, 1);

        let r0 = b.dot(&b).sqrt();
        assert!(summary.residual_norm < r0, "residual must shrink");
        assert!(x.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn input_contracts() {
        let b = Array1::from_vec(vec![1.0f32]);
        let x0 = Array1::zeros(2);
        assert!(conjugate_gradient(|v| v.to_owned(), &b.view(), &x0.view(), 10, 1e-6).is_err());

        let x0 = Array1::zeros(1);
        assert!(conjugate_gradient(|v| v.to_owned(), &b.view(), &x0.view(), 0, 1e-6).is_err());
        assert!(conjugate_gradient(|v| v.to_owned(), &b.view(), &x0.view(), 10, 0.0).is_err());
        assert!(
            conjugate_gradient(|v| v.to_owned(), &b.view(), &x0.view(), 10, f32::NAN).is_err()
        );

        let empty = Array1::<f32>::zeros(0);
        assert!(
            conjugate_gradient(|v| v.to_owned(), &empty.view(), &empty.view(), 10, 1e-6).is_err()
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_identity_plus_perturbation_converges(
            n in 1usize..24,
            seed in any::<u64>(),
        ) {
            use rand::{Rng, SeedableRng};
            use rand_chacha::ChaCha8Rng;

            let mut rng = ChaCha8Rng::seed_from_u64(seed);

            // A = I + 0.1 * M M^T / n  (SPD, well conditioned).
            let m = Array2::from_shape_fn((n, n), |_| rng.random_range(-1.0f32..1.0));
            let mut a = m.dot(&m.t()) * (0.1 / n as f32);
            for i in 0..n {
                a[[i, i]] += 1.0;
            }

            let x_true = Array1::from_shape_fn(n, |_| rng.random_range(-2.0f32..2.0));
            let b = a.dot(&x_true);
            let x0 = Array1::zeros(n);

            let (x, summary) =
                conjugate_gradient(dense_matvec(&a), &b.view(), &x0.view(), n + 10, 1e-5).unwrap();

            prop_assert!(summary.converged, "residual {}", summary.residual_norm);
            for i in 0..n {
                prop_assert!((x[i] - x_true[i]).abs() < 1e-3,
                    "component {i}: {} vs {}", x[i], x_true[i]);
            }
        }
    }
}
