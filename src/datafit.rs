//! Measurement-misfit capability: a non-negative loss plus its gradient.
//!
//! The original formulation differentiates the misfit through an autodiff
//! tape opened around a single evaluation. Here the gradient is an explicit
//! capability call that returns a fresh array, which bounds memory across the
//! multi-hundred-step loop by construction. Implementations without an
//! analytic gradient can fall back to [`numerical_grad`].

use crate::operator::ForwardOperator;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Data-fit term \(L(x) \ge 0\), zero iff `x` is perfectly consistent with
/// the observed measurement.
///
/// `grad` is the gradient of `loss` with respect to its input, evaluated at
/// the same point (same shape as the input).
pub trait DataFit {
    fn loss(&self, x: &ArrayView2<f32>) -> f32;
    fn grad(&self, x: &ArrayView2<f32>) -> Array2<f32>;
}

/// Frobenius-norm measurement misfit \(L(x) = \|y - A x\|\).
///
/// The (unsquared) norm matches the negative log-likelihood surrogate used
/// for measurement-guided sampling; its gradient is
/// \(Aᵗ(Ax - y) / \|y - Ax\|\), taken as zero at perfect consistency.
pub struct MeasurementNorm<'a> {
    operator: &'a dyn ForwardOperator,
    observation: Array2<f32>,
}

impl<'a> MeasurementNorm<'a> {
    pub fn new(operator: &'a dyn ForwardOperator, observation: Array2<f32>) -> Result<Self> {
        if observation.ncols() != operator.measurement_len() {
            return Err(Error::Shape(
                "observation width must equal the operator measurement length",
            ));
        }
        Ok(Self {
            operator,
            observation,
        })
    }

    fn residual(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.nrows(), self.observation.nrows());
        self.operator.apply(x) - &self.observation
    }
}

impl DataFit for MeasurementNorm<'_> {
    fn loss(&self, x: &ArrayView2<f32>) -> f32 {
        let r = self.residual(x);
        r.iter().map(|&v| v * v).sum::<f32>().sqrt()
    }

    fn grad(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let r = self.residual(x);
        let norm = r.iter().map(|&v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Array2::zeros((x.nrows(), x.ncols()));
        }
        self.operator.adjoint(&r.view()) / norm
    }
}

/// Central-difference gradient of a scalar function of a batched state.
///
/// O(d) evaluations per call, so this is for small problems and for
/// cross-checking analytic gradients, not for the hot loop.
pub fn numerical_grad(
    f: impl Fn(&ArrayView2<f32>) -> f32,
    x: &ArrayView2<f32>,
    h: f32,
) -> Result<Array2<f32>> {
    if !h.is_finite() || !(h > 0.0) {
        return Err(Error::Domain("finite-difference step must be positive"));
    }
    let mut probe = x.to_owned();
    let mut grad = Array2::<f32>::zeros(x.raw_dim());
    for i in 0..x.nrows() {
        for k in 0..x.ncols() {
            let orig = probe[[i, k]];
            probe[[i, k]] = orig + h;
            let up = f(&probe.view());
            probe[[i, k]] = orig - h;
            let down = f(&probe.view());
            probe[[i, k]] = orig;
            grad[[i, k]] = (up - down) / (2.0 * h);
        }
    }
    Ok(grad)
}
