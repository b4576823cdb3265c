//! The score-estimation capability.
//!
//! A score model approximates \(\nabla_x \log p_t(x)\) for the noisy marginal
//! at time `t`. In production this is a trained network; the engine only
//! requires the narrow trait below, which is also implemented for plain
//! closures so tests can supply analytic oracles.

use crate::sde::Sde;
use ndarray::{Array2, ArrayView1, ArrayView2};

/// Noise-conditional score estimator.
///
/// Shape contract: `x` is `(batch, d)`, `ts` has length `batch`, and the
/// output has the shape of `x`. Implementations must be stateless in the
/// referential-transparency sense: repeated calls with equal inputs return
/// equal outputs.
pub trait ScoreModel {
    fn score(&self, x: &ArrayView2<f32>, ts: &ArrayView1<f32>) -> Array2<f32>;
}

impl<F> ScoreModel for F
where
    F: Fn(&ArrayView2<f32>, &ArrayView1<f32>) -> Array2<f32>,
{
    fn score(&self, x: &ArrayView2<f32>, ts: &ArrayView1<f32>) -> Array2<f32> {
        self(x, ts)
    }
}

/// Exact score of a Gaussian data distribution under a given schedule.
///
/// If the data are \(N(\mu, \sigma_0^2 I)\), the noisy marginal at time `t`
/// is \(N(\mu, (\sigma_0^2 + \sigma(t)^2) I)\) and the score is
/// \((\mu - x) / (\sigma_0^2 + \sigma(t)^2)\).
///
/// This is the standard oracle for exercising the sampling engine without a
/// trained network; the e2e tests build on it.
#[derive(Debug, Clone)]
pub struct GaussianScore {
    /// Mean image, shape `(1, d)`.
    pub mean: Array2<f32>,
    /// Data standard deviation \(\sigma_0\) (>= 0).
    pub base_std: f32,
    /// Schedule supplying \(\sigma(t)\).
    pub sde: Sde,
}

impl ScoreModel for GaussianScore {
    fn score(&self, x: &ArrayView2<f32>, ts: &ArrayView1<f32>) -> Array2<f32> {
        debug_assert_eq!(x.nrows(), ts.len());
        debug_assert_eq!(x.ncols(), self.mean.ncols());

        let mut out = Array2::<f32>::zeros(x.raw_dim());
        for i in 0..x.nrows() {
            let std = self.sde.marginal_prob_std(ts[i]);
            let var = self.base_std * self.base_std + std * std;
            for k in 0..x.ncols() {
                out[[i, k]] = (self.mean[[0, k]] - x[[i, k]]) / var;
            }
        }
        out
    }
}
