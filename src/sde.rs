//! Noise-schedule models (SDEs) for reverse-time sampling.
//!
//! A schedule describes how signal is corrupted as time runs from 0 to 1:
//! `marginal_prob_std(t)` is the standard deviation of the noisy marginal
//! \(p_t(x)\) and `diffusion_coeff(t)` is the SDE diffusion term \(g(t)\).
//!
//! Both functions are pure; a schedule is immutable once constructed, and
//! construction validates that the std is strictly positive and strictly
//! increasing over the whole configured time range.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// Schedule hyperparameters as they appear in a run configuration.
///
/// `kind` is matched once at construction ([`Sde::from_config`]); the
/// hyperparameter fields default to the values used by the pretrained
/// score models this engine is typically paired with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// `"vesde"` or `"vpsde"` (case-insensitive). Anything else is fatal.
    pub kind: String,
    #[serde(default = "default_sigma_min")]
    pub sigma_min: f32,
    #[serde(default = "default_sigma_max")]
    pub sigma_max: f32,
    #[serde(default = "default_beta_min")]
    pub beta_min: f32,
    #[serde(default = "default_beta_max")]
    pub beta_max: f32,
}

fn default_sigma_min() -> f32 {
    0.01
}
fn default_sigma_max() -> f32 {
    50.0
}
fn default_beta_min() -> f32 {
    0.1
}
fn default_beta_max() -> f32 {
    20.0
}

/// A noise schedule, chosen once at construction (no per-step re-dispatch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sde {
    /// Variance-exploding: \(\sigma(t) = \sigma_{min}(\sigma_{max}/\sigma_{min})^t\).
    VarianceExploding { sigma_min: f32, sigma_max: f32 },
    /// Variance-preserving with the standard linear-\(\beta\) schedule.
    VariancePreserving { beta_min: f32, beta_max: f32 },
}

impl Sde {
    /// VE schedule. Requires `0 < sigma_min < sigma_max`, both finite.
    pub fn variance_exploding(sigma_min: f32, sigma_max: f32) -> Result<Self> {
        if !sigma_min.is_finite() || !sigma_max.is_finite() {
            return Err(Error::Domain("sigma_min and sigma_max must be finite"));
        }
        if !(sigma_min > 0.0) || !(sigma_max > sigma_min) {
            return Err(Error::Domain("need 0 < sigma_min < sigma_max"));
        }
        Ok(Self::VarianceExploding {
            sigma_min,
            sigma_max,
        })
    }

    /// VP schedule. Requires `0 <= beta_min < beta_max`, both finite.
    ///
    /// `beta_min = 0` is allowed: the integrated schedule
    /// \(B(t) = \beta_{min} t + (\beta_{max}-\beta_{min}) t^2/2\) is still
    /// strictly positive for every `t > 0`.
    pub fn variance_preserving(beta_min: f32, beta_max: f32) -> Result<Self> {
        if !beta_min.is_finite() || !beta_max.is_finite() {
            return Err(Error::Domain("beta_min and beta_max must be finite"));
        }
        if !(beta_min >= 0.0) || !(beta_max > beta_min) {
            return Err(Error::Domain("need 0 <= beta_min < beta_max"));
        }
        Ok(Self::VariancePreserving { beta_min, beta_max })
    }

    /// Build a schedule from its configuration block.
    ///
    /// An unrecognized `kind` is a fatal [`Error::UnsupportedScheduleKind`].
    pub fn from_config(cfg: &ScheduleConfig) -> Result<Self> {
        match cfg.kind.to_ascii_lowercase().as_str() {
            "vesde" => Self::variance_exploding(cfg.sigma_min, cfg.sigma_max),
            "vpsde" => Self::variance_preserving(cfg.beta_min, cfg.beta_max),
            _ => Err(Error::UnsupportedScheduleKind(cfg.kind.clone())),
        }
    }

    /// Standard deviation of the noisy marginal at time `t`.
    ///
    /// Strictly positive and strictly increasing for `t ∈ (0, 1]` under the
    /// constructor invariants.
    pub fn marginal_prob_std(&self, t: f32) -> f32 {
        match *self {
            Sde::VarianceExploding {
                sigma_min,
                sigma_max,
            } => sigma_min * (sigma_max / sigma_min).powf(t),
            Sde::VariancePreserving { beta_min, beta_max } => {
                let b = beta_min * t + 0.5 * (beta_max - beta_min) * t * t;
                (1.0 - (-b).exp()).sqrt()
            }
        }
    }

    /// SDE diffusion coefficient \(g(t)\) at time `t` (non-negative).
    pub fn diffusion_coeff(&self, t: f32) -> f32 {
        match *self {
            Sde::VarianceExploding {
                sigma_min,
                sigma_max,
            } => self.marginal_prob_std(t) * (2.0 * (sigma_max / sigma_min).ln()).sqrt(),
            Sde::VariancePreserving { beta_min, beta_max } => {
                (beta_min + t * (beta_max - beta_min)).sqrt()
            }
        }
    }

    /// Elementwise [`Self::marginal_prob_std`] over a batch of times.
    pub fn marginal_prob_std_batch(&self, ts: &ArrayView1<f32>) -> Array1<f32> {
        ts.mapv(|t| self.marginal_prob_std(t))
    }

    /// Elementwise [`Self::diffusion_coeff`] over a batch of times.
    pub fn diffusion_coeff_batch(&self, ts: &ArrayView1<f32>) -> Array1<f32> {
        ts.mapv(|t| self.diffusion_coeff(t))
    }
}

/// Reverse-time grid: `num_steps` evenly spaced times from `1.0` down to `eps`.
///
/// Strictly decreasing, all values strictly positive. Requires
/// `num_steps >= 2` and `0 < eps < 1`.
pub fn time_grid(num_steps: usize, eps: f32) -> Result<Array1<f32>> {
    if num_steps < 2 {
        return Err(Error::Domain("num_steps must be >= 2"));
    }
    if !eps.is_finite() || !(eps > 0.0) || !(eps < 1.0) {
        return Err(Error::Domain("eps must lie in (0, 1)"));
    }
    let n = num_steps;
    let mut grid = Array1::<f32>::zeros(n);
    for i in 0..n {
        let frac = i as f32 / (n - 1) as f32;
        grid[i] = 1.0 + frac * (eps - 1.0);
    }
    // Pin the endpoints exactly; float accumulation must not push the last
    // grid point below eps.
    grid[0] = 1.0;
    grid[n - 1] = eps;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unknown_kind_is_fatal() {
        let cfg = ScheduleConfig {
            kind: "cosine".into(),
            sigma_min: default_sigma_min(),
            sigma_max: default_sigma_max(),
            beta_min: default_beta_min(),
            beta_max: default_beta_max(),
        };
        assert!(matches!(
            Sde::from_config(&cfg),
            Err(Error::UnsupportedScheduleKind(_))
        ));
    }

    #[test]
    fn kind_is_case_insensitive() {
        let cfg = ScheduleConfig {
            kind: "VESDE".into(),
            sigma_min: 0.01,
            sigma_max: 50.0,
            beta_min: 0.1,
            beta_max: 20.0,
        };
        assert!(matches!(
            Sde::from_config(&cfg),
            Ok(Sde::VarianceExploding { .. })
        ));
    }

    #[test]
    fn degenerate_hyperparameters_are_rejected() {
        assert!(Sde::variance_exploding(0.0, 50.0).is_err());
        assert!(Sde::variance_exploding(1.0, 1.0).is_err());
        assert!(Sde::variance_exploding(0.01, f32::NAN).is_err());
        assert!(Sde::variance_preserving(-0.1, 20.0).is_err());
        assert!(Sde::variance_preserving(20.0, 0.1).is_err());
    }

    #[test]
    fn ve_matches_closed_form_at_endpoints() {
        let sde = Sde::variance_exploding(0.01, 50.0).unwrap();
        assert!((sde.marginal_prob_std(0.0) - 0.01).abs() < 1e-7);
        assert!((sde.marginal_prob_std(1.0) - 50.0).abs() < 1e-3);
    }

    #[test]
    fn grid_is_strictly_decreasing_and_positive() {
        let grid = time_grid(100, 1e-3).unwrap();
        assert_eq!(grid.len(), 100);
        assert_eq!(grid[0], 1.0);
        assert_eq!(grid[99], 1e-3);
        for i in 1..grid.len() {
            assert!(grid[i] < grid[i - 1]);
            assert!(grid[i] > 0.0);
        }
    }

    #[test]
    fn grid_rejects_degenerate_inputs() {
        assert!(time_grid(1, 1e-3).is_err());
        assert!(time_grid(10, 0.0).is_err());
        assert!(time_grid(10, 1.0).is_err());
        assert!(time_grid(10, f32::NAN).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_std_strictly_increasing_both_schedules(
            a in 1e-4f32..1.0f32,
            b in 1e-4f32..1.0f32,
        ) {
            prop_assume!(a != b);
            let (t1, t2) = if a < b { (a, b) } else { (b, a) };

            let ve = Sde::variance_exploding(0.01, 50.0).unwrap();
            let vp = Sde::variance_preserving(0.1, 20.0).unwrap();

            for sde in [ve, vp] {
                let s1 = sde.marginal_prob_std(t1);
                let s2 = sde.marginal_prob_std(t2);
                prop_assert!(s1 > 0.0, "std must be strictly positive: {s1}");
                prop_assert!(s1 < s2, "std must increase: std({t1})={s1} std({t2})={s2}");
                prop_assert!(sde.diffusion_coeff(t1) >= 0.0);
            }
        }
    }

    proptest! {
        #[test]
        fn prop_batch_eval_matches_scalar(
            n in 1usize..32,
            seed in any::<u64>(),
        ) {
            use rand::{Rng, SeedableRng};
            use rand_chacha::ChaCha8Rng;

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let ts = Array1::from_shape_fn(n, |_| rng.random_range(1e-3f32..1.0));

            let sde = Sde::variance_exploding(0.01, 50.0).unwrap();
            let stds = sde.marginal_prob_std_batch(&ts.view());
            let gs = sde.diffusion_coeff_batch(&ts.view());
            for i in 0..n {
                prop_assert_eq!(stds[i], sde.marginal_prob_std(ts[i]));
                prop_assert_eq!(gs[i], sde.diffusion_coeff(ts[i]));
            }
        }
    }
}
