//! Predictor strategies: one-step reverse-time updates.
//!
//! Every predictor maps `(x, t)` to `(x_next, x_mean)`. `x_mean` is the
//! deterministic (noise-free) component of the update; it has lower variance
//! than `x_next` and is what the orchestrator reports as the final
//! reconstruction.
//!
//! Strategy selection happens once at construction (the [`Predictor`] enum is
//! built by the sampler wiring, never re-dispatched from strings per step).

use crate::cg::conjugate_gradient;
use crate::datafit::DataFit;
use crate::operator::ForwardOperator;
use crate::score::ScoreModel;
use crate::sde::Sde;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::trace;

/// A one-step reverse-time update rule with its bound parameters.
pub enum Predictor<'a> {
    /// Euler–Maruyama reverse diffusion, optionally steered by a data-fit
    /// gradient.
    ///
    /// With `use_tweedy_denoising` the data-fit is evaluated at the one-step
    /// Tweedie denoised estimate \(\hat x_0 = x + s\,\sigma(t)^2\) and
    /// `datafit_scale` is overridden by the reciprocal of the current loss,
    /// adapting the correction to the residual magnitude (diffusion
    /// posterior sampling).
    EulerMaruyama {
        data_fit: Option<Box<dyn DataFit + 'a>>,
        penalty: Option<f32>,
        datafit_scale: Option<f32>,
        use_tweedy_denoising: bool,
    },
    /// Decomposed data-consistency step: Tweedie denoising, a CG solve of
    /// \((I + \gamma AᵗA)\hat x = \hat x_0 + \gamma Aᵗ y\), then DDIM-style
    /// deterministic + stochastic recombination controlled by `eta ∈ [0,1]`.
    Decomposed {
        operator: &'a dyn ForwardOperator,
        observation: Array2<f32>,
        eta: f32,
        gamma: f32,
        cg_max_iter: usize,
        cg_tol: f32,
    },
}

impl Predictor<'_> {
    /// Check the strategy's own parameter contracts (no numeric work).
    pub fn validate(&self) -> Result<()> {
        match self {
            Predictor::EulerMaruyama {
                data_fit,
                penalty,
                datafit_scale,
                ..
            } => {
                if data_fit.is_some() && (penalty.is_none() || datafit_scale.is_none()) {
                    return Err(Error::Contract(
                        "a data-fit function requires both penalty and datafit_scale",
                    ));
                }
                Ok(())
            }
            Predictor::Decomposed {
                operator,
                observation,
                eta,
                gamma,
                cg_max_iter,
                cg_tol,
            } => {
                if observation.ncols() != operator.measurement_len() {
                    return Err(Error::Shape(
                        "observation width must equal the operator measurement length",
                    ));
                }
                if !eta.is_finite() || *eta < 0.0 || *eta > 1.0 {
                    return Err(Error::Domain("eta must lie in [0, 1]"));
                }
                if !gamma.is_finite() || !(*gamma > 0.0) {
                    return Err(Error::Domain("gamma must be positive and finite"));
                }
                if *cg_max_iter == 0 {
                    return Err(Error::Domain("cg_max_iter must be >= 1"));
                }
                if !cg_tol.is_finite() || !(*cg_tol > 0.0) {
                    return Err(Error::Domain("cg_tol must be positive and finite"));
                }
                Ok(())
            }
        }
    }

    /// Advance one reverse-time step: returns `(x_next, x_mean)`.
    pub fn step<S: ScoreModel + ?Sized>(
        &self,
        score: &S,
        sde: &Sde,
        x: &ArrayView2<f32>,
        t: f32,
        step_size: f32,
        rng: &mut impl rand::Rng,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        self.validate()?;
        if x.nrows() == 0 || x.ncols() == 0 {
            return Err(Error::Shape("state must be non-empty"));
        }
        if !t.is_finite() || !(t > 0.0) {
            return Err(Error::Domain("time must be positive and finite"));
        }
        if !step_size.is_finite() || step_size < 0.0 {
            return Err(Error::Domain("step_size must be finite and >= 0"));
        }

        match self {
            Predictor::EulerMaruyama {
                data_fit,
                penalty,
                datafit_scale,
                use_tweedy_denoising,
            } => euler_maruyama_step(
                score,
                sde,
                x,
                t,
                step_size,
                data_fit.as_deref(),
                *penalty,
                *datafit_scale,
                *use_tweedy_denoising,
                rng,
            ),
            Predictor::Decomposed {
                operator,
                observation,
                eta,
                gamma,
                cg_max_iter,
                cg_tol,
            } => decomposed_step(
                score,
                sde,
                x,
                t,
                step_size,
                *operator,
                observation,
                *eta,
                *gamma,
                *cg_max_iter,
                *cg_tol,
                rng,
            ),
        }
    }
}

fn score_at<S: ScoreModel + ?Sized>(
    score: &S,
    x: &ArrayView2<f32>,
    t: f32,
) -> Result<Array2<f32>> {
    let ts = Array1::from_elem(x.nrows(), t);
    let s = score.score(x, &ts.view());
    if s.shape() != x.shape() {
        return Err(Error::Shape("score output must have the shape of the state"));
    }
    Ok(s)
}

#[allow(clippy::too_many_arguments)]
fn euler_maruyama_step<S: ScoreModel + ?Sized>(
    score: &S,
    sde: &Sde,
    x: &ArrayView2<f32>,
    t: f32,
    step_size: f32,
    data_fit: Option<&dyn DataFit>,
    penalty: Option<f32>,
    datafit_scale: Option<f32>,
    use_tweedy_denoising: bool,
    rng: &mut impl rand::Rng,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let s = score_at(score, x, t)?;

    let g = sde.diffusion_coeff(t);
    let eta = g * g * step_size;

    let mut x_mean = x.to_owned();
    x_mean.scaled_add(eta, &s);

    if let Some(fit) = data_fit {
        // validate() guarantees both are present.
        let penalty = penalty.ok_or(Error::Contract("penalty missing"))?;
        let mut scale = datafit_scale.ok_or(Error::Contract("datafit_scale missing"))?;

        let grad = if use_tweedy_denoising {
            let std = sde.marginal_prob_std(t);
            let mut xhat0 = x.to_owned();
            xhat0.scaled_add(std * std, &s);
            let loss = fit.loss(&xhat0.view());
            trace!(t, loss, "tweedie data-fit");
            if loss <= f32::EPSILON {
                // Already consistent; the adaptive 1/loss scale is undefined
                // and the gradient vanishes, so skip the correction.
                None
            } else {
                scale = loss.recip();
                Some(fit.grad(&xhat0.view()))
            }
        } else {
            Some(fit.grad(x))
        };

        if let Some(grad) = grad {
            if grad.shape() != x.shape() {
                return Err(Error::Shape("data-fit gradient must have the shape of the state"));
            }
            // Minus: the data-fit is a negative log-likelihood.
            x_mean.scaled_add(-(penalty * scale * eta), &grad);
        }
    }

    let noise = crate::standard_normal(x.nrows(), x.ncols(), rng);
    let mut x_next = x_mean.clone();
    x_next.scaled_add(eta.sqrt(), &noise);

    Ok((x_next, x_mean))
}

#[allow(clippy::too_many_arguments)]
fn decomposed_step<S: ScoreModel + ?Sized>(
    score: &S,
    sde: &Sde,
    x: &ArrayView2<f32>,
    t: f32,
    step_size: f32,
    operator: &dyn ForwardOperator,
    observation: &Array2<f32>,
    eta: f32,
    gamma: f32,
    cg_max_iter: usize,
    cg_tol: f32,
    rng: &mut impl rand::Rng,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let (h, w) = operator.im_shape();
    if x.ncols() != h * w {
        return Err(Error::Shape("state width must equal h*w of the operator"));
    }
    if observation.nrows() != x.nrows() {
        return Err(Error::Shape("observation batch must match the state batch"));
    }

    let s = score_at(score, x, t)?;
    let std_t = sde.marginal_prob_std(t);

    // Tweedie denoising step.
    let mut xhat0 = x.to_owned();
    xhat0.scaled_add(std_t * std_t, &s);

    // Data consistency: per batch row, solve (I + γ AᵗA) x̂ = x̂0 + γ Aᵗy.
    // The regularization weight γ is the single scaling factor on both sides.
    let aty = operator.adjoint(&observation.view());
    let matvec = |v: &ndarray::ArrayView1<f32>| {
        let v2 = v.to_owned().insert_axis(Axis(0));
        let av = operator.apply(&v2.view());
        let atav = operator.adjoint(&av.view());
        let mut out = v.to_owned();
        out.scaled_add(gamma, &atav.index_axis(Axis(0), 0));
        out
    };

    let mut xhat = Array2::<f32>::zeros(x.raw_dim());
    for i in 0..x.nrows() {
        let mut rhs = xhat0.row(i).to_owned();
        rhs.scaled_add(gamma, &aty.row(i));
        let (xi, summary) =
            conjugate_gradient(matvec, &rhs.view(), &xhat0.row(i), cg_max_iter, cg_tol)?;
        trace!(
            row = i,
            iterations = summary.iterations,
            residual = summary.residual_norm,
            "data-consistency cg"
        );
        xhat.row_mut(i).assign(&xi);
    }

    // DDIM-style recombination toward the previous grid time. The lookback
    // of the final grid step can fall below zero; clamp so both schedules
    // stay defined.
    let std_prev = sde.marginal_prob_std((t - step_size).max(0.0));
    let beta = 1.0 - (std_prev * std_prev) / (std_t * std_t);
    let det_coeff = -std_prev * std_t * (1.0 - beta * beta * eta * eta).max(0.0).sqrt();

    let noise = crate::standard_normal(x.nrows(), x.ncols(), rng);
    let mut x_next = xhat.clone();
    x_next.scaled_add(det_coeff, &s);
    x_next.scaled_add(std_prev * eta * beta, &noise);

    Ok((x_next, xhat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafit::MeasurementNorm;
    use crate::operator::{simulate, SparseViewTransform};
    use crate::score::GaussianScore;
    use ndarray::{Array2, ArrayView1};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn zero_score(x: &ArrayView2<f32>, _ts: &ArrayView1<f32>) -> Array2<f32> {
        Array2::zeros(x.raw_dim())
    }

    #[test]
    fn zero_step_size_leaves_x_mean_unchanged() {
        let sde = Sde::variance_exploding(0.01, 50.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let x = Array2::from_shape_fn((2, 9), |_| rng.random_range(-1.0f32..1.0));

        let predictor = Predictor::EulerMaruyama {
            data_fit: None,
            penalty: None,
            datafit_scale: None,
            use_tweedy_denoising: false,
        };
        let oracle = |x: &ArrayView2<f32>, _ts: &ArrayView1<f32>| -> Array2<f32> { x.to_owned() };
        let (x_next, x_mean) = predictor
            .step(&oracle, &sde, &x.view(), 0.5, 0.0, &mut rng)
            .unwrap();

        // eta = g² * 0 = 0: no drift, and the injected noise has zero scale.
        assert_eq!(x_mean, x);
        assert_eq!(x_next, x_mean);
    }

    #[test]
    fn data_fit_without_penalty_is_a_contract_violation() {
        let op = SparseViewTransform::new((4, 4), 3).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let truth = Array2::<f32>::ones((1, 16));
        let y = simulate(&truth.view(), &op, 0.0, &mut rng).unwrap();
        let fit = MeasurementNorm::new(&op, y).unwrap();

        let predictor = Predictor::EulerMaruyama {
            data_fit: Some(Box::new(fit)),
            penalty: None,
            datafit_scale: Some(1.0),
            use_tweedy_denoising: false,
        };
        assert!(matches!(predictor.validate(), Err(Error::Contract(_))));

        let sde = Sde::variance_exploding(0.01, 50.0).unwrap();
        let x = Array2::<f32>::zeros((1, 16));
        assert!(matches!(
            predictor.step(&zero_score, &sde, &x.view(), 0.5, 0.01, &mut rng),
            Err(Error::Contract(_))
        ));
    }

    #[test]
    fn guided_mean_moves_toward_measurement_consistency() {
        let op = SparseViewTransform::new((6, 6), 5).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let truth = Array2::from_shape_fn((1, 36), |_| rng.random_range(0.0f32..1.0));
        let y = simulate(&truth.view(), &op, 0.0, &mut rng).unwrap();

        let fit = MeasurementNorm::new(&op, y.clone()).unwrap();
        let probe = MeasurementNorm::new(&op, y).unwrap();

        let predictor = Predictor::EulerMaruyama {
            data_fit: Some(Box::new(fit)),
            penalty: Some(5.0),
            datafit_scale: Some(1.0),
            use_tweedy_denoising: false,
        };
        let sde = Sde::variance_exploding(0.01, 10.0).unwrap();

        let x = Array2::<f32>::zeros((1, 36));
        let before = probe.loss(&x.view());
        let (_x_next, x_mean) = predictor
            .step(&zero_score, &sde, &x.view(), 0.3, 0.02, &mut rng)
            .unwrap();
        let after = probe.loss(&x_mean.view());
        assert!(after < before, "misfit should shrink: {before} -> {after}");
    }

    #[test]
    fn decomposed_rejects_bad_parameters() {
        let op = SparseViewTransform::new((4, 4), 3).unwrap();
        let obs = Array2::<f32>::zeros((1, op.measurement_len()));

        let bad_eta = Predictor::Decomposed {
            operator: &op,
            observation: obs.clone(),
            eta: 1.5,
            gamma: 0.01,
            cg_max_iter: 5,
            cg_tol: 1e-4,
        };
        assert!(bad_eta.validate().is_err());

        let bad_gamma = Predictor::Decomposed {
            operator: &op,
            observation: obs.clone(),
            eta: 0.5,
            gamma: 0.0,
            cg_max_iter: 5,
            cg_tol: 1e-4,
        };
        assert!(bad_gamma.validate().is_err());

        let bad_obs = Predictor::Decomposed {
            operator: &op,
            observation: Array2::<f32>::zeros((1, 3)),
            eta: 0.5,
            gamma: 0.01,
            cg_max_iter: 5,
            cg_tol: 1e-4,
        };
        assert!(bad_obs.validate().is_err());
    }

    #[test]
    fn decomposed_with_eta_zero_is_deterministic() {
        let op = SparseViewTransform::new((5, 5), 4).unwrap();
        let sde = Sde::variance_exploding(0.01, 10.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let truth = Array2::from_shape_fn((1, 25), |_| rng.random_range(0.0f32..1.0));
        let y = simulate(&truth.view(), &op, 0.0, &mut rng).unwrap();

        let oracle = GaussianScore {
            mean: truth.clone(),
            base_std: 0.05,
            sde,
        };
        let predictor = Predictor::Decomposed {
            operator: &op,
            observation: y,
            eta: 0.0,
            gamma: 0.1,
            cg_max_iter: 5,
            cg_tol: 1e-5,
        };

        let x = Array2::from_shape_fn((1, 25), |_| rng.random_range(-1.0f32..1.0));
        let mut r1 = ChaCha8Rng::seed_from_u64(100);
        let mut r2 = ChaCha8Rng::seed_from_u64(200);
        let (a_next, a_mean) = predictor
            .step(&oracle, &sde, &x.view(), 0.5, 0.01, &mut r1)
            .unwrap();
        let (b_next, b_mean) = predictor
            .step(&oracle, &sde, &x.view(), 0.5, 0.01, &mut r2)
            .unwrap();

        // η = 0 removes the stochastic term: different RNG streams agree.
        assert_eq!(a_next, b_next);
        assert_eq!(a_mean, b_mean);
    }

    #[test]
    fn decomposed_mean_is_more_consistent_than_tweedie_alone() {
        let op = SparseViewTransform::new((6, 6), 4).unwrap();
        let sde = Sde::variance_exploding(0.01, 10.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(21);

        let truth = Array2::from_shape_fn((1, 36), |_| rng.random_range(0.0f32..1.0));
        let y = simulate(&truth.view(), &op, 0.0, &mut rng).unwrap();
        let probe = MeasurementNorm::new(&op, y.clone()).unwrap();

        let oracle = GaussianScore {
            mean: truth.clone(),
            base_std: 0.3,
            sde,
        };

        let t = 0.4f32;
        let x = Array2::from_shape_fn((1, 36), |_| rng.random_range(-0.5f32..1.5));

        // Tweedie estimate without the consistency solve.
        let ts = ndarray::Array1::from_elem(1, t);
        let s = oracle.score(&x.view(), &ts.view());
        let std = sde.marginal_prob_std(t);
        let mut tweedie = x.clone();
        tweedie.scaled_add(std * std, &s);

        let predictor = Predictor::Decomposed {
            operator: &op,
            observation: y,
            eta: 0.5,
            gamma: 1.0,
            cg_max_iter: 20,
            cg_tol: 1e-6,
        };
        let (_next, x_mean) = predictor
            .step(&oracle, &sde, &x.view(), t, 0.01, &mut rng)
            .unwrap();

        assert!(
            probe.loss(&x_mean.view()) < probe.loss(&tweedie.view()),
            "CG data-consistency must reduce the misfit"
        );
    }
}
