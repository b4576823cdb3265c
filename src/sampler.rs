//! The sampler orchestrator: configuration surface + reverse-time loop.
//!
//! A [`Sampler`] is assembled once from explicit strategy values (predictor,
//! optional corrector, schedule, grid) and then drives
//! `Init → {Predict → [Correct] → Checkpoint?} × N → Done`. The returned
//! reconstruction is the final `x_mean`, not the noisy `x`, because the
//! deterministic component of the last update has lower variance.
//!
//! [`RunConfig`] is the serde-facing surface; [`standard_sampler`] turns a
//! config plus capabilities into a ready-to-run sampler the same way for
//! every recognized method name.

use crate::corrector::Corrector;
use crate::datafit::MeasurementNorm;
use crate::init::chain_init;
use crate::operator::{image_len, ForwardOperator};
use crate::predictor::Predictor;
use crate::score::ScoreModel;
use crate::sde::{time_grid, ScheduleConfig, Sde};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Corrector block of a run configuration; its presence enables correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectorConfig {
    #[serde(default = "default_corrector_steps")]
    pub steps: usize,
    #[serde(default = "default_snr")]
    pub snr: f32,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            steps: default_corrector_steps(),
            snr: default_snr(),
        }
    }
}

fn default_corrector_steps() -> usize {
    5
}
fn default_snr() -> f32 {
    0.16
}

/// Full run configuration (the persisted artifact alongside a run's outputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub schedule: ScheduleConfig,
    /// `"naive"` (plain), `"dps"` (measurement-guided via Tweedie) or
    /// `"dds"` (decomposed consistency). Anything else is fatal.
    pub method: String,
    pub num_steps: usize,
    #[serde(default = "default_eps")]
    pub eps: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fraction of the chain to skip via warm-started initialization
    /// (start index = `ceil(pct * num_steps)`).
    #[serde(default)]
    pub pct_chain_elapsed: f32,
    #[serde(default = "default_penalty")]
    pub penalty: f32,
    #[serde(default = "default_datafit_scale")]
    pub datafit_scale: f32,
    /// DDIM stochasticity control for the decomposed method.
    #[serde(default = "default_eta")]
    pub eta: f32,
    /// Regularization weight of the data-consistency solve.
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    #[serde(default = "default_cg_max_iter")]
    pub cg_max_iter: usize,
    #[serde(default = "default_cg_tol")]
    pub cg_tol: f32,
    #[serde(default)]
    pub corrector: Option<CorrectorConfig>,
    /// Record a trajectory checkpoint every this many grid steps (0 = never).
    #[serde(default)]
    pub checkpoint_every: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_eps() -> f32 {
    1e-3
}
fn default_batch_size() -> usize {
    1
}
fn default_penalty() -> f32 {
    1.0
}
fn default_datafit_scale() -> f32 {
    1.0
}
fn default_eta() -> f32 {
    0.85
}
fn default_gamma() -> f32 {
    0.01
}
fn default_cg_max_iter() -> usize {
    5
}
fn default_cg_tol() -> f32 {
    1e-4
}

impl RunConfig {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Sampling method, parsed once from its configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMethod {
    /// Euler–Maruyama with a soft data-fit gradient at the current state.
    Plain,
    /// Euler–Maruyama with Tweedie-denoised guidance (diffusion posterior
    /// sampling).
    MeasurementGuided,
    /// Hard data consistency via the decomposed CG predictor.
    DecomposedConsistency,
}

impl SamplingMethod {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "naive" => Ok(Self::Plain),
            "dps" => Ok(Self::MeasurementGuided),
            "dds" => Ok(Self::DecomposedConsistency),
            _ => Err(Error::UnsupportedMethod(name.to_string())),
        }
    }
}

/// Diagnostic snapshot of the trajectory; never affects the result.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Grid index the snapshot was taken at.
    pub step: usize,
    pub t: f32,
    pub x: Array2<f32>,
    pub x_mean: Array2<f32>,
}

/// Result of one sampling run.
#[derive(Debug, Clone)]
pub struct SampleOutput {
    /// Final `x_mean` at the last grid point.
    pub reconstruction: Array2<f32>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Assembles a [`Sampler`] from explicit strategy values.
pub struct SamplerBuilder<'a, S: ScoreModel + ?Sized> {
    score: &'a S,
    sde: Sde,
    predictor: Predictor<'a>,
    corrector: Option<Corrector<'a>>,
    state_len: usize,
    num_steps: usize,
    eps: f32,
    batch_size: usize,
    start_index: usize,
    prior: Option<Array2<f32>>,
    checkpoint_every: usize,
}

impl<'a, S: ScoreModel + ?Sized> SamplerBuilder<'a, S> {
    pub fn new(score: &'a S, sde: Sde, predictor: Predictor<'a>, state_len: usize) -> Self {
        Self {
            score,
            sde,
            predictor,
            corrector: None,
            state_len,
            num_steps: 1000,
            eps: default_eps(),
            batch_size: default_batch_size(),
            start_index: 0,
            prior: None,
            checkpoint_every: 0,
        }
    }

    pub fn num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn corrector(mut self, corrector: Corrector<'a>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    /// Start the chain at `start_index` instead of the noisiest grid point.
    pub fn start_index(mut self, start_index: usize) -> Self {
        self.start_index = start_index;
        self
    }

    /// Prior reconstruction for warm-started initialization, `(1, d)` or
    /// `(batch_size, d)`.
    pub fn prior(mut self, prior: Array2<f32>) -> Self {
        self.prior = Some(prior);
        self
    }

    pub fn checkpoint_every(mut self, checkpoint_every: usize) -> Self {
        self.checkpoint_every = checkpoint_every;
        self
    }

    pub fn build(self) -> Result<Sampler<'a, S>> {
        self.predictor.validate()?;
        if let Some(c) = &self.corrector {
            c.validate()?;
        }
        if self.state_len == 0 {
            return Err(Error::Shape("state length must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        let grid = time_grid(self.num_steps, self.eps)?;
        if self.start_index >= self.num_steps {
            return Err(Error::Domain("start_index must lie inside the time grid"));
        }
        if self.start_index > 0 && self.prior.is_none() {
            return Err(Error::Contract(
                "starting mid-chain requires a prior reconstruction",
            ));
        }
        if let Some(p) = &self.prior {
            if p.ncols() != self.state_len {
                return Err(Error::Shape("prior width must equal the state length"));
            }
            if p.nrows() != 1 && p.nrows() != self.batch_size {
                return Err(Error::Shape("prior batch must be 1 or batch_size"));
            }
        }

        Ok(Sampler {
            score: self.score,
            sde: self.sde,
            predictor: self.predictor,
            corrector: self.corrector,
            grid,
            start_index: self.start_index,
            batch_size: self.batch_size,
            state_len: self.state_len,
            prior: self.prior,
            checkpoint_every: self.checkpoint_every,
        })
    }
}

/// The reverse-time orchestrator. Owns the grid and the evolving state for
/// the duration of [`Self::sample`].
pub struct Sampler<'a, S: ScoreModel + ?Sized> {
    score: &'a S,
    sde: Sde,
    predictor: Predictor<'a>,
    corrector: Option<Corrector<'a>>,
    grid: Array1<f32>,
    start_index: usize,
    batch_size: usize,
    state_len: usize,
    prior: Option<Array2<f32>>,
    checkpoint_every: usize,
}

impl<S: ScoreModel + ?Sized> Sampler<'_, S> {
    pub fn time_grid(&self) -> &Array1<f32> {
        &self.grid
    }

    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// Run the full reverse-time loop.
    pub fn sample(&self, rng: &mut impl rand::Rng) -> Result<SampleOutput> {
        let n = self.grid.len();
        let step_size = self.grid[0] - self.grid[1];

        let mut x = match (&self.prior, self.start_index) {
            (Some(prior), start) if start > 0 => chain_init(
                &self.grid.view(),
                &self.sde,
                &prior.view(),
                start,
                self.batch_size,
                rng,
            )?,
            _ => {
                let std = self.sde.marginal_prob_std(self.grid[0]);
                crate::standard_normal(self.batch_size, self.state_len, rng) * std
            }
        };
        let mut x_mean = x.clone();

        debug!(
            steps = n - self.start_index,
            batch = self.batch_size,
            state_len = self.state_len,
            "sampling run started"
        );

        let mut checkpoints = Vec::new();
        for i in self.start_index..n {
            let t = self.grid[i];
            let (next, mean) = self
                .predictor
                .step(self.score, &self.sde, &x.view(), t, step_size, rng)?;
            x = next;
            x_mean = mean;

            if let Some(corrector) = &self.corrector {
                x = corrector.correct(self.score, &x.view(), t, rng)?;
            }

            if self.checkpoint_every > 0 && i % self.checkpoint_every == 0 {
                checkpoints.push(Checkpoint {
                    step: i,
                    t,
                    x: x.clone(),
                    x_mean: x_mean.clone(),
                });
            }
            trace!(step = i, t, "grid step done");
        }

        debug!(checkpoints = checkpoints.len(), "sampling run finished");
        Ok(SampleOutput {
            reconstruction: x_mean,
            checkpoints,
        })
    }
}

/// Maps the elapsed-chain fraction to a grid start index,
/// `ceil(pct * num_steps)` on the exact value.
///
/// The product is formed in f64 and snapped to the nearest integer when the
/// deviation is within f32 representation error of `pct`, so exact multiples
/// like `0.6 * 50` do not spill over to the next index. The result is kept
/// strictly inside the grid.
fn chain_start_index(pct: f32, num_steps: usize) -> usize {
    let product = f64::from(pct) * num_steps as f64;
    let nearest = product.round();
    let tol = f64::from(f32::EPSILON) * num_steps as f64;
    let index = if (product - nearest).abs() <= tol {
        nearest as usize
    } else {
        product.ceil() as usize
    };
    index.min(num_steps.saturating_sub(1))
}

/// Wire a [`Sampler`] from a [`RunConfig`] and the run's capabilities, the
/// same way for every recognized method.
///
/// All three methods reconstruct against `observation` through `operator`;
/// `prior_reconstruction` is required whenever `pct_chain_elapsed > 0`.
pub fn standard_sampler<'a, S: ScoreModel + ?Sized>(
    cfg: &RunConfig,
    score: &'a S,
    operator: &'a dyn ForwardOperator,
    observation: &ArrayView2<f32>,
    prior_reconstruction: Option<&ArrayView2<f32>>,
) -> Result<Sampler<'a, S>> {
    let sde = Sde::from_config(&cfg.schedule)?;
    let method = SamplingMethod::from_name(&cfg.method)?;

    if !cfg.pct_chain_elapsed.is_finite()
        || cfg.pct_chain_elapsed < 0.0
        || cfg.pct_chain_elapsed >= 1.0
    {
        return Err(Error::Domain("pct_chain_elapsed must lie in [0, 1)"));
    }
    if observation.nrows() != cfg.batch_size {
        return Err(Error::Shape("observation batch must equal batch_size"));
    }

    let state_len = image_len(operator);
    let predictor = match method {
        SamplingMethod::Plain | SamplingMethod::MeasurementGuided => Predictor::EulerMaruyama {
            data_fit: Some(Box::new(MeasurementNorm::new(
                operator,
                observation.to_owned(),
            )?)),
            penalty: Some(cfg.penalty),
            datafit_scale: Some(cfg.datafit_scale),
            use_tweedy_denoising: method == SamplingMethod::MeasurementGuided,
        },
        SamplingMethod::DecomposedConsistency => Predictor::Decomposed {
            operator,
            observation: observation.to_owned(),
            eta: cfg.eta,
            gamma: cfg.gamma,
            cg_max_iter: cfg.cg_max_iter,
            cg_tol: cfg.cg_tol,
        },
    };

    let corrector = match &cfg.corrector {
        Some(cc) => Some(Corrector {
            data_fit: Some(Box::new(MeasurementNorm::new(
                operator,
                observation.to_owned(),
            )?)),
            penalty: Some(cfg.penalty),
            datafit_scale: Some(cfg.datafit_scale),
            steps: cc.steps,
            snr: cc.snr,
        }),
        None => None,
    };

    let start_index = chain_start_index(cfg.pct_chain_elapsed, cfg.num_steps);

    let mut builder = SamplerBuilder::new(score, sde, predictor, state_len)
        .num_steps(cfg.num_steps)
        .eps(cfg.eps)
        .batch_size(cfg.batch_size)
        .start_index(start_index)
        .checkpoint_every(cfg.checkpoint_every);
    if let Some(c) = corrector {
        builder = builder.corrector(c);
    }
    if let Some(p) = prior_reconstruction {
        builder = builder.prior(p.to_owned());
    }
    builder.build()
}
