//! The forward-operator capability and a synthetic sparse-view transform.
//!
//! The engine never looks inside the operator: it needs `apply`, `adjoint`,
//! a direct baseline reconstruction, and the image shape. Production ray
//! transforms live outside this crate; [`SparseViewTransform`] is a small
//! parallel-beam stand-in used by the tests and demos.

use crate::cg::conjugate_gradient;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2, Axis};

/// An imaging forward operator `A` acting row-wise on batched states.
///
/// Shape contract: images are `(batch, h*w)` with `(h, w) = im_shape()`,
/// measurements are `(batch, measurement_len())`. Implementations must be
/// referentially transparent; the sampler invokes them repeatedly.
pub trait ForwardOperator {
    fn im_shape(&self) -> (usize, usize);
    fn measurement_len(&self) -> usize;
    /// `A x`: project images into measurement space.
    fn apply(&self, x: &ArrayView2<f32>) -> Array2<f32>;
    /// `Aᵗ y`: back-project measurements into image space.
    fn adjoint(&self, y: &ArrayView2<f32>) -> Array2<f32>;
    /// Non-learned baseline reconstruction from a measurement, used both as
    /// chain initialization and as the comparison baseline.
    fn filtered_direct_reconstruction(&self, y: &ArrayView2<f32>) -> Array2<f32>;
}

/// Flattened pixel count for an operator's image shape.
pub fn image_len(op: &(impl ForwardOperator + ?Sized)) -> usize {
    let (h, w) = op.im_shape();
    h * w
}

/// Parallel-beam sparse-view transform on a square-ish pixel grid.
///
/// Rays at `num_angles` uniformly spaced angles in `[0, π)`; each pixel is
/// splatted onto the detector with linear interpolation, which makes the
/// assembled matrix and its transpose an exact adjoint pair.
///
/// The baseline reconstruction is a Tikhonov least-squares solve
/// \((AᵗA + \delta I) x = Aᵗ y\) run through the crate's own CG, with
/// \(\delta\) chosen relative to the operator's diagonal scale.
#[derive(Debug, Clone)]
pub struct SparseViewTransform {
    im_shape: (usize, usize),
    det_count: usize,
    num_angles: usize,
    /// Dense system matrix, `(num_angles * det_count, h * w)`.
    matrix: Array2<f32>,
    /// Absolute Tikhonov weight for the baseline reconstruction.
    reg: f32,
}

impl SparseViewTransform {
    pub fn new(im_shape: (usize, usize), num_angles: usize) -> Result<Self> {
        let (h, w) = im_shape;
        if h == 0 || w == 0 {
            return Err(Error::Domain("image shape must be non-empty"));
        }
        if num_angles == 0 {
            return Err(Error::Domain("num_angles must be >= 1"));
        }

        let d = h * w;
        let det_count = (((h * h + w * w) as f32).sqrt().ceil() as usize) + 1;
        let m = num_angles * det_count;
        let mut matrix = Array2::<f32>::zeros((m, d));

        let det_center = (det_count - 1) as f32 / 2.0;
        for a in 0..num_angles {
            let theta = a as f32 * core::f32::consts::PI / num_angles as f32;
            let (sin_t, cos_t) = theta.sin_cos();
            for r in 0..h {
                for c in 0..w {
                    let u = c as f32 - (w - 1) as f32 / 2.0;
                    let v = r as f32 - (h - 1) as f32 / 2.0;
                    let s = u * cos_t + v * sin_t + det_center;
                    let lo = s.floor();
                    let frac = s - lo;
                    let lo = lo as isize;
                    let pix = r * w + c;
                    if lo >= 0 && (lo as usize) < det_count {
                        matrix[[a * det_count + lo as usize, pix]] += 1.0 - frac;
                    }
                    if lo + 1 >= 0 && ((lo + 1) as usize) < det_count {
                        matrix[[a * det_count + (lo + 1) as usize, pix]] += frac;
                    }
                }
            }
        }

        // trace(AᵗA) / d sets the natural diagonal scale for δ.
        let diag_scale = matrix.iter().map(|&v| v * v).sum::<f32>() / d as f32;
        let reg = 1e-3 * diag_scale.max(f32::MIN_POSITIVE);

        Ok(Self {
            im_shape,
            det_count,
            num_angles,
            matrix,
            reg,
        })
    }

    pub fn num_angles(&self) -> usize {
        self.num_angles
    }

    pub fn det_count(&self) -> usize {
        self.det_count
    }
}

impl ForwardOperator for SparseViewTransform {
    fn im_shape(&self) -> (usize, usize) {
        self.im_shape
    }

    fn measurement_len(&self) -> usize {
        self.num_angles * self.det_count
    }

    fn apply(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(x.ncols(), self.matrix.ncols());
        x.dot(&self.matrix.t())
    }

    fn adjoint(&self, y: &ArrayView2<f32>) -> Array2<f32> {
        debug_assert_eq!(y.ncols(), self.matrix.nrows());
        y.dot(&self.matrix)
    }

    fn filtered_direct_reconstruction(&self, y: &ArrayView2<f32>) -> Array2<f32> {
        let d = self.matrix.ncols();
        let aty = self.adjoint(y);
        let mut out = Array2::<f32>::zeros((y.nrows(), d));

        let matvec = |v: &ndarray::ArrayView1<f32>| {
            let v2 = v.to_owned().insert_axis(Axis(0));
            let av = self.apply(&v2.view());
            let atav = self.adjoint(&av.view());
            let mut r = atav.index_axis_move(Axis(0), 0);
            r.scaled_add(self.reg, v);
            r
        };

        for i in 0..y.nrows() {
            let rhs = aty.row(i);
            let x0 = ndarray::Array1::<f32>::zeros(d);
            // The solve is internal plumbing over validated shapes; CG input
            // errors cannot occur here, and partial convergence is fine.
            let (xi, _summary) =
                conjugate_gradient(matvec, &rhs, &x0.view(), 150, 1e-4).unwrap_or_else(|_| {
                    (
                        ndarray::Array1::zeros(d),
                        crate::cg::CgSummary {
                            iterations: 0,
                            residual_norm: f32::INFINITY,
                            converged: false,
                        },
                    )
                });
            out.row_mut(i).assign(&xi);
        }
        out
    }
}

/// Simulate a measurement `y = A x (+ white noise)`.
///
/// `rel_stddev` scales the noise relative to the mean absolute value of the
/// clean measurement (0 disables noise).
pub fn simulate(
    x: &ArrayView2<f32>,
    operator: &(impl ForwardOperator + ?Sized),
    rel_stddev: f32,
    rng: &mut impl rand::Rng,
) -> Result<Array2<f32>> {
    if x.ncols() != image_len(operator) {
        return Err(Error::Shape("state width must equal h*w of the operator"));
    }
    if !rel_stddev.is_finite() || rel_stddev < 0.0 {
        return Err(Error::Domain("rel_stddev must be finite and >= 0"));
    }

    let mut y = operator.apply(x);
    if rel_stddev > 0.0 {
        let mean_abs = y.iter().map(|v| v.abs()).sum::<f32>() / y.len() as f32;
        let noise = crate::standard_normal(y.nrows(), y.ncols(), rng);
        y.scaled_add(rel_stddev * mean_abs, &noise);
    }
    Ok(y)
}
