//! Warm-started chain initialization.
//!
//! Starting the reverse-time chain at an intermediate grid index requires an
//! initial state whose noise level matches the marginal at that time. Adding
//! schedule-scaled noise to a prior reconstruction (e.g. the operator's direct
//! baseline) shortens the chain at the cost of sample diversity.

use crate::sde::Sde;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};

/// `prior + noise * sigma(t_start)`, with the prior broadcast across the batch.
///
/// `prior` is `(1, d)` (broadcast) or `(batch_size, d)`. `start_index` must
/// lie inside the grid.
pub fn chain_init(
    time_grid: &ArrayView1<f32>,
    sde: &Sde,
    prior: &ArrayView2<f32>,
    start_index: usize,
    batch_size: usize,
    rng: &mut impl rand::Rng,
) -> Result<Array2<f32>> {
    if start_index >= time_grid.len() {
        return Err(Error::Domain("start_index must lie inside the time grid"));
    }
    if batch_size == 0 {
        return Err(Error::Domain("batch_size must be >= 1"));
    }
    if prior.ncols() == 0 {
        return Err(Error::Shape("prior must be non-empty"));
    }
    if prior.nrows() != 1 && prior.nrows() != batch_size {
        return Err(Error::Shape("prior batch must be 1 or batch_size"));
    }

    let d = prior.ncols();
    let std = sde.marginal_prob_std(time_grid[start_index]);

    let mut x = crate::standard_normal(batch_size, d, rng) * std;
    for i in 0..batch_size {
        let p = prior.row(if prior.nrows() == 1 { 0 } else { i });
        let mut row = x.row_mut(i);
        row += &p;
    }
    Ok(x)
}
