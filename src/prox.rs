//! Proximal operators applied to whole factors after each gradient step.

use ndarray::{Array2, ArrayViewMut1};

use crate::cone::{ConeProjector, TieBreak};
use crate::error::{require_odd, DeblendError};
use crate::operators::{distance_order, radial_references, MonotonicNeighbors, OperatorFactory};

/// Proximal operator of a factor constraint, `apply(x, step)`.
///
/// The chained variants enforce their own constraint on the seeking rows
/// first and then run `chain` on the whole factor, so the chained
/// constraint (positivity, sparsity) holds exactly on the result.
#[derive(Debug, Clone, Default)]
pub enum Prox {
    #[default]
    Identity,
    /// `max(0, x)`.
    Plus,
    /// Euclidean projection of every column onto the unit simplex.
    UnityPlus,
    /// L0 sparsity: zero every entry below `thresh`, then clip at zero.
    Hard { thresh: f64 },
    /// L1 sparsity with positivity: `max(0, x - thresh * step)`.
    SoftPlus { thresh: f64 },
    /// Maps everything to zero.
    Zero,
    /// Exact projection of seeking rows onto the monotonic cone.
    Cone {
        projector: ConeProjector,
        seeks: Vec<bool>,
        chain: Box<Prox>,
    },
    /// Pixel-by-pixel monotonic enforcement along ascending distance.
    Monotonic {
        seeks: Vec<bool>,
        order: Vec<usize>,
        reference: Vec<Option<usize>>,
        thresh: f64,
        chain: Box<Prox>,
    },
}

impl Prox {
    pub fn apply(&self, mut x: Array2<f64>, step: f64) -> Array2<f64> {
        match self {
            Self::Identity => x,
            Self::Plus => {
                x.mapv_inplace(|v| v.max(0.0));
                x
            }
            Self::UnityPlus => {
                for column in x.columns_mut() {
                    project_simplex(column);
                }
                x
            }
            Self::Hard { thresh } => {
                let thresh = *thresh;
                x.mapv_inplace(|v| if v < thresh { 0.0 } else { v.max(0.0) });
                x
            }
            Self::SoftPlus { thresh } => {
                let shift = thresh * step;
                x.mapv_inplace(|v| (v - shift).max(0.0));
                x
            }
            Self::Zero => {
                x.fill(0.0);
                x
            }
            Self::Cone {
                projector,
                seeks,
                chain,
            } => chain.apply(projector.project_rows(x, Some(seeks)), step),
            Self::Monotonic {
                seeks,
                order,
                reference,
                thresh,
                chain,
            } => {
                for (k, mut row) in x.rows_mut().into_iter().enumerate() {
                    if !seeks.get(k).copied().unwrap_or(false) {
                        continue;
                    }
                    for &i in order {
                        if let Some(r) = reference[i] {
                            let limit = row[r] + thresh;
                            if row[i] > limit {
                                row[i] = limit;
                            }
                        }
                    }
                }
                chain.apply(x, step)
            }
        }
    }
}

/// Pixelwise monotonic enforcement for a `(rows, cols)` morphology.
pub fn build_prox_monotonic(
    shape: (usize, usize),
    seeks: Vec<bool>,
    chain: Prox,
    thresh: f64,
) -> Result<Prox, DeblendError> {
    require_odd(shape)?;
    Ok(Prox::Monotonic {
        seeks,
        order: distance_order(shape),
        reference: radial_references(shape),
        thresh,
        chain: Box::new(chain),
    })
}

/// Exact cone projection onto the radial monotonic constraints of `shape`.
pub fn build_prox_cone(
    shape: (usize, usize),
    seeks: Vec<bool>,
    chain: Prox,
    neighbors: MonotonicNeighbors,
    tie_break: TieBreak,
    factory: &impl OperatorFactory,
) -> Result<Prox, DeblendError> {
    require_odd(shape)?;
    let g = factory.radial_monotonic(shape, neighbors)?;
    Ok(Prox::Cone {
        projector: ConeProjector::new(&g, tie_break),
        seeks,
        chain: Box::new(chain),
    })
}

/// Projects `v` onto `{x >= 0, sum(x) = 1}` (Duchi et al. 2008).
fn project_simplex(mut v: ArrayViewMut1<'_, f64>) {
    if v.is_empty() {
        return;
    }
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (j, u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.mapv_inplace(|x| (x - theta).max(0.0));
}
