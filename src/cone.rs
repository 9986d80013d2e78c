//! Projection onto a polyhedral cone `{x : G x >= 0}`.
//!
//! The projection walks from the point toward an interior reference point,
//! picks the half-space whose boundary it crosses, projects everything onto
//! that boundary and repeats in the reduced space until the point is
//! feasible. Every pass removes one half-space, so a row of length `n`
//! needs at most `n` passes.
//!
//! The result always lies in the cone. It is the nearest point of the cone
//! only when every half-space shares one pivot pixel, as on the 3x3
//! nearest-neighbour monotonic cone; on larger grids it can land farther
//! away than the Euclidean projection.

use ndarray::Array2;

use crate::model::contiguous;
use crate::sparse::SparseOp;

/// Relative slack below which a half-space counts as satisfied.
const FEASIBILITY_TOL: f64 = 1e-10;
/// Squared norm below which a (projected) normal is dropped as degenerate.
const DEGENERATE_NORM_SQ: f64 = 1e-20;

/// Which violated half-space is handled first.
///
/// Both choices give a feasible point. `LargestCrossing` reproduces the
/// Euclidean projection on a star-shaped cone (every constraint against
/// the center pixel); `SmallestCrossing` does not, even there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The boundary crossed last on the segment toward the reference point,
    /// i.e. the facet where the segment enters the cone.
    #[default]
    LargestCrossing,
    /// The boundary crossed first on the segment toward the reference point.
    SmallestCrossing,
}

/// Projector onto the cone spanned by the rows of a constraint operator.
#[derive(Debug, Clone)]
pub struct ConeProjector {
    normals: Vec<Vec<f64>>,
    dim: usize,
    tie_break: TieBreak,
}

impl ConeProjector {
    /// Uses every non-zero row of `g` as a half-space normal `g_i . x >= 0`.
    pub fn new(g: &SparseOp, tie_break: TieBreak) -> Self {
        let dim = g.ncols();
        let mut rows = vec![vec![0.0; dim]; g.nrows()];
        for col in 0..dim {
            for (&row, &value) in g.row_indices_of_col(col).iter().zip(g.values_of_col(col)) {
                rows[row][col] += value;
            }
        }
        let normals = rows
            .into_iter()
            .filter(|row| norm_sq(row) > DEGENERATE_NORM_SQ)
            .collect();
        Self {
            normals,
            dim,
            tie_break,
        }
    }

    /// Length of the vectors this projector accepts.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Smallest normalized slack `g_i . x / |g_i|` over all half-spaces.
    pub fn min_slack(&self, x: &[f64]) -> f64 {
        self.normals
            .iter()
            .map(|v| dot(x, v) / norm_sq(v).sqrt())
            .fold(f64::INFINITY, f64::min)
    }

    /// Projects a single vector onto the cone.
    pub fn project(&self, y: &[f64]) -> Vec<f64> {
        debug_assert_eq!(y.len(), self.dim);
        let n = self.dim;
        let mut y = y.to_vec();
        if n == 0 {
            return y;
        }
        let tol = FEASIBILITY_TOL * norm_sq(&y).sqrt().max(1.0);

        // Interior reference: a spike at the central pixel.
        let mut q = vec![0.0; n];
        q[(n - 1) / 2] = n as f64;

        let mut normals = self.normals.clone();
        for _ in 0..n {
            let Some(index) = self.select(&y, &q, &normals, tol) else {
                break;
            };
            let v = normals.swap_remove(index);
            let v_sq = norm_sq(&v);
            project_onto_hyperplane(&mut y, &v, v_sq);
            project_onto_hyperplane(&mut q, &v, v_sq);
            for w in normals.iter_mut() {
                project_onto_hyperplane(w, &v, v_sq);
            }
            normals.retain(|w| norm_sq(w) > DEGENERATE_NORM_SQ);
        }
        y
    }

    /// Half-space to handle next, or `None` when `y` is feasible.
    fn select(&self, y: &[f64], q: &[f64], normals: &[Vec<f64>], tol: f64) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, v) in normals.iter().enumerate() {
            let v_norm = norm_sq(v).sqrt();
            let y_p = dot(y, v) / v_norm;
            if y_p >= -tol {
                continue;
            }
            let q_p = dot(q, v) / v_norm;
            let t = if q_p > y_p {
                -y_p / (q_p - y_p)
            } else {
                f64::INFINITY
            };
            let better = match (best, self.tie_break) {
                (None, _) => true,
                (Some((_, bt)), TieBreak::LargestCrossing) => t > bt,
                (Some((_, bt)), TieBreak::SmallestCrossing) => t < bt,
            };
            if better {
                best = Some((i, t));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Projects the rows of `x` selected by `seeks` (all rows when `None`).
    pub fn project_rows(&self, mut x: Array2<f64>, seeks: Option<&[bool]>) -> Array2<f64> {
        for (k, mut row) in x.rows_mut().into_iter().enumerate() {
            if let Some(seeks) = seeks {
                if !seeks.get(k).copied().unwrap_or(false) {
                    continue;
                }
            }
            let view = row.view();
            let projected = self.project(&contiguous(&view));
            row.iter_mut().zip(projected).for_each(|(r, p)| *r = p);
        }
        x
    }
}

/// Projects every row of `x` onto `{x : g x >= 0}`.
pub fn prox_cone(x: Array2<f64>, g: &SparseOp, tie_break: TieBreak) -> Array2<f64> {
    ConeProjector::new(g, tie_break).project_rows(x, None)
}

fn project_onto_hyperplane(a: &mut [f64], v: &[f64], v_sq: f64) {
    let scale = dot(a, v) / v_sq;
    for (ai, vi) in a.iter_mut().zip(v.iter()) {
        *ai -= scale * vi;
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

fn norm_sq(a: &[f64]) -> f64 {
    dot(a, a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{radial_references, GridOperators, MonotonicNeighbors, OperatorFactory};
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn monotonic(shape: (usize, usize)) -> SparseOp {
        GridOperators
            .radial_monotonic(shape, MonotonicNeighbors::Nearest)
            .unwrap()
    }

    /// Exact projection onto `{x_i <= x_c}`: pool the center with the largest values.
    fn star_projection(y: &[f64], center: usize) -> Vec<f64> {
        let mut others: Vec<f64> = y
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != center)
            .map(|(_, v)| *v)
            .collect();
        others.sort_by(|a, b| b.total_cmp(a));
        let mut sum = y[center];
        let mut count = 1.0;
        for v in others {
            if v <= sum / count {
                break;
            }
            sum += v;
            count += 1.0;
        }
        let level = sum / count;
        y.iter()
            .enumerate()
            .map(|(i, v)| if i == center { level } else { v.min(level) })
            .collect()
    }

    /// Reference projection by Dykstra's alternating half-space projections.
    fn dykstra_projection(g: &SparseOp, y: &[f64], sweeps: usize) -> Vec<f64> {
        let rows = g.to_dense();
        let mut x = y.to_vec();
        let mut corrections = vec![vec![0.0; y.len()]; rows.nrows()];
        for _ in 0..sweeps {
            for (row, p) in rows.rows().into_iter().zip(corrections.iter_mut()) {
                let v = row.to_vec();
                let v_sq = norm_sq(&v);
                let z: Vec<f64> = x.iter().zip(p.iter()).map(|(a, b)| a + b).collect();
                let mut projected = z.clone();
                if v_sq > DEGENERATE_NORM_SQ && dot(&z, &v) < 0.0 {
                    project_onto_hyperplane(&mut projected, &v, v_sq);
                }
                for ((pi, zi), xi) in p.iter_mut().zip(&z).zip(&projected) {
                    *pi = zi - xi;
                }
                x = projected;
            }
        }
        x
    }

    fn distance(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f64>().sqrt()
    }

    #[test]
    fn dykstra_reference_agrees_with_star_projection() {
        let g = monotonic((3, 3));
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..5 {
            let y: Vec<f64> = (0..9).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let reference = dykstra_projection(&g, &y, 2000);
            for (a, b) in reference.iter().zip(star_projection(&y, 4)) {
                assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn larger_grids_are_feasible_but_no_closer_than_the_reference() {
        let g = monotonic((5, 5));
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..6 {
            let y: Vec<f64> = (0..25).map(|_| rng.gen_range(-1.0..2.0)).collect();
            let reference = dykstra_projection(&g, &y, 10_000);
            let nearest = distance(&y, &reference);
            for tie_break in [TieBreak::LargestCrossing, TieBreak::SmallestCrossing] {
                let projector = ConeProjector::new(&g, tie_break);
                let x = projector.project(&y);
                assert!(projector.min_slack(&x) > -1e-8, "{tie_break:?} left the cone");
                assert!(
                    distance(&y, &x) >= nearest - 1e-4,
                    "{tie_break:?} beat the Euclidean projection: {} < {nearest}",
                    distance(&y, &x)
                );
            }
        }
    }

    #[test]
    fn single_violation_is_averaged() {
        let projector = ConeProjector::new(&monotonic((3, 3)), TieBreak::LargestCrossing);
        let mut y = vec![0.0; 9];
        y[0] = 1.0;
        let x = projector.project(&y);
        assert_abs_diff_eq!(x[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(x[4], 0.5, epsilon = 1e-12);
        assert!(x.iter().enumerate().all(|(i, v)| i == 0 || i == 4 || *v == 0.0));
    }

    #[test]
    fn outward_increasing_profile_becomes_monotonic() {
        let shape = (3, 3);
        let g = monotonic(shape);
        let projector = ConeProjector::new(&g, TieBreak::LargestCrossing);
        let y = [2.0, 1.0, 2.0, 1.0, 0.0, 1.0, 2.0, 1.0, 2.0];
        let x = projector.project(&y);
        let refs = radial_references(shape);
        for (i, r) in refs.iter().enumerate() {
            if let Some(r) = r {
                assert!(x[i] <= x[*r] + 1e-9, "pixel {i} exceeds its reference");
            }
        }
        for (a, b) in x.iter().zip(star_projection(&y, 4)) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-9);
        }
        // corners pool with the center, edges stay below
        assert_abs_diff_eq!(x[4], 1.6, epsilon = 1e-9);
        assert_abs_diff_eq!(x[0], 1.6, epsilon = 1e-9);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn largest_crossing_matches_exact_star_projection() {
        let g = monotonic((3, 3));
        let projector = ConeProjector::new(&g, TieBreak::LargestCrossing);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let y: Vec<f64> = (0..9).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let x = projector.project(&y);
            for (a, b) in x.iter().zip(star_projection(&y, 4)) {
                assert_abs_diff_eq!(*a, b, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn smallest_crossing_can_miss_the_projection() {
        let g = monotonic((3, 3));
        let mut y = vec![0.0; 9];
        y[0] = 10.0;
        y[1] = 1.0;
        let exact = star_projection(&y, 4);
        assert_abs_diff_eq!(exact[1], 1.0, epsilon = 1e-12);

        let largest = ConeProjector::new(&g, TieBreak::LargestCrossing).project(&y);
        assert_abs_diff_eq!(largest[1], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(largest[4], 5.0, epsilon = 1e-9);

        let smallest = ConeProjector::new(&g, TieBreak::SmallestCrossing).project(&y);
        assert_abs_diff_eq!(smallest[1], 11.0 / 3.0, epsilon = 1e-9);
        // still feasible, just not the nearest point
        assert!(ConeProjector::new(&g, TieBreak::SmallestCrossing).min_slack(&smallest) > -1e-9);
    }

    #[test]
    fn projection_is_feasible_and_idempotent() {
        let g = monotonic((5, 5));
        let mut rng = StdRng::seed_from_u64(42);
        for tie_break in [TieBreak::LargestCrossing, TieBreak::SmallestCrossing] {
            let projector = ConeProjector::new(&g, tie_break);
            for _ in 0..10 {
                let y: Vec<f64> = (0..25).map(|_| rng.gen_range(-1.0..2.0)).collect();
                let x = projector.project(&y);
                assert!(projector.min_slack(&x) > -1e-8);
                let again = projector.project(&x);
                assert_eq!(again, x);
            }
        }
    }

    #[test]
    fn feasible_input_is_untouched() {
        let g = monotonic((5, 5));
        let projector = ConeProjector::new(&g, TieBreak::LargestCrossing);
        let y: Vec<f64> = (0..25)
            .map(|i| {
                let (x, y) = ((i % 5) as f64 - 2.0, (i / 5) as f64 - 2.0);
                (-(x * x + y * y) / 4.0).exp()
            })
            .collect();
        assert!(projector.min_slack(&y) >= 0.0);
        assert_eq!(projector.project(&y), y);
    }

    #[test]
    fn rows_are_projected_independently() {
        let g = monotonic((3, 3));
        let mut x = Array2::zeros((2, 9));
        x[[0, 0]] = 1.0;
        x[[1, 0]] = 1.0;
        let projector = ConeProjector::new(&g, TieBreak::LargestCrossing);
        let out = projector.project_rows(x.clone(), Some(&[true, false]));
        assert_abs_diff_eq!(out[[0, 0]], 0.5, epsilon = 1e-12);
        assert_eq!(out[[1, 0]], 1.0);

        let all = prox_cone(x, &g, TieBreak::LargestCrossing);
        assert_abs_diff_eq!(all[[1, 4]], 0.5, epsilon = 1e-12);
    }
}
