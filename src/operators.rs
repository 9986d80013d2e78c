//! Sparse operators over a flattened `rows x cols` pixel grid.
//!
//! Pixels are indexed row-major: `index = y * cols + x`. The grid center is
//! `(cols / 2, rows / 2)`, which is the true center for odd shapes.

use ndarray::ArrayView2;

use crate::error::DeblendError;
use crate::sparse::SparseOp;

/// How a pixel's inward reference is chosen for radial monotonicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonotonicNeighbors {
    /// The single 8-neighbour closest to the center.
    #[default]
    Nearest,
    /// Every 8-neighbour closer to the center, weighted by how much closer it is.
    Weighted,
}

/// A pair of 1-D translation operators plus the shift they implement.
#[derive(Debug, Clone)]
pub struct Translation {
    /// Shift along columns.
    pub tx: SparseOp,
    /// Shift along rows.
    pub ty: SparseOp,
    /// `(dx, dy)` actually applied, in pixels.
    pub shift: (f64, f64),
}

/// Builds the primitive operators the forward model and constraints are made of.
pub trait OperatorFactory {
    /// Convolution with `kernel`, dropping entries below `threshold` times the largest one.
    fn psf(
        &self,
        kernel: ArrayView2<'_, f64>,
        shape: (usize, usize),
        threshold: f64,
    ) -> Result<SparseOp, DeblendError>;

    /// Moves image content by `(dx, dy)` pixels; weights below `threshold` are dropped.
    fn translation(
        &self,
        dx: f64,
        dy: f64,
        shape: (usize, usize),
        threshold: f64,
    ) -> Result<Translation, DeblendError>;

    /// Row `i` computes `ref(i) - x[i]`; non-negative output means monotonic decay.
    fn radial_monotonic(
        &self,
        shape: (usize, usize),
        neighbors: MonotonicNeighbors,
    ) -> Result<SparseOp, DeblendError>;

    /// Row `i` computes `x[i] - x[mirror(i)]` for point symmetry about the center.
    fn symmetry(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError>;

    /// Differences along x that are non-negative when the profile rises toward the center column.
    fn gradient_x(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError>;

    /// Differences along y that are non-negative when the profile rises toward the center row.
    fn gradient_y(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError>;

    fn identity(&self, shape: (usize, usize)) -> SparseOp {
        SparseOp::identity(shape.0 * shape.1)
    }

    fn zeros(&self, shape: (usize, usize)) -> SparseOp {
        SparseOp::zeros(shape.0 * shape.1)
    }
}

/// Operators for a regular pixel grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridOperators;

impl OperatorFactory for GridOperators {
    fn psf(
        &self,
        kernel: ArrayView2<'_, f64>,
        shape: (usize, usize),
        threshold: f64,
    ) -> Result<SparseOp, DeblendError> {
        let (rows, cols) = shape;
        let (kh, kw) = kernel.dim();
        let (kcy, kcx) = ((kh / 2) as isize, (kw / 2) as isize);

        let mut triplets = Vec::new();
        for qy in 0..rows {
            for qx in 0..cols {
                let col = qy * cols + qx;
                for ((i, j), &value) in kernel.indexed_iter() {
                    if value == 0.0 {
                        continue;
                    }
                    let py = qy as isize + i as isize - kcy;
                    let px = qx as isize + j as isize - kcx;
                    if py < 0 || px < 0 || py >= rows as isize || px >= cols as isize {
                        continue;
                    }
                    triplets.push((py as usize * cols + px as usize, col, value));
                }
            }
        }
        let op = SparseOp::from_triplets(rows * cols, rows * cols, &triplets)?;
        Ok(op.thresholded(threshold))
    }

    fn translation(
        &self,
        dx: f64,
        dy: f64,
        shape: (usize, usize),
        threshold: f64,
    ) -> Result<Translation, DeblendError> {
        let (rows, cols) = shape;
        let tx = shift_op(shape, dx, threshold, |y, x| (y, x), cols)?;
        let ty = shift_op(shape, dy, threshold, |y, x| (x, y), rows)?;
        debug_assert_eq!(tx.nrows(), rows * cols);
        Ok(Translation {
            tx,
            ty,
            shift: (dx, dy),
        })
    }

    fn radial_monotonic(
        &self,
        shape: (usize, usize),
        neighbors: MonotonicNeighbors,
    ) -> Result<SparseOp, DeblendError> {
        let (rows, cols) = shape;
        let n = rows * cols;
        let (cx, cy) = center(shape);
        let mut triplets = Vec::new();

        for y in 0..rows {
            for x in 0..cols {
                let idx = y * cols + x;
                if (x, y) == (cx, cy) {
                    continue;
                }
                let own = distance(shape, x, y);
                match neighbors {
                    MonotonicNeighbors::Nearest => {
                        if let Some(reference) = nearest_inward(shape, x, y) {
                            triplets.push((idx, idx, -1.0));
                            triplets.push((idx, reference, 1.0));
                        }
                    }
                    MonotonicNeighbors::Weighted => {
                        let inward: Vec<(usize, f64)> = neighbours(shape, x, y)
                            .filter_map(|(nx, ny)| {
                                let gain = own - distance(shape, nx, ny);
                                (gain > 0.0).then_some((ny * cols + nx, gain))
                            })
                            .collect();
                        let total: f64 = inward.iter().map(|(_, g)| g).sum();
                        if total > 0.0 {
                            triplets.push((idx, idx, -1.0));
                            for (reference, gain) in inward {
                                triplets.push((idx, reference, gain / total));
                            }
                        }
                    }
                }
            }
        }
        Ok(SparseOp::from_triplets(n, n, &triplets)?)
    }

    fn symmetry(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError> {
        let n = shape.0 * shape.1;
        let mut triplets = Vec::with_capacity(2 * n);
        for idx in 0..n {
            let mirror = n - 1 - idx;
            if mirror == idx {
                continue;
            }
            triplets.push((idx, idx, 1.0));
            triplets.push((idx, mirror, -1.0));
        }
        Ok(SparseOp::from_triplets(n, n, &triplets)?)
    }

    fn gradient_x(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError> {
        let (rows, cols) = shape;
        let (cx, _) = center(shape);
        let mut triplets = Vec::new();
        for y in 0..rows {
            for x in 0..cols {
                let idx = y * cols + x;
                let inner = match x.cmp(&cx) {
                    core::cmp::Ordering::Less => x + 1,
                    core::cmp::Ordering::Greater => x - 1,
                    core::cmp::Ordering::Equal => continue,
                };
                triplets.push((idx, idx, -1.0));
                triplets.push((idx, y * cols + inner, 1.0));
            }
        }
        Ok(SparseOp::from_triplets(rows * cols, rows * cols, &triplets)?)
    }

    fn gradient_y(&self, shape: (usize, usize)) -> Result<SparseOp, DeblendError> {
        let (rows, cols) = shape;
        let (_, cy) = center(shape);
        let mut triplets = Vec::new();
        for y in 0..rows {
            let inner = match y.cmp(&cy) {
                core::cmp::Ordering::Less => y + 1,
                core::cmp::Ordering::Greater => y - 1,
                core::cmp::Ordering::Equal => continue,
            };
            for x in 0..cols {
                let idx = y * cols + x;
                triplets.push((idx, idx, -1.0));
                triplets.push((idx, inner * cols + x, 1.0));
            }
        }
        Ok(SparseOp::from_triplets(rows * cols, rows * cols, &triplets)?)
    }
}

/// Center pixel `(x, y)` of a `(rows, cols)` grid.
pub fn center(shape: (usize, usize)) -> (usize, usize) {
    (shape.1 / 2, shape.0 / 2)
}

/// Pixel indices sorted by ascending distance from the center (stable for ties).
pub fn distance_order(shape: (usize, usize)) -> Vec<usize> {
    let (rows, cols) = shape;
    let mut order: Vec<usize> = (0..rows * cols).collect();
    order.sort_by(|&a, &b| {
        let da = distance(shape, a % cols, a / cols);
        let db = distance(shape, b % cols, b / cols);
        da.total_cmp(&db)
    });
    order
}

/// Inward reference pixel for every pixel; `None` for the center.
pub fn radial_references(shape: (usize, usize)) -> Vec<Option<usize>> {
    let (rows, cols) = shape;
    let mut references = Vec::with_capacity(rows * cols);
    for y in 0..rows {
        for x in 0..cols {
            references.push(nearest_inward(shape, x, y));
        }
    }
    references
}

fn distance(shape: (usize, usize), x: usize, y: usize) -> f64 {
    let (cx, cy) = center(shape);
    let dx = x as f64 - cx as f64;
    let dy = y as f64 - cy as f64;
    (dx * dx + dy * dy).sqrt()
}

fn neighbours(shape: (usize, usize), x: usize, y: usize) -> impl Iterator<Item = (usize, usize)> {
    let (rows, cols) = shape;
    (-1_isize..=1)
        .flat_map(|oy| (-1_isize..=1).map(move |ox| (ox, oy)))
        .filter(|&(ox, oy)| ox != 0 || oy != 0)
        .filter_map(move |(ox, oy)| {
            let nx = x as isize + ox;
            let ny = y as isize + oy;
            (nx >= 0 && ny >= 0 && nx < cols as isize && ny < rows as isize)
                .then_some((nx as usize, ny as usize))
        })
}

fn nearest_inward(shape: (usize, usize), x: usize, y: usize) -> Option<usize> {
    let own = distance(shape, x, y);
    let cols = shape.1;
    let mut best: Option<(usize, f64)> = None;
    for (nx, ny) in neighbours(shape, x, y) {
        let d = distance(shape, nx, ny);
        if d >= own {
            continue;
        }
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((ny * cols + nx, d));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Linear-interpolation shift along one axis.
///
/// `axes` maps `(line, offset)` to `(y, x)`, where `offset` runs along the
/// shifted axis of length `len`.
fn shift_op(
    shape: (usize, usize),
    shift: f64,
    threshold: f64,
    axes: impl Fn(usize, usize) -> (usize, usize),
    len: usize,
) -> Result<SparseOp, DeblendError> {
    let (rows, cols) = shape;
    let n = rows * cols;
    let lines = n / len.max(1);
    let whole = shift.floor();
    let frac = shift - whole;
    let whole = whole as isize;

    let mut triplets = Vec::with_capacity(2 * n);
    for line in 0..lines {
        for offset in 0..len {
            let (sy, sx) = axes(line, offset);
            let col = sy * cols + sx;
            for (step, weight) in [(0_isize, 1.0 - frac), (1, frac)] {
                if weight <= threshold {
                    continue;
                }
                let target = offset as isize + whole + step;
                if target < 0 || target >= len as isize {
                    continue;
                }
                let (ty, tx) = axes(line, target as usize);
                triplets.push((ty * cols + tx, col, weight));
            }
        }
    }
    Ok(SparseOp::from_triplets(n, n, &triplets)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn integer_translation_moves_a_spike() {
        let shape = (5, 5);
        let t = GridOperators.translation(1.0, -2.0, shape, 1e-8).unwrap();
        let mut img = vec![0.0; 25];
        img[2 * 5 + 2] = 1.0;
        let moved = t.ty.mul_vec(&t.tx.mul_vec(&img));
        assert_eq!(moved[3], 1.0);
        assert!((moved.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn subpixel_translation_preserves_centroid() {
        let shape = (5, 5);
        let t = GridOperators.translation(0.25, 0.0, shape, 1e-8).unwrap();
        let mut img = vec![0.0; 25];
        img[2 * 5 + 2] = 1.0;
        let moved = t.tx.mul_vec(&img);
        assert!((moved[2 * 5 + 2] - 0.75).abs() < 1e-12);
        assert!((moved[2 * 5 + 3] - 0.25).abs() < 1e-12);
        let centroid: f64 = moved.iter().enumerate().map(|(i, v)| (i % 5) as f64 * v).sum();
        assert!((centroid - 2.25).abs() < 1e-12);
    }

    #[test]
    fn psf_spreads_a_spike_into_the_kernel() {
        let kernel = array![[0.0, 0.1, 0.0], [0.1, 0.6, 0.1], [0.0, 0.1, 0.0]];
        let op = GridOperators.psf(kernel.view(), (3, 3), 1e-2).unwrap();
        let mut img = vec![0.0; 9];
        img[4] = 1.0;
        let blurred = op.mul_vec(&img);
        assert_eq!(blurred, vec![0.0, 0.1, 0.0, 0.1, 0.6, 0.1, 0.0, 0.1, 0.0]);
    }

    #[test]
    fn faint_psf_wings_are_dropped() {
        let kernel = array![[0.001, 0.1, 0.001], [0.1, 0.596, 0.1], [0.001, 0.1, 0.001]];
        let op = GridOperators.psf(kernel.view(), (3, 3), 1e-2).unwrap();
        // a full 3x3 kernel on a 3x3 image stores 49 taps; the corners account for 16
        assert_eq!(op.nnz(), 33);
        assert!(op.values().iter().all(|v| v.abs() >= 0.1));

        let kept = GridOperators.psf(kernel.view(), (3, 3), 1e-4).unwrap();
        assert_eq!(kept.nnz(), 49);
    }

    #[test]
    fn monotonic_rows_point_inward() {
        let shape = (3, 3);
        let op = GridOperators.radial_monotonic(shape, MonotonicNeighbors::Nearest).unwrap();
        let dense = op.to_dense();
        // center row is empty, every other row references the center
        assert_eq!(dense.row(4).sum(), 0.0);
        for idx in [0, 1, 2, 3, 5, 6, 7, 8] {
            assert_eq!(dense[[idx, idx]], -1.0);
            assert_eq!(dense[[idx, 4]], 1.0);
        }
        let refs = radial_references(shape);
        assert_eq!(refs[4], None);
        assert_eq!(refs[0], Some(4));

        let weighted = GridOperators.radial_monotonic((5, 5), MonotonicNeighbors::Weighted).unwrap();
        let dense = weighted.to_dense();
        for row in dense.rows() {
            assert!(row.sum().abs() < 1e-12);
        }
    }

    #[test]
    fn symmetry_vanishes_on_symmetric_images() {
        let op = GridOperators.symmetry((3, 3)).unwrap();
        let img = [1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0, 2.0, 1.0];
        assert!(op.mul_vec(&img).iter().all(|v| *v == 0.0));
        let skewed = [1.0, 0.0, 0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(op.mul_vec(&skewed)[0], 1.0);
    }

    #[test]
    fn gradients_are_positive_for_a_peaked_profile() {
        let shape = (3, 5);
        let img: Vec<f64> = (0..15)
            .map(|i| {
                let (x, y) = ((i % 5) as f64 - 2.0, (i / 5) as f64 - 1.0);
                10.0 - x.abs() - y.abs()
            })
            .collect();
        let gx = GridOperators.gradient_x(shape).unwrap();
        let gy = GridOperators.gradient_y(shape).unwrap();
        assert!(gx.mul_vec(&img).iter().all(|v| *v >= 0.0));
        assert!(gy.mul_vec(&img).iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn distance_order_starts_at_center() {
        let order = distance_order((3, 3));
        assert_eq!(order[0], 4);
        assert_eq!(order.len(), 9);
        assert_eq!(&order[1..5], &[1, 3, 5, 7]);
    }
}
