use core::str::FromStr;

use ndarray::Array2;

use crate::error::DeblendError;
use crate::model::contiguous;
use crate::prox::Prox;
use crate::sparse::SparseOp;

/// Which factor a gradient or proximal step refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Factor {
    /// The spectral factor A, `(bands, components)`.
    Spectral,
    /// The morphology factor S, `(components, pixels)`.
    Morphology,
}

impl Factor {
    /// Position of the factor in the `[A, S]` pair.
    pub fn from_index(j: usize) -> Option<Self> {
        match j {
            0 => Some(Self::Spectral),
            1 => Some(Self::Morphology),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Spectral => "A",
            Self::Morphology => "S",
        }
    }
}

impl FromStr for Factor {
    type Err = DeblendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(Self::Spectral),
            "S" => Ok(Self::Morphology),
            other => Err(DeblendError::UnknownFactor(other.to_string())),
        }
    }
}

/// Per-pixel weights of the squared-error data term.
#[derive(Debug, Clone, Default)]
pub enum Weights {
    /// Every pixel weighs one.
    #[default]
    Uniform,
    /// `(bands, pixels)` non-negative weights.
    PerPixel(Array2<f64>),
}

impl Weights {
    /// Largest weight; scales the gradient's Lipschitz constant.
    pub fn max(&self) -> f64 {
        match self {
            Self::Uniform => 1.0,
            Self::PerPixel(w) => w.iter().fold(0.0_f64, |m, v| m.max(*v)),
        }
    }

    fn scale_band(&self, b: usize, diff: &mut [f64]) {
        if let Self::PerPixel(w) = self {
            diff.iter_mut().zip(w.row(b).iter()).for_each(|(d, w)| *d *= w);
        }
    }
}

/// Component `k` pushed through `gamma[k][b]` for every band.
struct Transferred {
    rows: Vec<Vec<Vec<f64>>>,
}

impl Transferred {
    fn new(s: &Array2<f64>, gamma: &[Vec<SparseOp>]) -> Self {
        let rows = gamma
            .iter()
            .enumerate()
            .map(|(k, per_band)| {
                let sk = s.row(k);
                let sk = contiguous(&sk);
                per_band.iter().map(|g| g.mul_vec(&sk)).collect()
            })
            .collect();
        Self { rows }
    }

    fn get(&self, k: usize, b: usize) -> &[f64] {
        &self.rows[k][b]
    }
}

fn check_dims(
    a: &Array2<f64>,
    s: &Array2<f64>,
    data: &Array2<f64>,
    gamma: &[Vec<SparseOp>],
    weights: &Weights,
) -> Result<(), DeblendError> {
    let (bands, components) = a.dim();
    let pixels = data.ncols();
    let mismatch = |what: &'static str, expected: Vec<usize>, actual: Vec<usize>| {
        Err(DeblendError::ShapeMismatch {
            what,
            expected,
            actual,
        })
    };
    if s.dim() != (components, pixels) {
        return mismatch("morphology", vec![components, pixels], s.shape().to_vec());
    }
    if data.nrows() != bands {
        return mismatch("data", vec![bands, pixels], data.shape().to_vec());
    }
    if let Weights::PerPixel(w) = weights {
        if w.dim() != data.dim() {
            return mismatch("weights", data.shape().to_vec(), w.shape().to_vec());
        }
    }
    if gamma.len() != components {
        return Err(DeblendError::ComponentCountMismatch {
            expected: components,
            actual: gamma.len(),
        });
    }
    for per_band in gamma {
        if per_band.len() != bands {
            return mismatch("transfer operators", vec![components, bands], vec![gamma.len(), per_band.len()]);
        }
        if let Some(g) = per_band.iter().find(|g| g.nrows() != pixels || g.ncols() != pixels) {
            return mismatch("transfer operator", vec![pixels, pixels], vec![g.nrows(), g.ncols()]);
        }
    }
    Ok(())
}

/// Weighted residual `W * (model - data)` per band.
fn weighted_residual(
    a: &Array2<f64>,
    data: &Array2<f64>,
    transferred: &Transferred,
    weights: &Weights,
) -> Vec<Vec<f64>> {
    let (bands, components) = a.dim();
    (0..bands)
        .map(|b| {
            let mut diff: Vec<f64> = data.row(b).iter().map(|d| -d).collect();
            for k in 0..components {
                let weight = a[[b, k]];
                if weight == 0.0 {
                    continue;
                }
                for (d, v) in diff.iter_mut().zip(transferred.get(k, b)) {
                    *d += weight * v;
                }
            }
            weights.scale_band(b, &mut diff);
            diff
        })
        .collect()
}

/// Gradient of `0.5 * sum_b W_b (model_b - data_b)^2` with respect to `factor`.
///
/// The model of band `b` is `sum_k A[b, k] * gamma[k][b] * S[k]`.
pub fn delta_data(
    a: &Array2<f64>,
    s: &Array2<f64>,
    data: &Array2<f64>,
    gamma: &[Vec<SparseOp>],
    factor: Factor,
    weights: &Weights,
) -> Result<Array2<f64>, DeblendError> {
    check_dims(a, s, data, gamma, weights)?;
    let (bands, components) = a.dim();
    let transferred = Transferred::new(s, gamma);
    let diff = weighted_residual(a, data, &transferred, weights);

    let result = match factor {
        Factor::Spectral => Array2::from_shape_fn((bands, components), |(b, k)| {
            dot(&diff[b], transferred.get(k, b))
        }),
        Factor::Morphology => {
            let mut result = Array2::zeros(s.dim());
            for (k, mut row) in result.rows_mut().into_iter().enumerate() {
                let mut grad = vec![0.0; s.ncols()];
                for b in 0..bands {
                    gamma[k][b].transpose_mul_vec_into(a[[b, k]], &diff[b], &mut grad);
                }
                row.iter_mut().zip(grad).for_each(|(r, g)| *r = g);
            }
            result
        }
    };
    Ok(result)
}

/// Value of `0.5 * sum_b W_b (model_b - data_b)^2`.
pub fn objective(
    a: &Array2<f64>,
    s: &Array2<f64>,
    data: &Array2<f64>,
    gamma: &[Vec<SparseOp>],
    weights: &Weights,
) -> Result<f64, DeblendError> {
    check_dims(a, s, data, gamma, weights)?;
    let transferred = Transferred::new(s, gamma);
    let (bands, components) = a.dim();
    let mut total = 0.0;
    for b in 0..bands {
        let mut diff: Vec<f64> = data.row(b).iter().map(|d| -d).collect();
        for k in 0..components {
            for (d, v) in diff.iter_mut().zip(transferred.get(k, b)) {
                *d += a[[b, k]] * v;
            }
        }
        match weights {
            Weights::Uniform => total += dot(&diff, &diff),
            Weights::PerPixel(w) => {
                total += diff.iter().zip(w.row(b).iter()).map(|(d, w)| w * d * d).sum::<f64>();
            }
        }
    }
    Ok(0.5 * total)
}

/// One proximal-gradient step on the likelihood of either factor.
///
/// Holds everything fixed for a deblend call: data, weights, transfer
/// operators, and the proximal operator of each factor.
#[derive(Debug, Clone)]
pub struct ProxLikelihood {
    data: Array2<f64>,
    weights: Weights,
    gamma: Vec<Vec<SparseOp>>,
    prox_a: Prox,
    prox_s: Prox,
}

impl ProxLikelihood {
    pub fn new(
        data: Array2<f64>,
        weights: Weights,
        gamma: Vec<Vec<SparseOp>>,
        prox_a: Prox,
        prox_s: Prox,
    ) -> Self {
        Self {
            data,
            weights,
            gamma,
            prox_a,
            prox_s,
        }
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn weights(&self) -> &Weights {
        &self.weights
    }

    pub fn gamma(&self) -> &[Vec<SparseOp>] {
        &self.gamma
    }

    pub fn prox(&self, factor: Factor) -> &Prox {
        match factor {
            Factor::Spectral => &self.prox_a,
            Factor::Morphology => &self.prox_s,
        }
    }

    /// Gradient of the data term for `x`, holding the other factor fixed.
    pub fn gradient(&self, x: &Array2<f64>, factor: Factor, other: &Array2<f64>) -> Result<Array2<f64>, DeblendError> {
        match factor {
            Factor::Spectral => delta_data(x, other, &self.data, &self.gamma, factor, &self.weights),
            Factor::Morphology => delta_data(other, x, &self.data, &self.gamma, factor, &self.weights),
        }
    }

    /// `prox(x - step * grad, step)`; consumes the previous value of the factor.
    pub fn step(
        &self,
        x: Array2<f64>,
        step: f64,
        factor: Factor,
        other: &Array2<f64>,
    ) -> Result<Array2<f64>, DeblendError> {
        let grad = self.gradient(&x, factor, other)?;
        let candidate = x - &(grad * step);
        Ok(self.prox(factor).apply(candidate, step))
    }

    /// Data term at `(a, s)`.
    pub fn objective(&self, a: &Array2<f64>, s: &Array2<f64>) -> Result<f64, DeblendError> {
        objective(a, s, &self.data, &self.gamma, &self.weights)
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    let mut sum = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Peak;
    use crate::operators::GridOperators;
    use crate::transfer::translate_psfs;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn problem() -> (Array2<f64>, Array2<f64>, Array2<f64>, Vec<Vec<SparseOp>>, Weights) {
        let shape = (3, 3);
        let peaks = [Some(Peak::new(0.5, 1.0)), Some(Peak::new(2.0, 1.5))];
        let ops = translate_psfs(shape, &peaks, 2, None, 1e-8, &GridOperators).unwrap();
        let a = array![[0.3, 0.6], [0.7, 0.4]];
        let s = Array2::from_shape_fn((2, 9), |(k, i)| 0.1 * (k + 1) as f64 + 0.05 * i as f64);
        let data = Array2::from_shape_fn((2, 9), |(b, i)| ((b * 9 + i) % 4) as f64 * 0.3);
        let weights = Weights::PerPixel(Array2::from_shape_fn((2, 9), |(b, i)| 0.5 + 0.1 * ((b + i) % 3) as f64));
        (a, s, data, ops.gamma, weights)
    }

    #[test]
    fn gradients_match_finite_differences() {
        let (a, s, data, gamma, weights) = problem();
        let h = 1e-6;

        let grad_a = delta_data(&a, &s, &data, &gamma, Factor::Spectral, &weights).unwrap();
        for ((b, k), g) in grad_a.indexed_iter() {
            let mut plus = a.clone();
            plus[[b, k]] += h;
            let mut minus = a.clone();
            minus[[b, k]] -= h;
            let fd = (objective(&plus, &s, &data, &gamma, &weights).unwrap()
                - objective(&minus, &s, &data, &gamma, &weights).unwrap())
                / (2.0 * h);
            assert_relative_eq!(*g, fd, epsilon = 1e-6, max_relative = 1e-5);
        }

        let grad_s = delta_data(&a, &s, &data, &gamma, Factor::Morphology, &weights).unwrap();
        for ((k, i), g) in grad_s.indexed_iter() {
            let mut plus = s.clone();
            plus[[k, i]] += h;
            let mut minus = s.clone();
            minus[[k, i]] -= h;
            let fd = (objective(&a, &plus, &data, &gamma, &weights).unwrap()
                - objective(&a, &minus, &data, &gamma, &weights).unwrap())
                / (2.0 * h);
            assert_relative_eq!(*g, fd, epsilon = 1e-6, max_relative = 1e-5);
        }
    }

    #[test]
    fn gradient_vanishes_at_exact_fit() {
        let (a, s, _, _, _) = problem();
        let data = crate::model::get_model(&a, s.view().into_dyn(), None, None, None).unwrap();
        let identity: Vec<Vec<SparseOp>> = vec![vec![SparseOp::identity(9); 2]; 2];
        let grad = delta_data(&a, &s, &data, &identity, Factor::Morphology, &Weights::Uniform).unwrap();
        assert!(grad.iter().all(|g| g.abs() < 1e-12));
    }

    #[test]
    fn factor_symbols() {
        assert_eq!("A".parse::<Factor>().unwrap(), Factor::Spectral);
        assert_eq!("S".parse::<Factor>().unwrap(), Factor::Morphology);
        assert_eq!(
            "B".parse::<Factor>().unwrap_err(),
            DeblendError::UnknownFactor("B".to_string())
        );
        assert_eq!(Factor::from_index(1), Some(Factor::Morphology));
        assert_eq!(Factor::from_index(2), None);
        assert_eq!(Factor::Spectral.symbol(), "A");
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let (a, s, data, gamma, weights) = problem();
        let short = &gamma[..1];
        assert!(delta_data(&a, &s, &data, short, Factor::Spectral, &weights).is_err());
        let bad_weights = Weights::PerPixel(Array2::ones((1, 9)));
        assert!(delta_data(&a, &s, &data, &gamma, Factor::Spectral, &bad_weights).is_err());
    }

    #[test]
    fn step_applies_prox_after_gradient() {
        let (a, s, data, gamma, weights) = problem();
        let f = ProxLikelihood::new(data, weights, gamma, Prox::UnityPlus, Prox::Plus);
        let before = f.objective(&a, &s).unwrap();
        let s_next = f.step(s.clone(), 0.05, Factor::Morphology, &a).unwrap();
        assert!(s_next.iter().all(|v| *v >= 0.0));
        assert!(f.objective(&a, &s_next).unwrap() < before);

        let a_next = f.step(a.clone(), 0.01, Factor::Spectral, &s_next).unwrap();
        for col in a_next.columns() {
            assert_relative_eq!(col.sum(), 1.0, epsilon = 1e-12);
        }
    }
}
