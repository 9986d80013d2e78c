use std::collections::BTreeMap;

use ndarray::Array2;

use crate::error::{require_odd, DeblendError};
use crate::operators::{MonotonicNeighbors, OperatorFactory};
use crate::prox::Prox;
use crate::sparse::SparseOp;

/// Power iterations used to estimate `|L|^2` of a constraint operator.
const NORM_ITERS: usize = 50;

/// Shape prior on a morphology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Constraint {
    /// `M`: radial monotonic decay through a linear operator.
    Monotonic,
    /// `S`: point symmetry about the center.
    Symmetric,
    /// `X`: positive gradient toward the center column.
    GradientX,
    /// `Y`: positive gradient toward the center row.
    GradientY,
    /// `m`: strict monotonic profile, enforced by projection.
    StrictMonotonic,
}

impl Constraint {
    pub const SYMBOLS: &'static str = "SMmXY";

    pub fn from_symbol(symbol: char) -> Result<Self, DeblendError> {
        match symbol {
            'M' => Ok(Self::Monotonic),
            'S' => Ok(Self::Symmetric),
            'X' => Ok(Self::GradientX),
            'Y' => Ok(Self::GradientY),
            'm' => Ok(Self::StrictMonotonic),
            other => Err(DeblendError::UnknownConstraint(other)),
        }
    }

    pub fn symbol(self) -> char {
        match self {
            Self::Monotonic => 'M',
            Self::Symmetric => 'S',
            Self::GradientX => 'X',
            Self::GradientY => 'Y',
            Self::StrictMonotonic => 'm',
        }
    }
}

/// Which components seek which constraint.
///
/// Every seeks vector has one entry per component, garbage collectors
/// included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstraintSpec {
    seeks: BTreeMap<Constraint, Vec<bool>>,
    components: usize,
}

impl ConstraintSpec {
    /// No constraints on any of `components`.
    pub fn none(components: usize) -> Self {
        Self {
            seeks: BTreeMap::new(),
            components,
        }
    }

    /// Every one of the `k` declared components seeks every symbol; the `gc`
    /// garbage collectors seek nothing.
    pub fn uniform(symbols: &str, k: usize, gc: usize) -> Result<Self, DeblendError> {
        let mut spec = Self::none(k + gc);
        for symbol in symbols.chars() {
            let constraint = Constraint::from_symbol(symbol)?;
            let mut seeks = vec![true; k];
            seeks.resize(k + gc, false);
            spec.seeks.insert(constraint, seeks);
        }
        Ok(spec)
    }

    /// One symbol string per component; `None` means unconstrained.
    pub fn per_component(list: &[Option<&str>], components: usize) -> Result<Self, DeblendError> {
        if list.len() != components {
            return Err(DeblendError::ComponentCountMismatch {
                expected: components,
                actual: list.len(),
            });
        }
        let mut spec = Self::none(components);
        for (k, symbols) in list.iter().enumerate() {
            for symbol in symbols.unwrap_or_default().chars() {
                let constraint = Constraint::from_symbol(symbol)?;
                spec.seeks
                    .entry(constraint)
                    .or_insert_with(|| vec![false; components])[k] = true;
            }
        }
        Ok(spec)
    }

    pub fn components(&self) -> usize {
        self.components
    }

    pub fn is_empty(&self) -> bool {
        self.seeks.is_empty()
    }

    pub fn seeks(&self, constraint: Constraint) -> Option<&[bool]> {
        self.seeks.get(&constraint).map(Vec::as_slice)
    }

    /// Constraints in a fixed order with their seeks vectors.
    pub fn iter(&self) -> impl Iterator<Item = (Constraint, &[bool])> + '_ {
        self.seeks.iter().map(|(c, s)| (*c, s.as_slice()))
    }

    /// Extends every seeks vector with non-seeking components.
    pub(crate) fn padded(mut self, components: usize) -> Self {
        if components > self.components {
            for seeks in self.seeks.values_mut() {
                seeks.resize(components, false);
            }
            self.components = components;
        }
        self
    }
}

/// Constraint symbols as supplied to a deblend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraints {
    /// The same symbols for every declared component.
    Uniform(String),
    /// One entry per component, garbage collectors included.
    PerComponent(Vec<Option<String>>),
    /// An already resolved specification; shorter specs are padded with
    /// unconstrained components.
    Spec(ConstraintSpec),
}

impl Constraints {
    /// Seeks vectors for `k` declared components and `gc` garbage collectors.
    pub fn resolve(&self, k: usize, gc: usize) -> Result<ConstraintSpec, DeblendError> {
        let components = k + gc;
        match self {
            Self::Uniform(symbols) => ConstraintSpec::uniform(symbols, k, gc),
            Self::PerComponent(list) => {
                let list: Vec<Option<&str>> = list.iter().map(|s| s.as_deref()).collect();
                ConstraintSpec::per_component(&list, components)
            }
            Self::Spec(spec) if spec.components() <= components => Ok(spec.clone().padded(components)),
            Self::Spec(spec) => Err(DeblendError::ComponentCountMismatch {
                expected: components,
                actual: spec.components(),
            }),
        }
    }
}

/// Block-diagonal linear constraint `L S` together with the proximal
/// operator of its target set.
///
/// Components that do not seek the constraint get a placeholder block so
/// that one product covers the whole factor.
#[derive(Debug, Clone)]
pub struct LinearConstraint {
    constraint: Constraint,
    op: SparseOp,
    prox: Prox,
    components: usize,
    pixels: usize,
    norm_sq: f64,
}

impl LinearConstraint {
    pub fn constraint(&self) -> Constraint {
        self.constraint
    }

    pub fn op(&self) -> &SparseOp {
        &self.op
    }

    pub fn prox(&self) -> &Prox {
        &self.prox
    }

    /// Estimate of `|L|^2`, the squared largest singular value.
    pub fn norm_sq(&self) -> f64 {
        self.norm_sq
    }

    /// `L` applied to the flattened `(components, pixels)` factor.
    pub fn apply(&self, s: &Array2<f64>) -> Result<Array2<f64>, DeblendError> {
        self.check(s)?;
        let flat: Vec<f64> = s.iter().copied().collect();
        let out = self.op.mul_vec(&flat);
        Array2::from_shape_vec((self.components, self.pixels), out).map_err(|_| self.mismatch(s))
    }

    /// `L^T` applied to a `(components, pixels)` dual variable.
    pub fn apply_transpose(&self, z: &Array2<f64>) -> Result<Array2<f64>, DeblendError> {
        self.check(z)?;
        let flat: Vec<f64> = z.iter().copied().collect();
        let out = self.op.transpose_mul_vec(&flat);
        Array2::from_shape_vec((self.components, self.pixels), out).map_err(|_| self.mismatch(z))
    }

    fn check(&self, x: &Array2<f64>) -> Result<(), DeblendError> {
        if x.dim() != (self.components, self.pixels) {
            return Err(self.mismatch(x));
        }
        Ok(())
    }

    fn mismatch(&self, x: &Array2<f64>) -> DeblendError {
        DeblendError::ShapeMismatch {
            what: "constrained factor",
            expected: vec![self.components, self.pixels],
            actual: x.shape().to_vec(),
        }
    }
}

/// Builds the linear operator of `constraint` over every component.
///
/// Returns `None` for [`Constraint::StrictMonotonic`], which has no linear
/// form and is enforced by the proximal operator of the morphology.
pub fn constraint_op(
    constraint: Constraint,
    shape: (usize, usize),
    seeks: &[bool],
    neighbors: MonotonicNeighbors,
    factory: &impl OperatorFactory,
) -> Result<Option<LinearConstraint>, DeblendError> {
    require_odd(shape)?;
    let (real, placeholder, prox) = match constraint {
        Constraint::StrictMonotonic => return Ok(None),
        Constraint::Monotonic => (
            factory.radial_monotonic(shape, neighbors)?,
            factory.identity(shape),
            Prox::Plus,
        ),
        Constraint::Symmetric => (factory.symmetry(shape)?, factory.zeros(shape), Prox::Zero),
        Constraint::GradientX => (factory.gradient_x(shape)?, factory.identity(shape), Prox::Plus),
        Constraint::GradientY => (factory.gradient_y(shape)?, factory.identity(shape), Prox::Plus),
    };

    let blocks: Vec<&SparseOp> = seeks
        .iter()
        .map(|&seeking| if seeking { &real } else { &placeholder })
        .collect();
    let op = SparseOp::block_diag(&blocks);
    let norm_sq = op.spectral_norm_sq(NORM_ITERS);
    log::debug!(
        "constraint {} over {} components, {} non-zeros, |L|^2 ~ {norm_sq:.3}",
        constraint.symbol(),
        seeks.len(),
        op.nnz()
    );

    Ok(Some(LinearConstraint {
        constraint,
        op,
        prox,
        components: seeks.len(),
        pixels: shape.0 * shape.1,
        norm_sq,
    }))
}
