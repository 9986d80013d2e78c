use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cone::TieBreak;
use crate::constraint::{constraint_op, Constraint, Constraints};
use crate::error::DeblendError;
use crate::gradient::{ProxLikelihood, Weights};
use crate::image::{Observation, Peak};
use crate::init::{init_morphology, init_spectral};
use crate::model::{get_model, reshape_model};
use crate::observer::{Diagnostic, Observer};
use crate::operators::{GridOperators, MonotonicNeighbors, OperatorFactory};
use crate::prox::{build_prox_cone, build_prox_monotonic, Prox};
use crate::report::{IterationReport, Reporter, SolverStats};
use crate::solver::{DeblendProblem, Factors, Optimizer, Palm, SolverOptions};
use crate::sparse::SparseOp;
use crate::transfer::{adapt_psf, identity_transfer, translate_psfs, Psf, PsfOp};

/// How the strict monotonic constraint `m` is enforced on the morphology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrictMonotonicEnforcement {
    /// Exact projection onto the monotonic cone.
    #[default]
    Cone,
    /// Pixel-by-pixel clipping along ascending distance from the center.
    Pixelwise,
}

/// Options of a deblend call.
#[derive(Debug, Clone)]
pub struct DeblendOptions {
    /// Point-spread function, shared or per band.
    pub psf: Option<Psf>,
    pub max_iter: usize,
    pub e_rel: f64,
    /// Relative magnitude below which PSF operator entries are dropped.
    pub psf_thresh: f64,
    /// Relative magnitude below which translation operator entries are dropped.
    pub translation_thresh: f64,
    pub slack: f64,
    /// L0 sparsity threshold on the morphology; wins over `l1_thresh`.
    pub l0_thresh: Option<f64>,
    /// L1 sparsity threshold on the morphology.
    pub l1_thresh: Option<f64>,
    /// Extra components without a peak that absorb unmodelled flux.
    pub garbage_collectors: usize,
    /// Make even sides odd by dropping a row/column instead of padding.
    pub truncate: bool,
    pub traceback: bool,
    pub verbose: bool,
    pub monotonic_neighbors: MonotonicNeighbors,
    pub strict_monotonic: StrictMonotonicEnforcement,
    pub tie_break: TieBreak,
    /// Slack allowed by pixelwise monotonic enforcement.
    pub monotonic_thresh: f64,
    /// Replaces the default simplex projection of the spectra.
    pub prox_a: Option<Prox>,
    /// Replaces the default positivity/sparsity operator of the morphology.
    pub prox_s: Option<Prox>,
    /// Seed of the random fallback initialization; fresh entropy when `None`.
    pub seed: Option<u64>,
}

impl Default for DeblendOptions {
    fn default() -> Self {
        Self {
            psf: None,
            max_iter: 1000,
            e_rel: 1e-3,
            psf_thresh: 1e-2,
            translation_thresh: 1e-8,
            slack: 0.9,
            l0_thresh: None,
            l1_thresh: None,
            garbage_collectors: 0,
            truncate: false,
            traceback: false,
            verbose: false,
            monotonic_neighbors: MonotonicNeighbors::Nearest,
            strict_monotonic: StrictMonotonicEnforcement::Cone,
            tie_break: TieBreak::LargestCrossing,
            monotonic_thresh: 0.0,
            prox_a: None,
            prox_s: None,
            seed: None,
        }
    }
}

impl DeblendOptions {
    pub fn solver_options(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter,
            e_rel: self.e_rel,
            slack: self.slack,
            traceback: self.traceback,
            verbose: self.verbose,
        }
    }
}

/// Result of a deblend call, on the odd-shaped grid actually fitted.
#[derive(Debug, Clone)]
pub struct Deblend {
    /// Spectra, `(bands, components)`.
    pub a: Array2<f64>,
    /// Morphologies, `(components, rows, cols)`.
    pub s: Array3<f64>,
    /// Reconstructed blend, `(bands, rows, cols)`.
    pub model: Array3<f64>,
    pub psf: Option<PsfOp>,
    pub tx: Option<Vec<SparseOp>>,
    pub ty: Option<Vec<SparseOp>>,
    pub trace: Option<Vec<IterationReport>>,
    pub stats: SolverStats,
}

impl Deblend {
    pub fn components(&self) -> usize {
        self.a.ncols()
    }

    /// `(bands, rows, cols)` of the fitted grid.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.model.dim()
    }
}

/// Deblends `observation` with the built-in operators and optimizer.
///
/// `peaks` lists one optional position per declared source; without it only
/// garbage collectors are fitted and no translation is applied.
pub fn deblend(
    observation: Observation,
    peaks: Option<&[Option<Peak>]>,
    constraints: Option<&Constraints>,
    options: &DeblendOptions,
    observer: &mut dyn Observer,
) -> Result<Deblend, DeblendError> {
    let optimizer = Palm::new(options.solver_options());
    deblend_with(
        observation,
        peaks,
        constraints,
        options,
        observer,
        &GridOperators,
        &optimizer,
        None,
    )
}

/// [`deblend`] with a custom operator factory, optimizer and reporter.
#[allow(clippy::too_many_arguments)]
pub fn deblend_with(
    observation: Observation,
    peaks: Option<&[Option<Peak>]>,
    constraints: Option<&Constraints>,
    options: &DeblendOptions,
    observer: &mut dyn Observer,
    factory: &impl OperatorFactory,
    optimizer: &impl Optimizer,
    reporter: Option<&mut dyn Reporter>,
) -> Result<Deblend, DeblendError> {
    let observation = observation.oddified(options.truncate, observer)?;
    let (bands, rows, cols) = observation.shape();
    let shape = (rows, cols);
    log::debug!("shape: {:?}", (bands, rows, cols));

    let data = observation.data();
    let weights = match observation.flat_weights() {
        Some(w) => Weights::PerPixel(w),
        None => Weights::Uniform,
    };
    let psf = options
        .psf
        .as_ref()
        .map(|psf| adapt_psf(psf, bands, shape, options.psf_thresh, factory))
        .transpose()?;

    let k = peaks.map_or(0, <[_]>::len);
    let gc = options.garbage_collectors;
    if k + gc == 0 {
        return Err(DeblendError::NoComponents);
    }
    let mut all_peaks = peaks.map(<[_]>::to_vec).unwrap_or_default();
    all_peaks.resize(k + gc, None);

    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let a = init_spectral(observation.images(), &all_peaks, &mut rng, observer)?;
    let s = init_morphology(observation.images(), &all_peaks, &mut rng, observer)?;

    let (tx, ty, gamma) = if peaks.is_some() {
        let ops = translate_psfs(
            shape,
            &all_peaks,
            bands,
            psf.as_ref(),
            options.translation_thresh,
            factory,
        )?;
        (Some(ops.tx), Some(ops.ty), ops.gamma)
    } else {
        (None, None, identity_transfer(k + gc, bands, shape, psf.as_ref())?)
    };

    let mut prox_s = match options.prox_s.clone() {
        Some(prox) => prox,
        None => sparsity_prox(options.l0_thresh, options.l1_thresh, observer),
    };
    let prox_a = options.prox_a.clone().unwrap_or(Prox::UnityPlus);

    let mut linear = Vec::new();
    if let Some(constraints) = constraints {
        let spec = constraints.resolve(k, gc)?;
        for (constraint, seeks) in spec.iter() {
            if constraint == Constraint::StrictMonotonic {
                prox_s = match options.strict_monotonic {
                    StrictMonotonicEnforcement::Cone => build_prox_cone(
                        shape,
                        seeks.to_vec(),
                        prox_s,
                        options.monotonic_neighbors,
                        options.tie_break,
                        factory,
                    )?,
                    StrictMonotonicEnforcement::Pixelwise => {
                        build_prox_monotonic(shape, seeks.to_vec(), prox_s, options.monotonic_thresh)?
                    }
                };
            } else if let Some(op) =
                constraint_op(constraint, shape, seeks, options.monotonic_neighbors, factory)?
            {
                linear.push(op);
            }
        }
    }
    log::debug!("prox_A: {prox_a:?}");
    log::debug!("linear constraints: {}", linear.len());

    let problem = DeblendProblem {
        likelihood: ProxLikelihood::new(data, weights, gamma, prox_a, prox_s),
        constraints: linear,
    };
    let result = optimizer.optimize(&problem, Factors { a, s }, reporter)?;
    let Factors { a, s } = result.factors;

    let model = get_model(&a, s.view().into_dyn(), tx.as_deref(), ty.as_deref(), psf.as_ref())?;
    let model = reshape_model(model, shape)?;
    let s = Array3::from_shape_fn((k + gc, rows, cols), |(c, y, x)| s[[c, y * cols + x]]);

    Ok(Deblend {
        a,
        s,
        model,
        psf,
        tx,
        ty,
        trace: result.trace,
        stats: result.stats,
    })
}

/// Positivity, optionally with L0 or L1 sparsity; L0 wins when both are set.
fn sparsity_prox(l0: Option<f64>, l1: Option<f64>, observer: &mut dyn Observer) -> Prox {
    match (l0, l1) {
        (Some(l0), Some(l1)) => {
            observer.on_diagnostic(&Diagnostic::SparsityConflict { l0, l1 });
            Prox::Hard { thresh: l0 }
        }
        (Some(l0), None) => Prox::Hard { thresh: l0 },
        (None, Some(l1)) => Prox::SoftPlus { thresh: l1 },
        (None, None) => Prox::Plus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::DiagnosticLog;

    #[test]
    fn l0_threshold_wins_with_a_warning() {
        let mut log = DiagnosticLog::new();
        assert!(matches!(
            sparsity_prox(Some(0.1), Some(0.2), &mut log),
            Prox::Hard { thresh } if thresh == 0.1
        ));
        assert_eq!(
            log.events(),
            &[Diagnostic::SparsityConflict { l0: 0.1, l1: 0.2 }]
        );
        assert!(matches!(sparsity_prox(None, Some(0.2), &mut log), Prox::SoftPlus { .. }));
        assert!(matches!(sparsity_prox(None, None, &mut log), Prox::Plus));
        assert_eq!(log.events().len(), 1);
    }

    #[test]
    fn no_components_is_an_error() {
        let mut log = DiagnosticLog::new();
        let observation = Observation::new(Array3::zeros((1, 3, 3)));
        let err = deblend(observation, None, None, &DeblendOptions::default(), &mut log).unwrap_err();
        assert_eq!(err, DeblendError::NoComponents);
    }

    #[test]
    fn defaults_match_solver_defaults() {
        let options = DeblendOptions::default().solver_options();
        let solver = SolverOptions::default();
        assert_eq!(options.max_iter, solver.max_iter);
        assert_eq!(options.e_rel, solver.e_rel);
        assert_eq!(options.slack, solver.slack);
    }
}
