use std::time::{Duration, Instant};

use ndarray::Array2;

use crate::constraint::LinearConstraint;
use crate::error::DeblendError;
use crate::gradient::{Factor, ProxLikelihood};
use crate::report::{emit_line, IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter};

/// Options controlling the alternating factorization.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Maximum number of A-then-S sweeps.
    pub max_iter: usize,
    /// Converge when every factor moves by at most `e_rel` of its norm and
    /// every constraint residual is within `e_rel` of its scale.
    pub e_rel: f64,
    /// Fraction of the inverse Lipschitz constant used as step size.
    pub slack: f64,
    /// Keep every iteration report in the result.
    pub traceback: bool,
    /// Print the iteration table when no reporter is given.
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            e_rel: 1e-3,
            slack: 0.9,
            traceback: false,
            verbose: false,
        }
    }
}

/// Spectral and morphology factors of a blend.
#[derive(Debug, Clone, PartialEq)]
pub struct Factors {
    /// `(bands, components)`.
    pub a: Array2<f64>,
    /// `(components, pixels)`.
    pub s: Array2<f64>,
}

/// Likelihood of the data plus the linear constraints on S.
#[derive(Debug, Clone)]
pub struct DeblendProblem {
    pub likelihood: ProxLikelihood,
    pub constraints: Vec<LinearConstraint>,
}

/// Step sizes from the Lipschitz constants of the data term.
#[derive(Debug, Clone, Copy)]
pub struct LipschitzSteps {
    /// Largest pixel weight.
    pub w_max: f64,
    pub slack: f64,
}

impl LipschitzSteps {
    /// `slack / (w_max * |S S^T|_F)` for A, `slack / (w_max * |A^T A|_F)` for S.
    pub fn step(&self, factor: Factor, factors: &Factors) -> f64 {
        let gram = match factor {
            Factor::Spectral => factors.s.dot(&factors.s.t()),
            Factor::Morphology => factors.a.t().dot(&factors.a),
        };
        let lipschitz = self.w_max * norm(&gram);
        if lipschitz > 0.0 {
            self.slack / lipschitz
        } else {
            self.slack / self.w_max.max(f64::MIN_POSITIVE)
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveResult {
    pub factors: Factors,
    pub stats: SolverStats,
    /// Every iteration report, when tracing was requested.
    pub trace: Option<Vec<IterationReport>>,
}

/// Minimizes a [`DeblendProblem`] starting from `factors`.
pub trait Optimizer {
    fn optimize(
        &self,
        problem: &DeblendProblem,
        factors: Factors,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolveResult, DeblendError>;
}

/// Alternating proximal gradient: one step on A, then one on S.
///
/// Linear constraints on S are handled with linearized ADMM: each
/// constraint keeps a split variable `Z = prox_g(L S + U)` and a scaled dual
/// `U`, and the S step is taken from `S - L^T (L S - Z + U) / (m |L|^2)`
/// for `m` constraints.
#[derive(Debug, Clone, Default)]
pub struct Palm {
    pub options: SolverOptions,
    /// Largest pixel weight, scales the step sizes.
    pub w_max: Option<f64>,
}

impl Palm {
    pub fn new(options: SolverOptions) -> Self {
        Self {
            options,
            w_max: None,
        }
    }
}

enum ReporterSlot<'a> {
    External(&'a mut dyn Reporter),
    Local(StdoutReporter),
    None,
}

impl<'a> ReporterSlot<'a> {
    fn new(reporter: Option<&'a mut dyn Reporter>, verbose: bool) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose => Self::Local(StdoutReporter::new()),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter> {
        match self {
            Self::External(r) => Some(*r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }

    fn is_active(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Split variable and scaled dual of one linear constraint.
struct Split {
    z: Array2<f64>,
    u: Array2<f64>,
}

impl Optimizer for Palm {
    fn optimize(
        &self,
        problem: &DeblendProblem,
        factors: Factors,
        reporter: Option<&mut dyn Reporter>,
    ) -> Result<SolveResult, DeblendError> {
        let options = &self.options;
        let start_time = options.verbose.then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose);
        let mut trace = options.traceback.then(Vec::new);
        let steps = LipschitzSteps {
            w_max: self
                .w_max
                .unwrap_or_else(|| problem.likelihood.weights().max()),
            slack: options.slack,
        };
        let f = &problem.likelihood;
        let m = problem.constraints.len() as f64;

        let mut splits = problem
            .constraints
            .iter()
            .map(|c| -> Result<Split, DeblendError> {
                let z = c.apply(&factors.s)?;
                let u = Array2::zeros(z.dim());
                Ok(Split { z, u })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut factors = factors;
        let mut delta_a = f64::INFINITY;
        let mut delta_s = f64::INFINITY;
        let mut residual = 0.0;

        for iter in 0..options.max_iter {
            let step_a = steps.step(Factor::Spectral, &factors);
            let step_s = steps.step(Factor::Morphology, &factors);
            if !step_a.is_finite() || !step_s.is_finite() {
                return finish(
                    factors,
                    stats(SolveStatus::NumericalFailure, iter, f64::NAN, delta_a, delta_s, residual),
                    trace,
                    start_time,
                    &mut reporter,
                );
            }

            let Factors { a, s } = factors;
            let a_prev = a.clone();
            let a = f.step(a, step_a, Factor::Spectral, &s)?;

            let s_prev = s.clone();
            let mut s_start = s;
            for (c, split) in problem.constraints.iter().zip(&splits) {
                if c.norm_sq() <= 0.0 {
                    continue;
                }
                let r = c.apply(&s_prev)? - &split.z + &split.u;
                let correction = c.apply_transpose(&r)?;
                s_start.scaled_add(-1.0 / (m * c.norm_sq()), &correction);
            }
            let s = f.step(s_start, step_s, Factor::Morphology, &a)?;

            residual = 0.0;
            for (c, split) in problem.constraints.iter().zip(splits.iter_mut()) {
                let lx = c.apply(&s)?;
                let step_g = step_s * m * c.norm_sq();
                let z = c.prox().apply(&lx + &split.u, step_g);
                let primal = &lx - &z;
                split.u += &primal;
                let scale = norm(&lx).max(norm(&z)).max(norm(&s));
                if scale > 0.0 {
                    residual = f64::max(residual, norm(&primal) / scale);
                }
                split.z = z;
            }

            delta_a = relative_change(&a, &a_prev);
            delta_s = relative_change(&s, &s_prev);
            factors = Factors { a, s };

            if !delta_a.is_finite() || !delta_s.is_finite() {
                return finish(
                    factors,
                    stats(SolveStatus::NumericalFailure, iter + 1, f64::NAN, delta_a, delta_s, residual),
                    trace,
                    start_time,
                    &mut reporter,
                );
            }

            if reporter.is_active() || trace.is_some() {
                let report = IterationReport {
                    iteration: iter,
                    objective: f.objective(&factors.a, &factors.s)?,
                    delta_a,
                    delta_s,
                    step_a,
                    step_s,
                    residual,
                };
                if let Some(reporter) = reporter.as_mut() {
                    reporter.on_iteration(&report);
                }
                if let Some(trace) = trace.as_mut() {
                    trace.push(report);
                }
            }

            if delta_a <= options.e_rel && delta_s <= options.e_rel && residual <= options.e_rel {
                let objective = f.objective(&factors.a, &factors.s)?;
                log::debug!("converged after {} iterations", iter + 1);
                return finish(
                    factors,
                    stats(SolveStatus::Converged, iter + 1, objective, delta_a, delta_s, residual),
                    trace,
                    start_time,
                    &mut reporter,
                );
            }
        }

        let objective = f.objective(&factors.a, &factors.s)?;
        log::debug!("stopped after {} iterations", options.max_iter);
        finish(
            factors,
            stats(SolveStatus::MaxIterations, options.max_iter, objective, delta_a, delta_s, residual),
            trace,
            start_time,
            &mut reporter,
        )
    }
}

fn stats(
    status: SolveStatus,
    iterations: usize,
    objective: f64,
    delta_a: f64,
    delta_s: f64,
    residual: f64,
) -> SolverStats {
    SolverStats {
        status,
        iterations,
        objective,
        delta_a,
        delta_s,
        residual,
    }
}

fn norm(x: &Array2<f64>) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// `|x - prev| / |x|`, zero when both vanish.
fn relative_change(x: &Array2<f64>, prev: &Array2<f64>) -> f64 {
    let diff = x
        .iter()
        .zip(prev.iter())
        .map(|(a, b)| (a - b) * (a - b))
        .sum::<f64>()
        .sqrt();
    let scale = norm(x);
    if scale > 0.0 {
        diff / scale
    } else if diff == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

fn finish(
    factors: Factors,
    stats: SolverStats,
    trace: Option<Vec<IterationReport>>,
    start_time: Option<Instant>,
    reporter: &mut ReporterSlot<'_>,
) -> Result<SolveResult, DeblendError> {
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish();
    }
    if let Some(start) = start_time {
        let elapsed = format_duration(start.elapsed());
        emit_line(&format!("status: {:?}, time: {elapsed}", stats.status));
    }
    Ok(SolveResult {
        factors,
        stats,
        trace,
    })
}
