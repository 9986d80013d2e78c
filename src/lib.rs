//! Deblending of multi-band astronomical images by constrained non-negative
//! matrix factorization.
//!
//! A blend of `K` sources observed in `B` bands is modelled as
//! `Y_b ~ sum_k A[b, k] * Gamma[k][b] * S[k]`, where `A` holds one spectrum per
//! source, `S` one morphology per source, and `Gamma[k][b]` moves source `k`
//! from the image center to its peak and convolves it with the band PSF.
//!
//! How it works (high level):
//! - Build per-source, per-band transfer operators from the peaks and PSF.
//! - Start every source as a single bright pixel with its peak spectrum.
//! - Alternate proximal gradient steps on `A` (simplex) and `S` (positivity,
//!   sparsity, monotonicity, symmetry), the linear priors via ADMM.
//!
//! Calling it:
//! - Wrap the band cube (and optional weights and sky) in an `Observation`.
//! - List the peaks and pick constraints, e.g. `"M"` or `"mS"`.
//! - Call `deblend` and inspect the returned `Deblend`.
//!
//! Example:
//! ```rust,no_run
//! use ndarray::Array3;
//! use nmf_deblend::{deblend, Constraints, DeblendOptions, LogObserver, Observation, Peak};
//!
//! let images = Array3::<f64>::zeros((3, 21, 21));
//! let peaks = [Some(Peak::new(7.0, 10.0)), Some(Peak::new(13.0, 10.0))];
//! let options = DeblendOptions {
//!     seed: Some(0),
//!     ..DeblendOptions::default()
//! };
//! let result = deblend(
//!     Observation::new(images),
//!     Some(&peaks[..]),
//!     Some(&Constraints::Uniform("M".into())),
//!     &options,
//!     &mut LogObserver,
//! )
//! .unwrap();
//! assert_eq!(result.s.dim(), (2, 21, 21));
//! ```

mod cone;
mod constraint;
mod deblend;
mod error;
mod gradient;
mod image;
mod init;
mod model;
mod observer;
mod operators;
mod prox;
mod report;
mod solver;
mod sparse;
mod transfer;

pub use cone::{prox_cone, ConeProjector, TieBreak};
pub use constraint::{constraint_op, Constraint, ConstraintSpec, Constraints, LinearConstraint};
pub use deblend::{deblend, deblend_with, Deblend, DeblendOptions, StrictMonotonicEnforcement};
pub use error::DeblendError;
pub use gradient::{delta_data, objective, Factor, ProxLikelihood, Weights};
pub use image::{flatten_bands, oddify, reshape_img, Observation, Peak};
pub use init::{init_morphology, init_spectral};
pub use model::{get_model, get_peak_model, reshape_model};
pub use observer::{Diagnostic, DiagnosticLog, FallbackReason, LogObserver, Observer};
pub use operators::{
    center, distance_order, radial_references, GridOperators, MonotonicNeighbors,
    OperatorFactory, Translation,
};
pub use prox::{build_prox_cone, build_prox_monotonic, Prox};
pub use report::{IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter};
pub use solver::{
    DeblendProblem, Factors, LipschitzSteps, Optimizer, Palm, SolveResult, SolverOptions,
};
pub use sparse::{SparseError, SparseOp};
pub use transfer::{
    adapt_psf, component_gamma, compose, identity_transfer, translate_psfs, Psf, PsfOp,
    TransferOps,
};
