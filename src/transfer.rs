use ndarray::{Array2, Array3};

use crate::error::DeblendError;
use crate::image::Peak;
use crate::operators::{center, OperatorFactory};
use crate::sparse::SparseOp;

/// Point-spread function kernels as supplied by the caller.
#[derive(Debug, Clone)]
pub enum Psf {
    /// One kernel for every band.
    Shared(Array2<f64>),
    /// One kernel per band, `(bands, kh, kw)`.
    PerBand(Array3<f64>),
}

/// PSF convolution operators over the flattened image.
#[derive(Debug, Clone)]
pub enum PsfOp {
    Shared(SparseOp),
    PerBand(Vec<SparseOp>),
}

impl PsfOp {
    /// One operator per band, each checked to act on `pixels`-long images.
    ///
    /// A per-band PSF must carry exactly `bands` operators.
    pub fn per_band(&self, bands: usize, pixels: usize) -> Result<Vec<&SparseOp>, DeblendError> {
        let ops: Vec<&SparseOp> = match self {
            Self::Shared(op) => vec![op; bands],
            Self::PerBand(ops) => {
                if ops.len() != bands {
                    return Err(DeblendError::BandMismatch {
                        expected: bands,
                        actual: ops.len(),
                    });
                }
                ops.iter().collect()
            }
        };
        for op in &ops {
            check_square(op, pixels, "psf operator")?;
        }
        Ok(ops)
    }

    /// Convolves every band (row) of `model` in place.
    pub fn convolve(&self, model: &mut Array2<f64>) -> Result<(), DeblendError> {
        let ops = self.per_band(model.nrows(), model.ncols())?;
        for (op, mut row) in ops.into_iter().zip(model.rows_mut()) {
            let convolved = match row.as_slice() {
                Some(slice) => op.mul_vec(slice),
                None => op.mul_vec(&row.to_vec()),
            };
            row.iter_mut().zip(convolved).for_each(|(v, c)| *v = c);
        }
        Ok(())
    }
}

/// Requires `op` to map `pixels`-long images to `pixels`-long images.
pub(crate) fn check_square(op: &SparseOp, pixels: usize, what: &'static str) -> Result<(), DeblendError> {
    if op.nrows() != pixels || op.ncols() != pixels {
        return Err(DeblendError::ShapeMismatch {
            what,
            expected: vec![pixels, pixels],
            actual: vec![op.nrows(), op.ncols()],
        });
    }
    Ok(())
}

/// Per-component translations and per-component, per-band transfer operators.
///
/// `gamma[k][b]` maps component `k`'s centered morphology to its
/// contribution in band `b`.
#[derive(Debug, Clone)]
pub struct TransferOps {
    pub tx: Vec<SparseOp>,
    pub ty: Vec<SparseOp>,
    pub gamma: Vec<Vec<SparseOp>>,
}

/// Builds the PSF operator(s) once per call.
///
/// A shared kernel yields a single operator reused for every band.
pub fn adapt_psf(
    psf: &Psf,
    bands: usize,
    shape: (usize, usize),
    threshold: f64,
    factory: &impl OperatorFactory,
) -> Result<PsfOp, DeblendError> {
    match psf {
        Psf::Shared(kernel) => Ok(PsfOp::Shared(factory.psf(kernel.view(), shape, threshold)?)),
        Psf::PerBand(kernels) => {
            let actual = kernels.dim().0;
            if actual != bands {
                return Err(DeblendError::BandMismatch {
                    expected: bands,
                    actual,
                });
            }
            let ops = kernels
                .outer_iter()
                .map(|kernel| factory.psf(kernel, shape, threshold))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(PsfOp::PerBand(ops))
        }
    }
}

/// `ty * psf * tx`, or `ty * tx` without a PSF.
pub fn compose(tx: &SparseOp, ty: &SparseOp, psf: Option<&SparseOp>) -> Result<SparseOp, DeblendError> {
    let inner = match psf {
        Some(p) => p.matmul(tx)?,
        None => tx.clone(),
    };
    Ok(ty.matmul(&inner)?)
}

/// Transfer operators of one component, one per band.
///
/// Without a PSF, or with a shared one, the product is formed once and
/// repeated for every band.
pub fn component_gamma(
    tx: &SparseOp,
    ty: &SparseOp,
    psf: Option<&PsfOp>,
    bands: usize,
) -> Result<Vec<SparseOp>, DeblendError> {
    match psf {
        None => Ok(vec![compose(tx, ty, None)?; bands]),
        Some(PsfOp::Shared(p)) => Ok(vec![compose(tx, ty, Some(p))?; bands]),
        Some(psf @ PsfOp::PerBand(_)) => psf
            .per_band(bands, tx.nrows())?
            .into_iter()
            .map(|p| compose(tx, ty, Some(p)))
            .collect(),
    }
}

/// Translation operators and transfer operators for every component.
///
/// Component `k` is shifted from the image center to its peak; a missing
/// peak means no shift.
pub fn translate_psfs(
    shape: (usize, usize),
    peaks: &[Option<Peak>],
    bands: usize,
    psf: Option<&PsfOp>,
    threshold: f64,
    factory: &impl OperatorFactory,
) -> Result<TransferOps, DeblendError> {
    let (cx, cy) = center(shape);
    let mut tx = Vec::with_capacity(peaks.len());
    let mut ty = Vec::with_capacity(peaks.len());
    let mut gamma = Vec::with_capacity(peaks.len());

    for peak in peaks {
        let (dx, dy) = match peak {
            Some(peak) => (peak.x - cx as f64, peak.y - cy as f64),
            None => (0.0, 0.0),
        };
        let translation = factory.translation(dx, dy, shape, threshold)?;
        let per_band = component_gamma(&translation.tx, &translation.ty, psf, bands)?;
        log::trace!("component {} shifted by ({dx}, {dy})", gamma.len());
        tx.push(translation.tx);
        ty.push(translation.ty);
        gamma.push(per_band);
    }

    Ok(TransferOps { tx, ty, gamma })
}

/// Transfer operators when translation is disabled: the PSF alone, or identity.
pub fn identity_transfer(
    components: usize,
    bands: usize,
    shape: (usize, usize),
    psf: Option<&PsfOp>,
) -> Result<Vec<Vec<SparseOp>>, DeblendError> {
    let pixels = shape.0 * shape.1;
    let per_band: Vec<SparseOp> = match psf {
        Some(psf) => psf.per_band(bands, pixels)?.into_iter().cloned().collect(),
        None => vec![SparseOp::identity(pixels); bands],
    };
    Ok(vec![per_band; components])
}

/// Checks the "both or neither" rule for translation operator lists.
pub(crate) fn paired<'a>(
    tx: Option<&'a [SparseOp]>,
    ty: Option<&'a [SparseOp]>,
) -> Result<Option<(&'a [SparseOp], &'a [SparseOp])>, DeblendError> {
    match (tx, ty) {
        (Some(tx), Some(ty)) => Ok(Some((tx, ty))),
        (None, None) => Ok(None),
        _ => Err(DeblendError::UnpairedTranslation),
    }
}
