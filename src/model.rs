use std::borrow::Cow;

use ndarray::{Array2, Array3, ArrayView1, ArrayViewD, Ix2, Ix3};

use crate::error::DeblendError;
use crate::sparse::SparseOp;
use crate::transfer::{check_square, component_gamma, paired, PsfOp};

/// Predicted band stack for the whole blend, `(bands, rows * cols)`.
///
/// `s` may be flattened `(components, rows * cols)` or `(components, rows, cols)`.
/// With translations every component is passed through `ty * psf * tx`;
/// without them the model is the dense product `A * S`, convolved band by
/// band when a PSF is given.
pub fn get_model(
    a: &Array2<f64>,
    s: ArrayViewD<'_, f64>,
    tx: Option<&[SparseOp]>,
    ty: Option<&[SparseOp]>,
    psf: Option<&PsfOp>,
) -> Result<Array2<f64>, DeblendError> {
    let translations = paired(tx, ty)?;
    let (bands, components) = a.dim();
    let s = flatten_morphology(s, components)?;
    let n = s.ncols();

    let Some((tx, ty)) = translations else {
        let mut model = a.dot(&s);
        if let Some(psf) = psf {
            psf.convolve(&mut model)?;
        }
        return Ok(model);
    };
    check_translations(tx, ty, components, n)?;

    let mut model = Array2::zeros((bands, n));
    for k in 0..components {
        let gamma = component_gamma(&tx[k], &ty[k], psf, bands)?;
        let sk = s.row(k);
        let sk = contiguous(&sk);
        for b in 0..bands {
            accumulate(&gamma[b], a[[b, k]], &sk, model.row_mut(b));
        }
    }
    Ok(model)
}

/// Predicted band stack of component `k` alone, `(bands, rows * cols)`.
///
/// Summing this over every component reproduces [`get_model`].
pub fn get_peak_model(
    a: &Array2<f64>,
    s: ArrayViewD<'_, f64>,
    tx: Option<&[SparseOp]>,
    ty: Option<&[SparseOp]>,
    psf: Option<&PsfOp>,
    k: usize,
) -> Result<Array2<f64>, DeblendError> {
    let translations = paired(tx, ty)?;
    let (bands, components) = a.dim();
    if k >= components {
        return Err(DeblendError::ComponentCountMismatch {
            expected: components,
            actual: k + 1,
        });
    }
    let s = flatten_morphology(s, components)?;
    let n = s.ncols();
    let sk = s.row(k);
    let sk = contiguous(&sk);

    let mut model = Array2::zeros((bands, n));
    match translations {
        None => {
            let psf_ops = psf.map(|psf| psf.per_band(bands, n)).transpose()?;
            for b in 0..bands {
                let weight = a[[b, k]];
                match &psf_ops {
                    Some(ops) => accumulate(ops[b], weight, &sk, model.row_mut(b)),
                    None => model
                        .row_mut(b)
                        .iter_mut()
                        .zip(sk.iter())
                        .for_each(|(m, v)| *m = weight * v),
                }
            }
        }
        Some((tx, ty)) => {
            check_translations(tx, ty, components, n)?;
            let gamma = component_gamma(&tx[k], &ty[k], psf, bands)?;
            for b in 0..bands {
                accumulate(&gamma[b], a[[b, k]], &sk, model.row_mut(b));
            }
        }
    }
    Ok(model)
}

/// Reshapes a flattened `(bands, rows * cols)` model to `(bands, rows, cols)`.
pub fn reshape_model(model: Array2<f64>, shape: (usize, usize)) -> Result<Array3<f64>, DeblendError> {
    let (bands, n) = model.dim();
    let (rows, cols) = shape;
    if rows * cols != n {
        return Err(DeblendError::ShapeMismatch {
            what: "model",
            expected: vec![bands, rows * cols],
            actual: vec![bands, n],
        });
    }
    Ok(Array3::from_shape_fn((bands, rows, cols), |(b, y, x)| {
        model[[b, y * cols + x]]
    }))
}

/// Flattens a 2-D or 3-D morphology array to `(components, pixels)`.
pub(crate) fn flatten_morphology(
    s: ArrayViewD<'_, f64>,
    components: usize,
) -> Result<Array2<f64>, DeblendError> {
    let shape = s.shape().to_vec();
    let flat = match s.ndim() {
        2 => s
            .into_dimensionality::<Ix2>()
            .map(|s| s.to_owned())
            .ok(),
        3 => s.into_dimensionality::<Ix3>().ok().map(|s| {
            let (k, rows, cols) = s.dim();
            Array2::from_shape_fn((k, rows * cols), |(c, i)| s[[c, i / cols, i % cols]])
        }),
        _ => None,
    };
    match flat {
        Some(flat) if flat.nrows() == components => Ok(flat),
        _ => Err(DeblendError::ShapeMismatch {
            what: "morphology",
            expected: vec![components],
            actual: shape,
        }),
    }
}

/// One square translation pair per component, sized to the morphology pixels.
fn check_translations(
    tx: &[SparseOp],
    ty: &[SparseOp],
    components: usize,
    pixels: usize,
) -> Result<(), DeblendError> {
    for len in [tx.len(), ty.len()] {
        if len != components {
            return Err(DeblendError::ComponentCountMismatch {
                expected: components,
                actual: len,
            });
        }
    }
    for op in tx.iter().chain(ty) {
        check_square(op, pixels, "translation operator")?;
    }
    Ok(())
}

/// Borrows a 1-D view as a slice, copying only when it is strided.
pub(crate) fn contiguous<'a>(view: &'a ArrayView1<'_, f64>) -> Cow<'a, [f64]> {
    match view.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(view.to_vec()),
    }
}

/// `out += weight * op * x`.
pub(crate) fn accumulate(op: &SparseOp, weight: f64, x: &[f64], mut out: ndarray::ArrayViewMut1<'_, f64>) {
    if weight == 0.0 {
        return;
    }
    match out.as_slice_mut() {
        Some(out) => op.mul_vec_into(weight, x, out),
        None => {
            let mut buf = vec![0.0; op.nrows()];
            op.mul_vec_into(weight, x, &mut buf);
            out.iter_mut().zip(buf).for_each(|(o, v)| *o += v);
        }
    }
}
