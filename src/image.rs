use ndarray::{s, Array2, Array3};

use crate::error::DeblendError;
use crate::observer::{Diagnostic, Observer};

/// Known source position in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub x: f64,
    pub y: f64,
}

impl Peak {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Nearest pixel `(x, y)` inside a `(rows, cols)` grid, if any.
    pub fn pixel(&self, shape: (usize, usize)) -> Option<(usize, usize)> {
        let (rows, cols) = shape;
        let (x, y) = (self.x.round(), self.y.round());
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return None;
        }
        let (x, y) = (x as usize, y as usize);
        (x < cols && y < rows).then_some((x, y))
    }
}

/// Rejects peaks that do not land on a pixel of `shape`.
pub(crate) fn check_peaks(peaks: &[Option<Peak>], shape: (usize, usize)) -> Result<(), DeblendError> {
    for (component, peak) in peaks.iter().enumerate() {
        if let Some(peak) = peak {
            if peak.pixel(shape).is_none() {
                return Err(DeblendError::PeakOutOfBounds {
                    component,
                    x: peak.x,
                    y: peak.y,
                    rows: shape.0,
                    cols: shape.1,
                });
            }
        }
    }
    Ok(())
}

/// Multi-band image with optional per-pixel weights and sky background.
///
/// All three cubes are `(bands, rows, cols)` and always share one shape.
#[derive(Debug, Clone)]
pub struct Observation {
    images: Array3<f64>,
    weights: Option<Array3<f64>>,
    sky: Option<Array3<f64>>,
}

impl Observation {
    pub fn new(images: Array3<f64>) -> Self {
        Self {
            images,
            weights: None,
            sky: None,
        }
    }

    pub fn with_weights(mut self, weights: Array3<f64>) -> Result<Self, DeblendError> {
        check_same_shape("weights", &self.images, &weights)?;
        self.weights = Some(weights);
        Ok(self)
    }

    pub fn with_sky(mut self, sky: Array3<f64>) -> Result<Self, DeblendError> {
        check_same_shape("sky", &self.images, &sky)?;
        self.sky = Some(sky);
        Ok(self)
    }

    /// `(bands, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.images.dim()
    }

    pub fn images(&self) -> &Array3<f64> {
        &self.images
    }

    pub fn weights(&self) -> Option<&Array3<f64>> {
        self.weights.as_ref()
    }

    pub fn sky(&self) -> Option<&Array3<f64>> {
        self.sky.as_ref()
    }

    /// Pads (or truncates) every cube to odd rows and columns.
    pub fn oddified(self, truncate: bool, observer: &mut dyn Observer) -> Result<Self, DeblendError> {
        let from = self.shape();
        let to = oddify(from, truncate);
        if to == from {
            return Ok(self);
        }
        observer.on_diagnostic(&Diagnostic::Reshaped { from, to });
        let images = reshape_img(&self.images, Some(to), truncate, 0.0)?;
        let weights = self
            .weights
            .as_ref()
            .map(|w| reshape_img(w, Some(to), truncate, 0.0))
            .transpose()?;
        let sky = self
            .sky
            .as_ref()
            .map(|s| reshape_img(s, Some(to), truncate, 0.0))
            .transpose()?;
        Ok(Self {
            images,
            weights,
            sky,
        })
    }

    /// Sky-subtracted data, one flattened row per band.
    pub fn data(&self) -> Array2<f64> {
        match &self.sky {
            Some(sky) => flatten_bands(&(&self.images - sky)),
            None => flatten_bands(&self.images),
        }
    }

    /// Weights flattened like [`data`](Self::data).
    pub fn flat_weights(&self) -> Option<Array2<f64>> {
        self.weights.as_ref().map(flatten_bands)
    }
}

fn check_same_shape(what: &'static str, images: &Array3<f64>, other: &Array3<f64>) -> Result<(), DeblendError> {
    if images.shape() != other.shape() {
        return Err(DeblendError::ShapeMismatch {
            what,
            expected: images.shape().to_vec(),
            actual: other.shape().to_vec(),
        });
    }
    Ok(())
}

/// `(bands, rows, cols)` to `(bands, rows * cols)`, row-major pixels.
pub fn flatten_bands(cube: &Array3<f64>) -> Array2<f64> {
    let (bands, rows, cols) = cube.dim();
    Array2::from_shape_fn((bands, rows * cols), |(b, i)| cube[[b, i / cols, i % cols]])
}

/// Odd-sided version of `shape`, growing (or shrinking when `truncate`) even sides by one.
pub fn oddify(shape: (usize, usize, usize), truncate: bool) -> (usize, usize, usize) {
    let (bands, rows, cols) = shape;
    let fix = |n: usize| {
        if n % 2 == 1 {
            n
        } else if truncate && n > 0 {
            n - 1
        } else {
            n + 1
        }
    };
    (bands, fix(rows), fix(cols))
}

/// Copies `img` into a cube of `new_shape`, keeping the top-left overlap.
///
/// Rows/columns beyond the original are set to `fill`; rows/columns beyond
/// the new shape are dropped. Without `new_shape` the odd shape from
/// [`oddify`] is used.
pub fn reshape_img(
    img: &Array3<f64>,
    new_shape: Option<(usize, usize, usize)>,
    truncate: bool,
    fill: f64,
) -> Result<Array3<f64>, DeblendError> {
    let old_shape = img.dim();
    let new_shape = new_shape.unwrap_or_else(|| oddify(old_shape, truncate));
    if new_shape == old_shape {
        return Ok(img.clone());
    }
    if new_shape.0 != old_shape.0 {
        return Err(DeblendError::BandMismatch {
            expected: old_shape.0,
            actual: new_shape.0,
        });
    }

    let rows = old_shape.1.min(new_shape.1);
    let cols = old_shape.2.min(new_shape.2);
    let mut out = Array3::from_elem(new_shape, fill);
    out.slice_mut(s![.., ..rows, ..cols])
        .assign(&img.slice(s![.., ..rows, ..cols]));
    Ok(out)
}
