use core::fmt;

use crate::sparse::SparseError;

/// Errors raised by the deblender before or during a call.
///
/// Every variant is fatal for the call that produced it; recoverable
/// conditions are reported through an [`Observer`](crate::Observer) instead.
#[derive(Debug, Clone, PartialEq)]
pub enum DeblendError {
    /// Exactly one of the x/y translation operator lists was supplied.
    UnpairedTranslation,
    /// A shape that needs a center pixel has an even side.
    EvenShape { rows: usize, cols: usize },
    /// A constraint symbol outside "SMmXY".
    UnknownConstraint(char),
    /// A gradient target other than "A" or "S".
    UnknownFactor(String),
    /// Two arrays that must agree in shape do not.
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    /// Reshape requested a different number of bands.
    BandMismatch { expected: usize, actual: usize },
    /// A per-component list does not have one entry per component.
    ComponentCountMismatch { expected: usize, actual: usize },
    /// A peak lies outside the image.
    PeakOutOfBounds {
        component: usize,
        x: f64,
        y: f64,
        rows: usize,
        cols: usize,
    },
    /// Neither peaks nor garbage collectors were requested.
    NoComponents,
    /// A sparse operator could not be built.
    Sparse(SparseError),
}

impl fmt::Display for DeblendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnpairedTranslation => {
                write!(f, "expected both x and y translations or neither")
            }
            Self::EvenShape { rows, cols } => {
                write!(f, "shape must have an odd width and height, got ({rows}, {cols})")
            }
            Self::UnknownConstraint(c) => {
                write!(f, "each constraint should be one of 'SMmXY', got '{c}'")
            }
            Self::UnknownFactor(name) => {
                write!(f, "expected either 'A' or 'S' as gradient target, got '{name}'")
            }
            Self::ShapeMismatch {
                what,
                expected,
                actual,
            } => {
                write!(f, "{what} has shape {actual:?}, expected {expected:?}")
            }
            Self::BandMismatch { expected, actual } => {
                write!(f, "old and new shape must have the same bands: {expected} != {actual}")
            }
            Self::ComponentCountMismatch { expected, actual } => {
                write!(f, "expected {expected} per-component entries, got {actual}")
            }
            Self::PeakOutOfBounds {
                component,
                x,
                y,
                rows,
                cols,
            } => {
                write!(
                    f,
                    "peak {component} at ({x}, {y}) lies outside the {rows}x{cols} image"
                )
            }
            Self::NoComponents => write!(f, "no peaks and no garbage collectors to fit"),
            Self::Sparse(err) => write!(f, "sparse operator error: {err}"),
        }
    }
}

impl std::error::Error for DeblendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sparse(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SparseError> for DeblendError {
    fn from(err: SparseError) -> Self {
        Self::Sparse(err)
    }
}

/// Fails with [`DeblendError::EvenShape`] unless both sides are odd.
pub(crate) fn require_odd(shape: (usize, usize)) -> Result<(), DeblendError> {
    let (rows, cols) = shape;
    if rows % 2 == 0 || cols % 2 == 0 {
        return Err(DeblendError::EvenShape { rows, cols });
    }
    Ok(())
}
