use ndarray::{s, Array2, Array3};
use rand::Rng;

use crate::error::DeblendError;
use crate::image::{check_peaks, Peak};
use crate::observer::{Diagnostic, FallbackReason, Observer};
use crate::operators::center;
use crate::prox::Prox;

/// Keeps an initial morphology spike strictly positive.
const TINY: f64 = 1e-10;

/// Initial spectra `(bands, components)` sampled at each peak.
///
/// Components without a peak, or whose peak pixel is non-positive in every
/// band, get a random spectrum. Every column is projected onto the unit simplex.
pub fn init_spectral(
    image: &Array3<f64>,
    peaks: &[Option<Peak>],
    rng: &mut impl Rng,
    observer: &mut dyn Observer,
) -> Result<Array2<f64>, DeblendError> {
    let (bands, rows, cols) = image.dim();
    check_peaks(peaks, (rows, cols))?;

    let mut a = Array2::zeros((bands, peaks.len()));
    for (k, peak) in peaks.iter().enumerate() {
        let sampled = peak
            .and_then(|p| p.pixel((rows, cols)))
            .map(|(x, y)| image.slice(s![.., y, x]).to_owned());
        let mut column = a.column_mut(k);
        match sampled {
            Some(sed) if sed.iter().any(|v| *v > 0.0) => column.assign(&sed),
            sampled => {
                let reason = if sampled.is_some() {
                    FallbackReason::NoFlux
                } else {
                    FallbackReason::MissingPeak
                };
                observer.on_diagnostic(&Diagnostic::RandomSpectrum {
                    component: k,
                    reason,
                });
                column.iter_mut().for_each(|v| *v = rng.gen::<f64>());
            }
        }
    }
    Ok(Prox::UnityPlus.apply(a, 0.0))
}

/// Initial morphologies `(components, rows * cols)`.
///
/// A component with a peak starts as a single spike at the image center,
/// valued at the mean band intensity of its peak pixel. Components without
/// a peak start as random noise.
pub fn init_morphology(
    image: &Array3<f64>,
    peaks: &[Option<Peak>],
    rng: &mut impl Rng,
    observer: &mut dyn Observer,
) -> Result<Array2<f64>, DeblendError> {
    let (_, rows, cols) = image.dim();
    check_peaks(peaks, (rows, cols))?;
    let (cx, cy) = center((rows, cols));
    let spike = cy * cols + cx;

    let mut s = Array2::zeros((peaks.len(), rows * cols));
    for (k, peak) in peaks.iter().enumerate() {
        match peak.and_then(|p| p.pixel((rows, cols))) {
            Some((x, y)) => {
                let mean = image.slice(s![.., y, x]).mean().unwrap_or(0.0);
                s[[k, spike]] = mean.abs() + TINY;
            }
            None => {
                observer.on_diagnostic(&Diagnostic::RandomMorphology { component: k });
                s.row_mut(k).iter_mut().for_each(|v| *v = rng.gen::<f64>());
            }
        }
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::DiagnosticLog;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn image() -> Array3<f64> {
        let mut img = Array3::zeros((2, 5, 5));
        img[[0, 1, 3]] = 3.0;
        img[[1, 1, 3]] = 1.0;
        img[[0, 4, 0]] = -2.0;
        img[[1, 4, 0]] = -4.0;
        img
    }

    #[test]
    fn spectra_come_from_peak_pixels() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut log = DiagnosticLog::new();
        let peaks = [Some(Peak::new(3.0, 1.0)), Some(Peak::new(0.0, 2.0)), None];
        let a = init_spectral(&image(), &peaks, &mut rng, &mut log).unwrap();

        assert_eq!(a.dim(), (2, 3));
        // (3, 1) projected onto the simplex
        assert_abs_diff_eq!(a[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a[[1, 0]], 0.0, epsilon = 1e-12);
        for col in a.columns() {
            assert_abs_diff_eq!(col.sum(), 1.0, epsilon = 1e-12);
            assert!(col.iter().all(|v| *v >= 0.0));
        }
        assert_eq!(
            log.events(),
            &[
                Diagnostic::RandomSpectrum {
                    component: 1,
                    reason: FallbackReason::NoFlux
                },
                Diagnostic::RandomSpectrum {
                    component: 2,
                    reason: FallbackReason::MissingPeak
                },
            ]
        );
    }

    #[test]
    fn mixed_sign_sample_keeps_its_positive_band() {
        let mut img = image();
        img[[0, 2, 2]] = 3.0;
        img[[1, 2, 2]] = -5.0;
        let mut rng = StdRng::seed_from_u64(4);
        let mut log = DiagnosticLog::new();
        let a = init_spectral(&img, &[Some(Peak::new(2.0, 2.0))], &mut rng, &mut log).unwrap();

        assert_abs_diff_eq!(a[[0, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a[[1, 0]], 0.0, epsilon = 1e-12);
        assert!(log.is_empty());
    }

    #[test]
    fn morphology_starts_as_center_spike() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut log = DiagnosticLog::new();
        let peaks = [Some(Peak::new(3.0, 1.0)), Some(Peak::new(0.0, 4.0)), None];
        let s = init_morphology(&image(), &peaks, &mut rng, &mut log).unwrap();

        assert_eq!(s.dim(), (3, 25));
        assert_abs_diff_eq!(s[[0, 12]], 2.0 + 1e-10, epsilon = 1e-15);
        assert_eq!(s.row(0).iter().filter(|v| **v != 0.0).count(), 1);
        // negative mean still gives a positive spike
        assert_abs_diff_eq!(s[[1, 12]], 3.0 + 1e-10, epsilon = 1e-15);
        assert!(s.row(2).iter().all(|v| (0.0..1.0).contains(v)));
        assert_eq!(log.events(), &[Diagnostic::RandomMorphology { component: 2 }]);
    }

    #[test]
    fn seeded_fallbacks_are_reproducible() {
        let peaks = [None, None];
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut log = DiagnosticLog::new();
            init_spectral(&image(), &peaks, &mut rng, &mut log).unwrap()
        };
        assert_eq!(run(9), run(9));
        assert_ne!(run(9), run(10));
    }

    #[test]
    fn peaks_outside_the_image_are_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut log = DiagnosticLog::new();
        let peaks = [Some(Peak::new(7.0, 1.0))];
        assert!(matches!(
            init_morphology(&image(), &peaks, &mut rng, &mut log),
            Err(DeblendError::PeakOutOfBounds { component: 0, .. })
        ));
    }
}
