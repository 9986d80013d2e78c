use core::fmt;

/// Why a component fell back to a random spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The component has no peak (garbage collector or unknown position).
    MissingPeak,
    /// The peak pixel carries no positive flux in any band.
    NoFlux,
}

/// Non-fatal events raised while preparing a deblend.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The observation was padded or truncated to odd dimensions.
    Reshaped {
        from: (usize, usize, usize),
        to: (usize, usize, usize),
    },
    /// A spectral column was initialised randomly.
    RandomSpectrum {
        component: usize,
        reason: FallbackReason,
    },
    /// A morphology row was initialised randomly.
    RandomMorphology { component: usize },
    /// Both sparsity thresholds were given; the L0 threshold is used.
    SparsityConflict { l0: f64, l1: f64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reshaped { from, to } => write!(f, "reshaped image from {from:?} to {to:?}"),
            Self::RandomSpectrum {
                component,
                reason: FallbackReason::MissingPeak,
            } => write!(f, "using random spectrum for peak {component}"),
            Self::RandomSpectrum {
                component,
                reason: FallbackReason::NoFlux,
            } => write!(f, "peak {component} has no flux, using random spectrum"),
            Self::RandomMorphology { component } => {
                write!(f, "using random morphology for peak {component}")
            }
            Self::SparsityConflict { l0, l1 } => {
                write!(f, "l1 threshold {l1} ignored in favor of l0 threshold {l0}")
            }
        }
    }
}

/// Receives diagnostics as they happen.
pub trait Observer {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic);
}

impl<O: Observer + ?Sized> Observer for &mut O {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        (**self).on_diagnostic(diagnostic);
    }
}

/// Forwards every diagnostic to the `log` facade at warn level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        log::warn!("{diagnostic}");
    }
}

/// Keeps every diagnostic in order of arrival.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    events: Vec<Diagnostic>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[Diagnostic] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Observer for DiagnosticLog {
    fn on_diagnostic(&mut self, diagnostic: &Diagnostic) {
        log::debug!("{diagnostic}");
        self.events.push(diagnostic.clone());
    }
}
