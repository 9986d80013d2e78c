use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// Both factors and every constraint residual settled within tolerance.
    Converged,
    MaxIterations,
    /// A step size or factor became non-finite.
    NumericalFailure,
}

#[derive(Debug, Clone)]
pub struct SolverStats {
    pub status: SolveStatus,
    pub iterations: usize,
    pub objective: f64,
    /// Relative change of A in the last iteration.
    pub delta_a: f64,
    /// Relative change of S in the last iteration.
    pub delta_s: f64,
    /// Largest relative primal residual over the linear constraints.
    pub residual: f64,
}

/// State of the factorization after one A-then-S sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    pub iteration: usize,
    pub objective: f64,
    pub delta_a: f64,
    pub delta_s: f64,
    pub step_a: f64,
    pub step_s: f64,
    pub residual: f64,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self) {}
}

/// Collects iterations and prints them as one table when the solve ends.
pub struct StdoutReporter {
    rows: Vec<IterationReport>,
    every: usize,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            every: 1,
        }
    }

    /// Keeps only every `every`-th iteration in the table.
    pub fn every(mut self, every: usize) -> Self {
        self.every = every.max(1);
        self
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        if report.iteration % self.every == 0 {
            self.rows.push(report.clone());
        }
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("objective").set_alignment(CellAlignment::Right),
            Cell::new("dA").set_alignment(CellAlignment::Right),
            Cell::new("dS").set_alignment(CellAlignment::Right),
            Cell::new("step A").set_alignment(CellAlignment::Right),
            Cell::new("step S").set_alignment(CellAlignment::Right),
            Cell::new("residual").set_alignment(CellAlignment::Right),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.objective)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.delta_a)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.delta_s)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.step_a)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.2e}", row.step_s)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.1e}", row.residual)).set_alignment(CellAlignment::Right),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(iteration: usize) -> IterationReport {
        IterationReport {
            iteration,
            objective: 1.0 / (iteration + 1) as f64,
            delta_a: 0.1,
            delta_s: 0.2,
            step_a: 0.9,
            step_s: 0.45,
            residual: 0.0,
        }
    }

    #[test]
    fn reporter_thins_and_flushes_rows() {
        let mut reporter = StdoutReporter::new().every(5);
        for i in 0..12 {
            reporter.on_iteration(&report(i));
        }
        assert_eq!(reporter.rows.len(), 3);
        reporter.on_finish();
        assert!(reporter.rows.is_empty());
    }
}
