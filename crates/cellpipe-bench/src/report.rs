//! Per-module timing collected from the statuses a run yields.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::time::Duration;

use cellpipe_pipeline::{ExitStatus, RunStatus};
use serde::Serialize;

/// Accumulated `run` time of one module across every image set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleTiming {
    /// One-based module number.
    pub module_num: usize,
    /// Module name.
    pub module_name: String,
    /// Image sets the module ran on.
    pub steps: usize,
    /// Image sets on which the module failed.
    pub failures: usize,
    /// Sum of the module's `run` durations.
    #[serde(with = "cellpipe_pipeline::run::duration_serde")]
    pub total: Duration,
}

impl ModuleTiming {
    /// Mean time per step; zero when the module never ran.
    #[must_use]
    pub fn mean(&self) -> Duration {
        u32::try_from(self.steps)
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| self.total / n)
    }
}

/// Summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// How the run ended; `None` if it stopped on a structural error.
    pub exit_status: Option<ExitStatus>,
    /// Distinct image sets that reached at least one module.
    pub image_sets: usize,
    /// Timing per module, in pipeline order.
    pub modules: Vec<ModuleTiming>,
    /// Wall-clock duration of the whole run.
    #[serde(with = "cellpipe_pipeline::run::duration_serde")]
    pub total_duration: Duration,
}

impl RunReport {
    /// Fold the yielded statuses into per-module totals.
    #[must_use]
    pub fn from_statuses(statuses: &[RunStatus], exit_status: Option<ExitStatus>, total_duration: Duration) -> Self {
        let mut modules: Vec<ModuleTiming> = Vec::new();
        let mut images = BTreeSet::new();
        for status in statuses {
            images.insert(status.image_number);
            let index = if let Some(index) = modules.iter().position(|m| m.module_num == status.module_num) {
                index
            } else {
                modules.push(ModuleTiming {
                    module_num: status.module_num,
                    module_name: status.module_name.clone(),
                    steps: 0,
                    failures: 0,
                    total: Duration::ZERO,
                });
                modules.len() - 1
            };
            let timing = &mut modules[index];
            timing.steps += 1;
            timing.failures += usize::from(status.failed);
            timing.total += status.elapsed;
        }
        modules.sort_by_key(|m| m.module_num);
        Self {
            exit_status,
            image_sets: images.len(),
            modules,
            total_duration,
        }
    }

    /// Human-readable table.
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = String::new();
        let status = self.exit_status.map_or("Aborted", ExitStatus::as_str);
        let _ = writeln!(
            out,
            "Run: {status}, {} image sets in {:.3}ms",
            self.image_sets,
            self.total_duration.as_secs_f64() * 1000.0
        );
        let _ = writeln!(
            out,
            "{:<4} {:<28} {:>6} {:>8} {:>12} {:>12}",
            "#", "Module", "Steps", "Failed", "Total (ms)", "Mean (ms)"
        );
        let _ = writeln!(out, "{}", "-".repeat(75));
        for m in &self.modules {
            let _ = writeln!(
                out,
                "{:<4} {:<28} {:>6} {:>8} {:>12.3} {:>12.3}",
                m.module_num,
                m.module_name,
                m.steps,
                m.failures,
                m.total.as_secs_f64() * 1000.0,
                m.mean().as_secs_f64() * 1000.0
            );
        }
        out
    }
}

/// Aggregate statistics across several runs of the same pipeline.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn multi_run_summary(reports: &[RunReport]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Summary ({} runs)\n{}", reports.len(), "=".repeat(60));
    if reports.is_empty() {
        let _ = writeln!(out, "Warning: no runs to summarize");
        return out;
    }

    let durations: Vec<f64> = reports
        .iter()
        .map(|r| r.total_duration.as_secs_f64() * 1000.0)
        .collect();
    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;
    let _ = writeln!(out, "Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    let _ = writeln!(out);
    let _ = writeln!(out, "{:<28} {:>12}", "Module", "Mean (ms)");
    let _ = writeln!(out, "{}", "-".repeat(42));
    for first in &reports[0].modules {
        let totals: Vec<f64> = reports
            .iter()
            .filter_map(|r| r.modules.iter().find(|m| m.module_num == first.module_num))
            .map(|m| m.total.as_secs_f64() * 1000.0)
            .collect();
        if totals.is_empty() {
            continue;
        }
        let module_mean = totals.iter().sum::<f64>() / totals.len() as f64;
        let label = format!("{} {}", first.module_num, first.module_name);
        let _ = writeln!(out, "{label:<28} {module_mean:>10.3}ms");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(image_number: usize, module_num: usize, failed: bool, millis: u64) -> RunStatus {
        RunStatus {
            image_number,
            module_num,
            module_name: format!("M{module_num}"),
            failed,
            elapsed: Duration::from_millis(millis),
            ..RunStatus::default()
        }
    }

    #[test]
    fn statuses_fold_per_module() {
        let statuses = vec![
            status(1, 1, false, 4),
            status(1, 2, true, 2),
            status(2, 1, false, 6),
            status(2, 2, false, 2),
        ];
        let report = RunReport::from_statuses(&statuses, Some(ExitStatus::Complete), Duration::from_millis(20));
        assert_eq!(report.image_sets, 2);
        assert_eq!(report.modules.len(), 2);
        assert_eq!(report.modules[0].steps, 2);
        assert_eq!(report.modules[0].total, Duration::from_millis(10));
        assert_eq!(report.modules[0].mean(), Duration::from_millis(5));
        assert_eq!(report.modules[1].failures, 1);
        assert!(report.report().contains("Run: Complete, 2 image sets"));
    }

    #[test]
    fn unrun_module_has_zero_mean() {
        let timing = ModuleTiming {
            module_num: 1,
            module_name: "Idle".to_string(),
            steps: 0,
            failures: 0,
            total: Duration::ZERO,
        };
        assert_eq!(timing.mean(), Duration::ZERO);
    }

    #[test]
    fn summary_lists_modules_from_the_first_run() {
        let reports = vec![
            RunReport::from_statuses(&[status(1, 1, false, 2)], Some(ExitStatus::Complete), Duration::from_millis(3)),
            RunReport::from_statuses(&[status(1, 1, false, 4)], Some(ExitStatus::Complete), Duration::from_millis(5)),
        ];
        let summary = multi_run_summary(&reports);
        assert!(summary.starts_with("Summary (2 runs)"));
        assert!(summary.contains("min=3.000ms  mean=4.000ms  max=5.000ms"));
        assert!(summary.contains("1 M1"));
    }

    #[test]
    fn report_serializes_durations_as_seconds() {
        let report = RunReport::from_statuses(&[status(1, 1, false, 500)], None, Duration::from_secs(1));
        let json = serde_json::to_value(&report).unwrap_or_default();
        assert_eq!(json["total_duration"], 1.0);
        assert_eq!(json["modules"][0]["total"], 0.5);
        assert_eq!(json["exit_status"], serde_json::Value::Null);
    }
}
