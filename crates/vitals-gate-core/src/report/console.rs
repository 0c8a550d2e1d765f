//! Console reporter for run summaries
//!
//! Provides human-readable output with ASCII tables and status indicators.

use anyhow::Result;
use std::fmt::Write;

use crate::metrics::{CLS, FCP, LCP, SCORE, TBT};
use crate::runner::RunSummary;
use crate::task::AuditResult;

/// Console format reporter
pub struct ConsoleReporter;

impl ConsoleReporter {
    /// Format a run summary for console output
    pub fn format(summary: &RunSummary) -> Result<String> {
        let mut output = String::new();

        writeln!(output)?;
        writeln!(output, "╔══════════════════════════════════════════════════════════════╗")?;
        writeln!(output, "║                      AUDIT RESULTS                           ║")?;
        writeln!(output, "╚══════════════════════════════════════════════════════════════╝")?;
        writeln!(output)?;

        writeln!(output, "Started:   {}", summary.start_time)?;
        writeln!(output, "Duration:  {}ms", summary.duration_ms)?;
        writeln!(
            output,
            "Tasks:     {} total, {} completed, {} failed",
            summary.total_tasks, summary.completed_tasks, summary.failed_tasks
        )?;
        writeln!(output)?;

        if !summary.task_results.is_empty() {
            writeln!(output, "  ┌──────────────────────┬──────────────┬────────┬────────┬────────┬────────┬───────┬───┐")?;
            writeln!(output, "  │ Target               │ Profile      │  LCP   │  FCP   │  TBT   │  CLS   │ Score │   │")?;
            writeln!(output, "  ├──────────────────────┼──────────────┼────────┼────────┼────────┼────────┼───────┼───┤")?;
            for result in &summary.task_results {
                Self::format_result_row(&mut output, result)?;
            }
            writeln!(output, "  └──────────────────────┴──────────────┴────────┴────────┴────────┴────────┴───────┴───┘")?;
        }

        writeln!(output)?;
        writeln!(output, "────────────────────────────────────────────────────────────────")?;
        let status = if summary.passed { "PASSED" } else { "FAILED" };
        let status_symbol = if summary.passed { "✓" } else { "✗" };
        writeln!(output, "Overall Status: {} {}", status_symbol, status)?;

        let failures = summary.failures();
        if !failures.is_empty() {
            writeln!(output)?;
            writeln!(output, "Failures:")?;
            for failure in &failures {
                writeln!(output, "  • {}", failure)?;
            }
        }

        writeln!(output)?;
        Ok(output)
    }

    fn format_result_row(output: &mut String, result: &AuditResult) -> Result<()> {
        let millis = |name: &str| {
            result
                .metrics
                .get(name)
                .map_or_else(|| "-".to_string(), |v| format!("{:.0}", v))
        };
        let cls = result
            .metrics
            .get(CLS)
            .map_or_else(|| "-".to_string(), |v| format!("{:.3}", v));
        let symbol = if result.passed() { "✓" } else { "✗" };

        writeln!(
            output,
            "  │ {:<20} │ {:<12} │ {:>6} │ {:>6} │ {:>6} │ {:>6} │ {:>5} │ {} │",
            truncate(&result.target, 20),
            truncate(&result.profile, 12),
            millis(LCP),
            millis(FCP),
            millis(TBT),
            cls,
            millis(SCORE),
            symbol
        )?;
        Ok(())
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width - 1).collect();
    out.push('…');
    out
}
