//! Table output formatting for CLI commands
//!
//! Stage metrics and validation issues rendered with comfy-table.

use comfy_table::{presets, Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};
use std::env;

use crate::domain::models::{IssueSeverity, PipelineMetrics, StageId, ValidationIssue};

use super::truncate;

/// Table formatter for CLI output
pub struct TableFormatter {
    /// Whether to use colors in output
    use_colors: bool,
    /// Maximum width for tables (None = auto)
    max_width: Option<u16>,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    pub fn with_config(use_colors: bool, max_width: Option<u16>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// Per-stage counters, one row per stage that ran, plus a total row.
    pub fn format_stage_metrics(&self, metrics: &PipelineMetrics) -> String {
        let mut table = self.create_base_table();
        table.set_header(
            ["Stage", "Calls", "Attempts", "Failures", "Latency (ms)", "Tokens in", "Tokens out"]
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
        );

        for stage in StageId::ALL {
            let Some(m) = metrics.stages.get(&stage) else {
                continue;
            };
            let failures = if self.use_colors && m.failures > 0 {
                Cell::new(m.failures).fg(Color::Yellow)
            } else {
                Cell::new(m.failures)
            };
            table.add_row(vec![
                Cell::new(stage.as_str()),
                Cell::new(m.invocations).set_alignment(CellAlignment::Right),
                Cell::new(m.attempts).set_alignment(CellAlignment::Right),
                failures.set_alignment(CellAlignment::Right),
                Cell::new(m.total_latency_ms).set_alignment(CellAlignment::Right),
                Cell::new(m.input_tokens).set_alignment(CellAlignment::Right),
                Cell::new(m.output_tokens).set_alignment(CellAlignment::Right),
            ]);
        }

        let usage = metrics.total_usage();
        table.add_row(vec![
            Cell::new("total").add_attribute(Attribute::Bold),
            Cell::new(""),
            Cell::new(""),
            Cell::new(""),
            Cell::new(metrics.total_duration_ms).set_alignment(CellAlignment::Right),
            Cell::new(usage.input_tokens).set_alignment(CellAlignment::Right),
            Cell::new(usage.output_tokens).set_alignment(CellAlignment::Right),
        ]);

        table.to_string()
    }

    pub fn format_issues(&self, issues: &[ValidationIssue]) -> String {
        let mut table = self.create_base_table();
        table.set_header(
            ["Severity", "Step", "Location", "Issue", "Recurring"]
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold)),
        );

        for issue in issues {
            let severity = if self.use_colors {
                Cell::new(issue.severity.as_str()).fg(severity_color(issue.severity))
            } else {
                Cell::new(issue.severity.as_str())
            };
            table.add_row(vec![
                severity,
                Cell::new(&issue.step_id),
                Cell::new(issue.location.as_deref().unwrap_or("-")),
                Cell::new(truncate(&issue.message, 60)),
                Cell::new(if issue.recurrence { "yes" } else { "" }),
            ]);
        }

        table.to_string()
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if let Some(width) = self.max_width {
            table.set_width(width);
        }
        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn supports_color() -> bool {
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

fn severity_color(severity: IssueSeverity) -> Color {
    match severity {
        IssueSeverity::Blocking => Color::Red,
        IssueSeverity::Major => Color::Yellow,
        IssueSeverity::Minor => Color::Grey,
    }
}
