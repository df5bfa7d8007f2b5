//! Estimate panel: dry-run metrics, review findings and the gate phase.

use crate::guard::{Estimate, GatePhase};
use crate::policy::{Finding, Severity};
use ratatui::{
    layout::Rect,
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Widget, Wrap},
};

pub fn severity_style(severity: Severity) -> Style {
    match severity {
        Severity::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        Severity::Warn => Style::default().fg(Color::Yellow),
        Severity::Info => Style::default().fg(Color::Gray),
    }
}

pub fn finding_line(finding: &Finding) -> Line<'static> {
    Line::from(vec![
        Span::styled(format!("{:<5} ", finding.severity), severity_style(finding.severity)),
        Span::raw(format!("{} {}", finding.code, finding.message)),
    ])
}

fn phase_style(phase: GatePhase) -> Style {
    match phase {
        GatePhase::Approved => Style::default().fg(Color::Green).add_modifier(Modifier::BOLD),
        GatePhase::PendingConfirmation => Style::default().fg(Color::Yellow),
        GatePhase::Invalidated => Style::default().fg(Color::Red),
        _ => Style::default(),
    }
}

pub struct EstimatePanel<'a> {
    project: Option<&'a str>,
    location: &'a str,
    phase: GatePhase,
    estimate: Option<&'a Estimate>,
    current: bool,
}

impl<'a> EstimatePanel<'a> {
    pub fn new(
        project: Option<&'a str>,
        location: &'a str,
        phase: GatePhase,
        estimate: Option<&'a Estimate>,
        current: bool,
    ) -> Self {
        Self {
            project,
            location,
            phase,
            estimate,
            current,
        }
    }

    fn label(name: &str, value: String) -> Line<'static> {
        Line::from(vec![
            Span::styled(format!("{name:<11}"), Style::default().fg(Color::DarkGray)),
            Span::raw(value),
        ])
    }

    pub fn lines(&self) -> Vec<Line<'static>> {
        let mut lines = vec![
            Self::label("Project", self.project.unwrap_or("(none)").to_string()),
            Self::label("Location", self.location.to_string()),
            Line::from(vec![
                Span::styled(format!("{:<11}", "Phase"), Style::default().fg(Color::DarkGray)),
                Span::styled(self.phase.to_string(), phase_style(self.phase)),
            ]),
        ];

        let Some(estimate) = self.estimate else {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "No estimate yet (Ctrl+E)",
                Style::default().fg(Color::DarkGray),
            )));
            return lines;
        };

        let mut bytes = estimate.bytes_human();
        if !self.current {
            bytes.push_str(" (stale)");
        }
        lines.push(Self::label("Bytes", bytes));
        if let Some(rows) = estimate.row_estimate {
            lines.push(Self::label("Rows (est)", rows.to_string()));
        }
        if let Some(kind) = &estimate.statement_type {
            lines.push(Self::label("Statement", kind.clone()));
        }
        lines.push(Self::label("Fingerprint", estimate.fingerprint.short().to_string()));
        let tables = if estimate.referenced_tables.is_empty() {
            "(none)".to_string()
        } else {
            estimate
                .referenced_tables
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        lines.push(Self::label("Tables", tables));

        if !estimate.review.partition_summary.is_empty() {
            lines.push(Line::from(""));
            lines.push(Line::from(Span::styled(
                "Partitions",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            for summary in &estimate.review.partition_summary {
                lines.push(Line::from(format!("  {summary}")));
            }
        }

        lines.push(Line::from(""));
        if estimate.review.findings.is_empty() {
            lines.push(Line::from(Span::styled(
                "No findings",
                Style::default().fg(Color::Green),
            )));
        } else {
            for finding in &estimate.review.findings {
                lines.push(finding_line(finding));
            }
        }
        lines
    }
}

impl Widget for EstimatePanel<'_> {
    fn render(self, area: Rect, buf: &mut ratatui::buffer::Buffer) {
        let block = Block::default().title(" Estimate ").borders(Borders::ALL);
        Paragraph::new(self.lines())
            .block(block)
            .wrap(Wrap { trim: false })
            .render(area, buf);
    }
}
