//! Layout and rendering.

use super::app::{App, Mode, Tab};
use super::widgets::{
    editor::Editor, estimate::EstimatePanel, export, footer::Footer, header::Header,
    log::LogPanel, review, settings, table::ResultTable,
};
use crate::guard::{GatePhase, GuardSession};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

/// Renders the entire UI.
pub fn render(frame: &mut Frame, app: &App, session: &GuardSession) {
    let area = frame.area();

    let main_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),      // Header
            Constraint::Percentage(45), // Editor + estimate
            Constraint::Min(5),         // Preview / log
            Constraint::Length(1),      // Footer
        ])
        .split(area);

    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(main_layout[1]);

    let project = session.project();
    frame.render_widget(
        Header::new(project.as_deref(), session.location(), app.spinner.as_ref()),
        main_layout[0],
    );

    Editor::new(
        session.buffer().text(),
        app.cursor,
        session.buffer().revision(),
        app.mode == Mode::Editing,
    )
    .render(frame, top[0]);

    frame.render_widget(
        EstimatePanel::new(
            project.as_deref(),
            session.location(),
            session.phase(),
            session.current_estimate(),
            session.is_estimate_current(),
        ),
        top[1],
    );

    render_bottom(frame, main_layout[2], app, session);
    frame.render_widget(
        Footer::new(app.mode, session.in_flight().is_some()),
        main_layout[3],
    );

    match app.mode {
        Mode::Review => {
            if let Some(estimate) = session.current_estimate() {
                if session.phase() == GatePhase::PendingConfirmation {
                    let blocking = estimate
                        .review
                        .blocking_codes(session.rules().allow_warnings());
                    review::render_review_dialog(frame, estimate, &blocking, &app.review_input);
                }
            }
        }
        Mode::Export => {
            let rows = session.preview().map_or(0, |p| p.rows.len());
            export::render_export_dialog(frame, rows, session.has_result());
        }
        Mode::Settings => settings::render_settings_dialog(frame, &app.settings),
        Mode::Editing => {}
    }
}

fn tab_title(app: &App) -> Line<'static> {
    let active = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let inactive = Style::default().fg(Color::DarkGray);
    let (preview, log) = match app.tab {
        Tab::Preview => (active, inactive),
        Tab::Log => (inactive, active),
    };
    let mut spans = vec![
        Span::styled(" Preview ", preview),
        Span::raw("|"),
        Span::styled(" Log ", log),
    ];
    if let Some(rows) = app.export_progress {
        spans.push(Span::styled(
            format!(" exporting: {rows} rows "),
            Style::default().fg(Color::Yellow),
        ));
    }
    Line::from(spans)
}

fn render_bottom(frame: &mut Frame, area: Rect, app: &App, session: &GuardSession) {
    let block = Block::default().title(tab_title(app)).borders(Borders::ALL);
    let inner = block.inner(area);
    frame.render_widget(block, area);

    match app.tab {
        Tab::Log => frame.render_widget(LogPanel::new(&app.log), inner),
        Tab::Preview => match session.preview() {
            Some(preview) => frame.render_widget(
                ResultTable::new(preview).offset(app.preview_scroll),
                inner,
            ),
            None => frame.render_widget(
                Paragraph::new(Span::styled(
                    "No results yet. Review (Ctrl+R), approve, then run (Ctrl+G).",
                    Style::default().fg(Color::DarkGray),
                )),
                inner,
            ),
        },
    }
}
