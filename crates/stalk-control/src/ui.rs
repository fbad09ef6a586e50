use crate::app::{App, Focus, Tone};
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph},
};
use stalk_core::SamplingInterval;

#[derive(Clone, Copy)]
struct Theme {
    text: Color,
    muted: Color,
    accent: Color,
    border: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn theme() -> Theme {
    Theme {
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(100, 116, 139),
        accent: Color::Rgb(56, 189, 248),
        border: Color::Rgb(71, 85, 105),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

pub fn render(frame: &mut ratatui::Frame, app: &App) {
    let theme = theme();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(frame.size());

    frame.render_widget(identity_field(app, theme), rows[0]);
    frame.render_widget(frequency_selector(app, theme), rows[1]);
    frame.render_widget(tracking_toggle(app, theme), rows[2]);
    frame.render_widget(delete_button(app, theme), rows[3]);
    frame.render_widget(status_line(app, theme), rows[4]);
    frame.render_widget(help(theme), rows[5]);
}

fn field_block(title: &'static str, focused: bool, theme: Theme) -> Block<'static> {
    let border = if focused { theme.accent } else { theme.border };
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .title(Span::styled(
            title,
            Style::default().fg(border).add_modifier(Modifier::BOLD),
        ))
}

fn identity_field(app: &App, theme: Theme) -> Paragraph<'static> {
    let focused = app.focus == Focus::Identity;
    let mut spans = vec![Span::styled(
        app.identity().to_string(),
        Style::default().fg(theme.text),
    )];
    if focused {
        spans.push(Span::styled("_", Style::default().fg(theme.accent)));
    }
    if app.check_pending() {
        spans.push(Span::styled("  checking...", Style::default().fg(theme.muted)));
    }
    Paragraph::new(Line::from(spans)).block(field_block("Name", focused, theme))
}

fn frequency_selector(app: &App, theme: Theme) -> Paragraph<'static> {
    let spans: Vec<Span<'static>> = SamplingInterval::ALL
        .iter()
        .flat_map(|interval| {
            let style = if *interval == app.interval {
                Style::default()
                    .fg(theme.accent)
                    .add_modifier(Modifier::BOLD | Modifier::REVERSED)
            } else {
                Style::default().fg(theme.muted)
            };
            [
                Span::styled(format!(" {interval} "), style),
                Span::raw(" "),
            ]
        })
        .collect();
    Paragraph::new(Line::from(spans)).block(field_block(
        "Frequency",
        app.focus == Focus::Frequency,
        theme,
    ))
}

fn tracking_toggle(app: &App, theme: Theme) -> Paragraph<'static> {
    let (label, color) = if app.launcher_busy {
        ("Working...", theme.warn)
    } else if app.running {
        ("Tracking: ON  [Enter to stop]", theme.ok)
    } else if app.can_start() {
        ("Tracking: OFF [Enter to start]", theme.text)
    } else {
        ("Tracking: OFF (enter a name first)", theme.muted)
    };
    Paragraph::new(Line::from(Span::styled(label, Style::default().fg(color)))).block(
        field_block("Tracking", app.focus == Focus::Tracking, theme),
    )
}

fn delete_button(app: &App, theme: Theme) -> Paragraph<'static> {
    let (label, color) = if app.delete_in_flight() {
        ("Deleting...".to_string(), theme.warn)
    } else if app.delete_enabled() {
        (format!("Delete data for {}", app.identity()), theme.critical)
    } else {
        ("Delete data (unavailable)".to_string(), theme.muted)
    };
    Paragraph::new(Line::from(Span::styled(label, Style::default().fg(color))))
        .block(field_block("Data", app.focus == Focus::Delete, theme))
}

fn status_line(app: &App, theme: Theme) -> Paragraph<'static> {
    let line = match &app.status {
        Some(status) => {
            let color = match status.tone {
                Tone::Info => theme.text,
                Tone::Ok => theme.ok,
                Tone::Error => theme.critical,
            };
            Line::from(Span::styled(status.text.clone(), Style::default().fg(color)))
        }
        None => Line::from(Span::styled("Ready", Style::default().fg(theme.muted))),
    };
    Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title("Status"),
    )
}

fn help(theme: Theme) -> Paragraph<'static> {
    Paragraph::new(Text::from(vec![Line::from(Span::styled(
        "Tab/Up/Down move  Left/Right frequency  Enter activate  Esc quit",
        Style::default().fg(theme.muted),
    ))]))
}
