use crate::console::{ConsoleView, LineKind, TerminalLine};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph},
};

#[derive(Clone, Copy)]
struct ConsoleTheme {
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    critical: Color,
    info: Color,
}

fn console_theme() -> ConsoleTheme {
    ConsoleTheme {
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

pub fn render_ui(frame: &mut ratatui::Frame, view: &ConsoleView) {
    let size = frame.size();
    let theme = console_theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(size);
    frame.render_widget(render_header(view, theme, size.width), layout[0]);
    render_terminal(frame, view, theme, layout[1]);
}

fn render_header(view: &ConsoleView, theme: ConsoleTheme, width: u16) -> Paragraph<'static> {
    let inner_width = (width.saturating_sub(4) as usize).max(12);
    let note = match view.note.as_deref() {
        Some(note) => Span::styled(
            ellipsize(note, inner_width),
            Style::default().fg(theme.accent),
        ),
        None => Span::styled(
            ellipsize("Enter send, Ctrl-C interrupt, Esc quit", inner_width),
            Style::default().fg(theme.muted),
        ),
    };
    Paragraph::new(Text::from(vec![
        Line::from(Span::styled(
            ellipsize(&view.status, inner_width),
            Style::default().fg(theme.text),
        )),
        Line::from(note),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .style(Style::default().bg(theme.surface))
            .title(Span::styled(
                view.title.clone(),
                Style::default()
                    .fg(theme.title)
                    .add_modifier(Modifier::BOLD),
            )),
    )
}

fn render_terminal(frame: &mut ratatui::Frame, view: &ConsoleView, theme: ConsoleTheme, area: Rect) {
    let visible = area.height.saturating_sub(2) as usize;
    let start = view.lines.len().saturating_sub(visible);
    let lines: Vec<Line<'static>> = view.lines[start..]
        .iter()
        .map(|line| styled_line(line, theme))
        .collect();
    let shown = lines.len();

    let paragraph = Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .style(Style::default().bg(theme.surface)),
        );
    frame.render_widget(paragraph, area);

    if shown == 0 || area.width < 3 {
        return;
    }
    // the prompt is always the last visible line
    let max_x = area.x + area.width.saturating_sub(2);
    let x = (area.x + 1).saturating_add(view.caret as u16).min(max_x);
    let y = area.y + shown as u16;
    frame.set_cursor(x, y);
}

fn styled_line(line: &TerminalLine, theme: ConsoleTheme) -> Line<'static> {
    let style = match line.kind {
        LineKind::Output => Style::default().fg(theme.text),
        LineKind::InputEcho => Style::default().fg(theme.muted),
        LineKind::Prompt => Style::default()
            .fg(theme.accent)
            .add_modifier(Modifier::BOLD),
        LineKind::Notice => Style::default().fg(theme.info),
        LineKind::Error => Style::default().fg(theme.critical),
    };
    Line::from(Span::styled(line.content.clone(), style))
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return "...".chars().take(max).collect();
    }
    let prefix: String = input.chars().take(max - 3).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::{backend::TestBackend, Terminal};

    fn view(lines: Vec<TerminalLine>) -> ConsoleView {
        ConsoleView {
            title: "Qube console: web-1".to_string(),
            status: "State: ready".to_string(),
            note: None,
            lines,
            caret: 2,
        }
    }

    fn rendered(terminal: &Terminal<TestBackend>) -> String {
        let buffer = terminal.backend().buffer();
        let width = buffer.area.width as usize;
        buffer
            .content
            .chunks(width)
            .map(|row| row.iter().map(|cell| cell.symbol()).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn ellipsize_truncates_long_text() {
        assert_eq!(ellipsize("short", 10), "short");
        assert_eq!(ellipsize("abcdefghij", 6), "abc...");
        assert_eq!(ellipsize("abcdefghij", 2), "..");
    }

    #[test]
    fn header_and_latest_lines_are_drawn() {
        let backend = TestBackend::new(48, 10);
        let mut terminal = Terminal::new(backend).expect("terminal");
        let mut lines: Vec<TerminalLine> = (0..20)
            .map(|idx| TerminalLine {
                content: format!("line {idx}"),
                kind: LineKind::Output,
            })
            .collect();
        lines.push(TerminalLine {
            content: "$ ".to_string(),
            kind: LineKind::Prompt,
        });
        let view = view(lines);
        terminal
            .draw(|frame| render_ui(frame, &view))
            .expect("draw");

        let screen = rendered(&terminal);
        assert!(screen.contains("Qube console: web-1"));
        assert!(screen.contains("State: ready"));
        assert!(screen.contains("line 19"));
        assert!(!screen.contains("line 0 "));
    }
}
