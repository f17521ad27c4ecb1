use std::io;
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{self, Event, KeyCode};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Terminal;
use zmbridge_core::{EntityKind, EntityState, Freshness, Hub, RefreshState, Server};

struct ServerView {
    host: String,
    state: RefreshState,
    entities: Vec<EntityState>,
}

impl ServerView {
    fn capture(server: &Server) -> Self {
        Self {
            host: server.host().to_string(),
            state: server.coordinator().state(),
            entities: server.render(),
        }
    }
}

pub async fn run_viewer(hub: &Hub) -> Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut command_buffer = String::new();

    let run_result = async {
        loop {
            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    match key.code {
                        KeyCode::Char('q') => break,
                        KeyCode::Char(c) => {
                            command_buffer.push(c.to_ascii_lowercase());
                            if command_buffer.len() > 8 {
                                let drain = command_buffer.len() - 8;
                                command_buffer.drain(0..drain);
                            }
                            if command_buffer.ends_with("exit") {
                                break;
                            }
                        }
                        KeyCode::Backspace => {
                            command_buffer.pop();
                        }
                        _ => {}
                    }
                }
            }

            let views: Vec<ServerView> = hub.servers().map(ServerView::capture).collect();
            terminal.draw(|frame| draw_ui(frame.size(), frame, &views))?;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Ok::<(), anyhow::Error>(())
    }
    .await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    run_result
}

fn draw_ui(area: Rect, frame: &mut ratatui::Frame<'_>, views: &[ServerView]) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(views.len() as u16 + 3),
            Constraint::Min(0),
        ])
        .split(area);

    frame.render_widget(render_header(views), rows[0]);
    frame.render_widget(render_monitor_table(views), rows[1]);
}

fn render_header(views: &[ServerView]) -> Paragraph<'static> {
    let mut lines = vec![Line::from(vec![
        Span::styled("ZoneMinder Bridge  ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw("(press 'q' to quit)"),
    ])];

    if views.is_empty() {
        lines.push(Line::from("No servers configured"));
    }
    for view in views {
        let (label, color) = match view.state.freshness() {
            Freshness::Fresh => ("fresh", Color::Green),
            Freshness::Stale => ("stale", Color::Red),
        };
        let fetched = view
            .state
            .snapshot
            .as_ref()
            .map(|s| s.fetched_at.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let mut spans = vec![
            Span::raw(format!("{:<28} ", view.host)),
            Span::styled(format!("{label:<6}"), Style::default().fg(color)),
            Span::raw(format!(
                " fetched={fetched} ok={} err={}",
                view.state.cycles_ok, view.state.cycles_err
            )),
        ];
        if let Some(err) = &view.state.last_error {
            spans.push(Span::styled(format!("  {err}"), Style::default().fg(Color::Red)));
        }
        lines.push(Line::from(spans));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Servers"))
}

fn render_monitor_table(views: &[ServerView]) -> Table<'static> {
    let header = Row::new(["Server", "Entity", "Kind", "State", "Available"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = views
        .iter()
        .flat_map(|view| {
            view.entities
                .iter()
                .filter(|e| e.kind != EntityKind::Camera)
                .map(|entity| entity_row(&view.host, entity))
        })
        .collect();

    Table::new(
        rows,
        [
            Constraint::Percentage(20),
            Constraint::Percentage(35),
            Constraint::Percentage(12),
            Constraint::Percentage(23),
            Constraint::Percentage(10),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title("Entities"))
}

fn entity_row(host: &str, entity: &EntityState) -> Row<'static> {
    let state = entity
        .state
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let (available, color) = if entity.available {
        ("yes", Color::Green)
    } else {
        ("no", Color::Red)
    };

    Row::new(vec![
        Cell::from(host.to_string()),
        Cell::from(entity.name.clone()),
        Cell::from(entity.kind.as_str()),
        Cell::from(state),
        Cell::from(available).style(Style::default().fg(color)),
    ])
}
