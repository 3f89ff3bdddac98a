//! Live dashboard of a running scanner

use crate::proxy::geo::short_display;
use crate::proxy::models::{ProxyFilter, ProxyRecord};
use crate::scanner::stats::ScanningStatistics;
use crate::scanner::{Scanner, ScannerState};
use crate::store::ProxyStore;
use crate::Result;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::warn;

/// Rows shown per list
const MAX_LISTED_PROXIES: usize = 100;

const REFRESH_EVERY: Duration = Duration::from_secs(1);

/// Dashboard application state
pub struct Dashboard {
    scanner: Arc<Scanner>,
    state: ScannerState,
    stats: ScanningStatistics,
    configured_workers: usize,
    alive: Vec<ProxyRecord>,
    dead: Vec<ProxyRecord>,
    /// Selected list (0 = alive, 1 = dead)
    selected_list: usize,
    list_state: ListState,
    should_quit: bool,
}

impl Dashboard {
    pub fn new(scanner: Arc<Scanner>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            scanner,
            state: ScannerState::Stopped,
            stats: ScanningStatistics::default(),
            configured_workers: 0,
            alive: Vec::new(),
            dead: Vec::new(),
            selected_list: 0,
            list_state,
            should_quit: false,
        }
    }

    /// Run the TUI until the user quits
    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.run_app(&mut terminal).await;

        disable_raw_mode()?;
        execute!(
            terminal.backend_mut(),
            LeaveAlternateScreen,
            DisableMouseCapture
        )?;
        terminal.show_cursor()?;

        result
    }

    async fn refresh(&mut self) {
        self.state = self.scanner.state();
        self.stats = self.scanner.get_statistics();
        self.configured_workers = self.scanner.settings().num_scan_threads;

        let store = self.scanner.proxies().clone();
        match store
            .find_by(&ProxyFilter::alive().with_limit(MAX_LISTED_PROXIES))
            .await
        {
            Ok(alive) => self.alive = alive,
            Err(e) => warn!("Dashboard could not read alive proxies: {:#}", e),
        }
        match store
            .find_by(&ProxyFilter::dead().with_limit(MAX_LISTED_PROXIES))
            .await
        {
            Ok(dead) => self.dead = dead,
            Err(e) => warn!("Dashboard could not read dead proxies: {:#}", e),
        }
    }

    async fn run_app<B: Backend>(&mut self, terminal: &mut Terminal<B>) -> Result<()> {
        let mut last_refresh: Option<Instant> = None;

        loop {
            if last_refresh.map_or(true, |t| t.elapsed() >= REFRESH_EVERY) {
                self.refresh().await;
                last_refresh = Some(Instant::now());
            }

            terminal.draw(|f| self.ui(f))?;

            if event::poll(std::time::Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_input(key.code);
                        if self.should_quit {
                            break;
                        }
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    fn selected_len(&self) -> usize {
        if self.selected_list == 0 {
            self.alive.len()
        } else {
            self.dead.len()
        }
    }

    fn handle_input(&mut self, key: KeyCode) {
        match key {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.should_quit = true;
            }
            KeyCode::Tab => {
                self.selected_list = (self.selected_list + 1) % 2;
                self.list_state.select(Some(0));
            }
            KeyCode::Down => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(i) if i + 1 < len => i + 1,
                    _ => 0,
                };
                self.list_state.select(Some(i));
            }
            KeyCode::Up => {
                let len = self.selected_len();
                let i = match self.list_state.selected() {
                    Some(0) | None => len.saturating_sub(1),
                    Some(i) => i - 1,
                };
                self.list_state.select(Some(i));
            }
            _ => {}
        }
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Title
                Constraint::Length(3), // Worker gauge
                Constraint::Min(0),    // Proxy lists
                Constraint::Length(3), // Statistics
            ])
            .split(f.size());

        let title = Paragraph::new(format!("Proxy Scanner [{}]", self.state))
            .style(Style::default().fg(Color::Cyan))
            .alignment(Alignment::Center)
            .block(Block::default().borders(Borders::ALL));
        f.render_widget(title, chunks[0]);

        let gauge = Gauge::default()
            .block(Block::default().borders(Borders::ALL).title("Workers"))
            .gauge_style(Style::default().fg(Color::Green).bg(Color::Black))
            .percent(worker_percent(self.stats.active_workers, self.configured_workers))
            .label(format!(
                "{}/{} active",
                self.stats.active_workers, self.configured_workers
            ));
        f.render_widget(gauge, chunks[1]);

        let list_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
            .split(chunks[2]);

        render_proxy_list(
            f,
            list_chunks[0],
            "Fastest alive",
            &self.alive,
            Color::Green,
            if self.selected_list == 0 { Some(&mut self.list_state) } else { None },
        );
        render_proxy_list(
            f,
            list_chunks[1],
            "Dead",
            &self.dead,
            Color::Red,
            if self.selected_list == 1 { Some(&mut self.list_state) } else { None },
        );

        let status = Paragraph::new(stats_line(&self.stats))
            .style(Style::default().fg(Color::Yellow))
            .wrap(Wrap { trim: true })
            .block(Block::default().borders(Borders::ALL).title("Statistics | q quit, Tab switch"));
        f.render_widget(status, chunks[3]);
    }
}

fn render_proxy_list(
    f: &mut Frame,
    area: Rect,
    title: &str,
    records: &[ProxyRecord],
    color: Color,
    list_state: Option<&mut ListState>,
) {
    let items: Vec<ListItem> = records
        .iter()
        .map(|r| ListItem::new(record_line(r)).style(Style::default().fg(color)))
        .collect();

    let border_style = if list_state.is_some() {
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!("{} ({})", title, records.len()))
                .border_style(border_style),
        )
        .highlight_style(Style::default().bg(Color::DarkGray))
        .highlight_symbol(">> ");

    if let Some(state) = list_state {
        f.render_stateful_widget(list, area, state);
    } else {
        f.render_widget(list, area);
    }
}

fn worker_percent(active: usize, configured: usize) -> u16 {
    if configured == 0 {
        return 0;
    }
    ((active.min(configured) * 100) / configured) as u16
}

fn record_line(record: &ProxyRecord) -> String {
    let location = record
        .location
        .as_ref()
        .map(short_display)
        .unwrap_or_else(|| "Unknown".to_string());
    format!(
        "{} {:.0}ms {} {:.0}% {}",
        record.uri,
        record.speed * 1000.0,
        record.anonymity,
        record.reliability * 100.0,
        location
    )
}

fn stats_line(stats: &ScanningStatistics) -> String {
    format!(
        "Queue: {} | Blacklisted: {} | Checked: {} | Duplicates skipped: {}",
        stats.check_queue_size, stats.blacklisted_ips, stats.non_blacklisted_ips, stats.duplicate_skips
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{Anonymity, ProxyType, ValidationResult};

    #[test]
    fn test_worker_percent() {
        assert_eq!(worker_percent(0, 0), 0);
        assert_eq!(worker_percent(5, 10), 50);
        // retiring workers can briefly outnumber the target
        assert_eq!(worker_percent(12, 10), 100);
    }

    #[test]
    fn test_record_line() {
        let result = ValidationResult {
            speed: 0.25,
            anonymity: Anonymity::High,
            accessible: vec![],
            inaccessible: vec![],
        };
        let record = ProxyRecord::discovered("http://1.2.3.4:80", ProxyType::Http, result, 0.5, None);
        assert_eq!(record_line(&record), "http://1.2.3.4:80 250ms high 50% Unknown");
    }

    #[test]
    fn test_stats_line() {
        let stats = ScanningStatistics {
            check_queue_size: 3,
            blacklisted_ips: 1,
            non_blacklisted_ips: 9,
            active_workers: 4,
            duplicate_skips: 2,
        };
        assert_eq!(
            stats_line(&stats),
            "Queue: 3 | Blacklisted: 1 | Checked: 9 | Duplicates skipped: 2"
        );
    }
}
