use std::io::{self, Stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vpsdeck::lifecycle::can_stop;
use vpsdeck::mutation::MutationKind;
use vpsdeck::poller::{LogView, PollerHandle};
use vpsdeck::variant::{Variant, resolve_variant};
use vpsdeck::Engine;
use vpsdeck_common::Session;

const TICK: Duration = Duration::from_millis(250);

pub struct Dashboard {
    engine: Engine,
    sessions: Vec<Session>,
    list_state: ListState,
    poller: Option<PollerHandle>,
    notice: String,
    notices: (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>),
    should_quit: bool,
}

impl Dashboard {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            sessions: Vec::new(),
            list_state: ListState::default(),
            poller: None,
            notice: String::new(),
            notices: mpsc::unbounded_channel(),
            should_quit: false,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        let result = self.event_loop(&mut terminal).await;

        disable_raw_mode()?;
        execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
        terminal.show_cursor()?;

        result
    }

    async fn event_loop(&mut self, terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
        let cancel = CancellationToken::new();
        let refresher = tokio::spawn({
            let engine = self.engine.clone();
            let cancel = cancel.clone();
            async move { engine.run_session_refresh(cancel).await }
        });
        let wallet_engine = self.engine.clone();
        tokio::spawn(async move {
            let _ = wallet_engine.refresh_wallet().await;
        });

        let mut keys = spawn_key_reader(cancel.clone());
        let mut sessions_rx = self.engine.sessions_view();
        let mut tick = tokio::time::interval(TICK);

        while !self.should_quit {
            terminal.draw(|f| self.ui(f))?;

            tokio::select! {
                Some(key) = keys.recv() => self.on_key(key),
                changed = sessions_rx.changed() => {
                    if changed.is_ok() {
                        let list = sessions_rx.borrow_and_update().data.clone().unwrap_or_default();
                        self.set_sessions(list);
                    }
                }
                Some(notice) = self.notices.1.recv() => self.notice = notice,
                _ = tick.tick() => {}
            }
        }

        cancel.cancel();
        self.poller = None;
        let _ = refresher.await;
        Ok(())
    }

    fn set_sessions(&mut self, sessions: Vec<Session>) {
        let previous = self.selected_id();
        self.sessions = sessions;
        let index = previous
            .and_then(|id| self.sessions.iter().position(|s| s.id == id))
            .or(if self.sessions.is_empty() { None } else { Some(0) });
        self.select(index);
    }

    fn selected(&self) -> Option<&Session> {
        self.list_state.selected().and_then(|i| self.sessions.get(i))
    }

    fn selected_id(&self) -> Option<String> {
        self.selected().map(|s| s.id.clone())
    }

    fn select(&mut self, index: Option<usize>) {
        let before = self.selected_id();
        self.list_state.select(index);
        let after = self.selected_id();
        if before != after || self.poller.is_none() {
            // Dropping the old handle cancels its poller.
            self.poller = after.map(|id| self.engine.watch_log(&id));
        }
    }

    fn move_selection(&mut self, delta: isize) {
        if self.sessions.is_empty() {
            return;
        }
        let current = self.list_state.selected().unwrap_or(0) as isize;
        let last = self.sessions.len() as isize - 1;
        let next = (current + delta).clamp(0, last) as usize;
        self.select(Some(next));
    }

    fn on_key(&mut self, key: KeyEvent) {
        if key.kind != KeyEventKind::Press {
            return;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('j') | KeyCode::Down => self.move_selection(1),
            KeyCode::Char('k') | KeyCode::Up => self.move_selection(-1),
            KeyCode::Char('r') => {
                if let Some(poller) = &self.poller {
                    poller.refresh_now();
                }
                self.engine.cache().invalidate(&vpsdeck::cache::CacheKey::Sessions);
            }
            KeyCode::Char('s') => self.stop_selected(),
            KeyCode::Char('L') => self.launch(Variant::Linux),
            KeyCode::Char('W') => self.launch(Variant::Windows),
            KeyCode::Char('w') => {
                let engine = self.engine.clone();
                let notices = self.notices.0.clone();
                tokio::spawn(async move {
                    let notice = match engine.refresh_wallet().await {
                        Ok(wallet) => format!("Balance: {} coins", wallet.balance),
                        Err(err) => format!("Wallet refresh failed: {}", err),
                    };
                    let _ = notices.send(notice);
                });
            }
            _ => {}
        }
    }

    fn launch(&mut self, variant: Variant) {
        // Claimed before spawning, so a second press is refused at once.
        if !self.engine.begin(&MutationKind::Launch) {
            self.notice = "A launch is already in progress".to_string();
            return;
        }
        self.notice = format!("Launching {}...", variant.label());
        let engine = self.engine.clone();
        let notices = self.notices.0.clone();
        tokio::spawn(async move {
            let notice = match engine.launch(variant).await {
                Ok(session) => format!("Session {} created ({})", session.id, session.status),
                Err(err) => format!("Launch failed: {}", err),
            };
            let _ = notices.send(notice);
        });
    }

    fn stop_selected(&mut self) {
        let Some(session) = self.selected().cloned() else {
            return;
        };
        let kind = MutationKind::Stop(session.id.clone());
        if !can_stop(&session) || !self.engine.begin(&kind) {
            return;
        }
        self.notice = format!("Stopping {}...", session.id);
        let engine = self.engine.clone();
        let notices = self.notices.0.clone();
        tokio::spawn(async move {
            let notice = match engine.stop(&session.id).await {
                Ok(stopped) => format!("Session {} is now {}", stopped.id, stopped.status),
                Err(err) => format!("Stop failed: {}", err),
            };
            let _ = notices.send(notice);
        });
    }

    fn ui(&mut self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Body
                Constraint::Length(3), // Footer
            ])
            .split(f.size());

        let wallet = match self.engine.cache().wallet().data() {
            Some(wallet) => format!("{} coins", wallet.balance),
            None => "-".to_string(),
        };
        let header = Paragraph::new(format!("Sessions: {}   Wallet: {}", self.sessions.len(), wallet))
            .block(Block::default().borders(Borders::ALL).title("vpsdeck"));
        f.render_widget(header, chunks[0]);

        let body = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(chunks[1]);

        let items: Vec<ListItem> = self
            .sessions
            .iter()
            .map(|s| ListItem::new(session_row(s)))
            .collect();
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title("Sessions"))
            .highlight_style(Style::default().add_modifier(Modifier::BOLD))
            .highlight_symbol("> ");
        f.render_stateful_widget(list, body[0], &mut self.list_state);

        let (title, text) = match self.selected() {
            Some(session) => log_pane(session, &self.engine.log_view(&session.id)),
            None => ("Log".to_string(), "No session selected".to_string()),
        };
        let log = Paragraph::new(text)
            .block(Block::default().borders(Borders::ALL).title(title))
            .wrap(Wrap { trim: false });
        f.render_widget(log, body[1]);

        let footer = Paragraph::new(format!(
            "q quit  j/k move  r refresh  s stop  L/W launch linux/windows  w wallet   {}",
            self.notice
        ))
        .block(Block::default().borders(Borders::ALL));
        f.render_widget(footer, chunks[2]);
    }
}

fn spawn_key_reader(cancel: CancellationToken) -> mpsc::UnboundedReceiver<KeyEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            match event::poll(TICK) {
                Ok(true) => {
                    if let Ok(Event::Key(key)) = event::read() {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                }
                Ok(false) => {}
                Err(_) => break,
            }
        }
    });
    rx
}

fn session_row(session: &Session) -> String {
    let created = session
        .created_at
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{:<10} {:<8} {:<13} {}",
        session.id,
        resolve_variant(session).label(),
        session.status,
        created
    )
}

fn log_pane(session: &Session, view: &LogView) -> (String, String) {
    match view {
        LogView::Unavailable => (
            format!("Log {}", session.id),
            "Logs are not available for this session.".to_string(),
        ),
        LogView::Log {
            text,
            fetching,
            error,
            interval,
        } => {
            let mut title = format!("Log {} (refresh {})", session.id, interval);
            if *fetching {
                title.push_str(" ...");
            }
            let mut body = match text {
                Some(text) if text.is_empty() => "(log is empty)".to_string(),
                Some(text) => text.clone(),
                None => "Loading...".to_string(),
            };
            if let Some(err) = error {
                body = format!("{}\n\n! {}", body, err);
            }
            (title, body)
        }
    }
}
