//! Control surface state and key handling; rendering lives in `ui`.

use crate::launcher::Launcher;
use crate::sync::{ControlEvent, ExistenceSync, Notice};
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use stalk_core::prefs::PrefStore;
use stalk_core::SamplingInterval;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Identity,
    Frequency,
    Tracking,
    Delete,
}

impl Focus {
    pub const ORDER: [Focus; 4] = [
        Focus::Identity,
        Focus::Frequency,
        Focus::Tracking,
        Focus::Delete,
    ];

    fn index(self) -> usize {
        Self::ORDER
            .iter()
            .position(|focus| *focus == self)
            .unwrap_or(0)
    }

    pub fn next(self) -> Self {
        Self::ORDER[(self.index() + 1) % Self::ORDER.len()]
    }

    pub fn previous(self) -> Self {
        Self::ORDER[(self.index() + Self::ORDER.len() - 1) % Self::ORDER.len()]
    }
}

/// Work the main loop has to run off the UI task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    StartTracking,
    StopTracking,
}

/// Completions of launcher work, marshalled back to the UI task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Started(Result<u32, String>),
    Stopped(Result<(), String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Info,
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub tone: Tone,
    pub text: String,
}

impl StatusLine {
    fn new(tone: Tone, text: impl Into<String>) -> Self {
        Self {
            tone,
            text: text.into(),
        }
    }
}

pub struct App {
    sync: ExistenceSync,
    store: Arc<dyn PrefStore>,
    launcher: Launcher,
    pub interval: SamplingInterval,
    pub running: bool,
    pub focus: Focus,
    pub status: Option<StatusLine>,
    pub launcher_busy: bool,
}

impl App {
    pub fn new(sync: ExistenceSync, store: Arc<dyn PrefStore>, launcher: Launcher) -> Self {
        Self {
            sync,
            store,
            launcher,
            interval: SamplingInterval::default(),
            running: false,
            focus: Focus::Identity,
            status: None,
            launcher_busy: false,
        }
    }

    /// Restores identity, frequency and running state from the store.
    pub fn load(&mut self) {
        self.sync.load();
        self.interval = self.store.sampling_interval().unwrap_or_else(|err| {
            warn!(event = "control_interval_read_error", error = %err);
            SamplingInterval::default()
        });
        self.refresh();
    }

    pub fn refresh(&mut self) {
        match self.store.is_running() {
            Ok(running) => self.running = running,
            Err(err) => warn!(event = "control_running_read_error", error = %err),
        }
        self.sync.refresh();
    }

    pub fn identity(&self) -> &str {
        self.sync.identity()
    }

    pub fn launcher(&self) -> &Launcher {
        &self.launcher
    }

    pub fn delete_enabled(&self) -> bool {
        self.sync.delete_enabled()
    }

    pub fn delete_in_flight(&self) -> bool {
        self.sync.delete_in_flight()
    }

    pub fn check_pending(&self) -> bool {
        self.sync.check_pending()
    }

    pub fn can_start(&self) -> bool {
        !self.running && !self.launcher_busy && !self.identity().is_empty()
    }

    pub fn can_stop(&self) -> bool {
        self.running && !self.launcher_busy
    }

    pub fn handle_input(&mut self, event: Event) -> Option<Action> {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => self.handle_key(key),
            _ => None,
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Option<Action> {
        if key.code == KeyCode::Esc
            || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
        {
            return Some(Action::Quit);
        }
        match key.code {
            KeyCode::Tab | KeyCode::Down => {
                self.focus = self.focus.next();
                return None;
            }
            KeyCode::BackTab | KeyCode::Up => {
                self.focus = self.focus.previous();
                return None;
            }
            _ => {}
        }

        match self.focus {
            Focus::Identity => {
                match key.code {
                    KeyCode::Char(ch) => {
                        let mut identity = self.identity().to_string();
                        identity.push(ch);
                        self.sync.edit_identity(identity);
                    }
                    KeyCode::Backspace => {
                        let mut identity = self.identity().to_string();
                        identity.pop();
                        self.sync.edit_identity(identity);
                    }
                    KeyCode::Enter => self.focus = self.focus.next(),
                    _ => {}
                }
                None
            }
            Focus::Frequency => {
                match key.code {
                    KeyCode::Left | KeyCode::Char('h') => {
                        self.select_interval(self.interval.previous())
                    }
                    KeyCode::Right | KeyCode::Char('l') | KeyCode::Enter | KeyCode::Char(' ') => {
                        self.select_interval(self.interval.next())
                    }
                    KeyCode::Char('q') => return Some(Action::Quit),
                    _ => {}
                }
                None
            }
            Focus::Tracking => match key.code {
                KeyCode::Enter | KeyCode::Char(' ') => self.toggle_tracking(),
                KeyCode::Char('q') => Some(Action::Quit),
                _ => None,
            },
            Focus::Delete => {
                match key.code {
                    KeyCode::Enter | KeyCode::Char(' ') => self.delete(),
                    KeyCode::Char('q') => return Some(Action::Quit),
                    _ => {}
                }
                None
            }
        }
    }

    pub fn apply_control_event(&mut self, event: ControlEvent) {
        if let Some(notice) = self.sync.handle(event) {
            self.status = Some(match notice {
                Notice::Deleted { identity } => {
                    StatusLine::new(Tone::Ok, format!("Data for {identity} deleted"))
                }
                Notice::DeleteFailed { identity } => {
                    StatusLine::new(Tone::Error, format!("Failed to delete data for {identity}"))
                }
            });
        }
    }

    pub fn apply_app_event(&mut self, event: AppEvent) {
        self.launcher_busy = false;
        self.status = Some(match event {
            AppEvent::Started(Ok(pid)) => {
                StatusLine::new(Tone::Ok, format!("Tracker started (pid {pid})"))
            }
            AppEvent::Started(Err(err)) => StatusLine::new(Tone::Error, err),
            AppEvent::Stopped(Ok(())) => StatusLine::new(Tone::Ok, "Tracker stopped"),
            AppEvent::Stopped(Err(err)) => StatusLine::new(Tone::Error, err),
        });
        self.refresh();
    }

    fn select_interval(&mut self, interval: SamplingInterval) {
        if let Err(err) = self.launcher.set_frequency(interval) {
            warn!(event = "control_interval_write_error", error = %err);
            self.status = Some(StatusLine::new(Tone::Error, "Could not save frequency"));
            return;
        }
        self.interval = interval;
        if self.running {
            self.status = Some(StatusLine::new(
                Tone::Info,
                format!("Frequency {interval} applies from the next start"),
            ));
        }
    }

    fn toggle_tracking(&mut self) -> Option<Action> {
        if self.can_stop() {
            self.launcher_busy = true;
            self.status = Some(StatusLine::new(Tone::Info, "Stopping tracker..."));
            return Some(Action::StopTracking);
        }
        if self.can_start() {
            self.launcher_busy = true;
            self.status = Some(StatusLine::new(Tone::Info, "Starting tracker..."));
            return Some(Action::StartTracking);
        }
        None
    }

    fn delete(&mut self) {
        if self.sync.request_delete() {
            self.status = Some(StatusLine::new(
                Tone::Info,
                format!("Deleting data for {}...", self.identity()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use stalk_client::Collector;
    use stalk_core::prefs::PrefKey;
    use stalk_core::{MemoryPrefStore, SampleReport};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoopCollector;

    #[async_trait]
    impl Collector for NoopCollector {
        async fn report_position(&self, _report: &SampleReport) -> bool {
            true
        }

        async fn check_exists(&self, _identity: &str) -> bool {
            true
        }

        async fn delete_data(&self, _identity: &str) -> bool {
            true
        }
    }

    fn app(store: Arc<MemoryPrefStore>) -> (App, mpsc::UnboundedReceiver<ControlEvent>) {
        let (sync, rx) = ExistenceSync::new(store.clone(), Arc::new(NoopCollector));
        let launcher = Launcher::new("stalk-tracker", "/nonexistent/tracker.sock", store.clone());
        let mut app = App::new(sync, store, launcher);
        app.load();
        (app, rx)
    }

    fn press(app: &mut App, code: KeyCode) -> Option<Action> {
        app.handle_key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn type_text(app: &mut App, text: &str) {
        for ch in text.chars() {
            press(app, KeyCode::Char(ch));
        }
    }

    #[tokio::test]
    async fn startup_restores_saved_values() {
        let store = Arc::new(MemoryPrefStore::new());
        store.set_string(PrefKey::UserName, "Alice").unwrap();
        store.set_string(PrefKey::StalkFrequency, "5s").unwrap();
        store.set_bool(PrefKey::ServiceRunning, true).unwrap();

        let (app, _rx) = app(store);
        assert_eq!(app.identity(), "Alice");
        assert_eq!(app.interval, SamplingInterval::FiveSeconds);
        assert!(app.running);
        assert!(app.can_stop());
        assert!(!app.can_start());
    }

    #[tokio::test]
    async fn typing_persists_identity_immediately() {
        let store = Arc::new(MemoryPrefStore::new());
        let (mut app, _rx) = app(store.clone());
        type_text(&mut app, "Bob");
        assert_eq!(store.identity().unwrap(), "Bob");
        press(&mut app, KeyCode::Backspace);
        assert_eq!(store.identity().unwrap(), "Bo");
        assert!(app.check_pending());
    }

    #[tokio::test]
    async fn q_is_text_while_editing_identity() {
        let store = Arc::new(MemoryPrefStore::new());
        let (mut app, _rx) = app(store);
        assert_eq!(press(&mut app, KeyCode::Char('q')), None);
        assert_eq!(app.identity(), "q");
        press(&mut app, KeyCode::Tab);
        assert_eq!(press(&mut app, KeyCode::Char('q')), Some(Action::Quit));
    }

    #[tokio::test]
    async fn start_is_disabled_for_an_empty_identity() {
        let store = Arc::new(MemoryPrefStore::new());
        let (mut app, _rx) = app(store);
        app.focus = Focus::Tracking;
        assert_eq!(press(&mut app, KeyCode::Enter), None);

        app.focus = Focus::Identity;
        type_text(&mut app, "Alice");
        app.focus = Focus::Tracking;
        assert_eq!(press(&mut app, KeyCode::Enter), Some(Action::StartTracking));
        assert!(app.launcher_busy);
        assert_eq!(press(&mut app, KeyCode::Enter), None, "busy until the launcher answers");

        app.apply_app_event(AppEvent::Started(Ok(42)));
        assert!(!app.launcher_busy);
        assert_eq!(app.status.as_ref().map(|s| s.tone), Some(Tone::Ok));
    }

    #[tokio::test]
    async fn frequency_selector_wraps_and_persists() {
        let store = Arc::new(MemoryPrefStore::new());
        let (mut app, _rx) = app(store.clone());
        app.focus = Focus::Frequency;
        press(&mut app, KeyCode::Right);
        assert_eq!(app.interval, SamplingInterval::ThirtySeconds);
        press(&mut app, KeyCode::Right);
        assert_eq!(app.interval, SamplingInterval::OneSecond);
        assert_eq!(store.sampling_interval().unwrap(), SamplingInterval::OneSecond);
        press(&mut app, KeyCode::Left);
        assert_eq!(store.sampling_interval().unwrap(), SamplingInterval::ThirtySeconds);
    }

    #[tokio::test]
    async fn delete_outcome_lands_on_the_status_line() {
        let store = Arc::new(MemoryPrefStore::new());
        store.set_string(PrefKey::UserName, "Alice").unwrap();
        store.record_existence("Alice", true).unwrap();
        let (mut app, mut rx) = app(store.clone());
        assert!(app.delete_enabled());

        app.focus = Focus::Delete;
        press(&mut app, KeyCode::Enter);
        assert!(app.delete_in_flight());
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("delete completes")
            .expect("event");
        app.apply_control_event(event);

        assert_eq!(
            app.status,
            Some(StatusLine::new(Tone::Ok, "Data for Alice deleted"))
        );
        assert!(!app.delete_enabled());
    }

    #[test]
    fn focus_cycles_both_ways() {
        assert_eq!(Focus::Delete.next(), Focus::Identity);
        assert_eq!(Focus::Identity.previous(), Focus::Delete);
        assert_eq!(Focus::Frequency.next(), Focus::Tracking);
    }
}
