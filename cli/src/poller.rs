//! Adaptive per-session log polling.
//!
//! One task per watched session. The interval is recomputed from the
//! session's current status after every fetch, so a transition observed by
//! the session list takes effect on the very next scheduling decision.

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vpsdeck_common::Session;

use crate::cache::{QueryCache, Slot, SlotState};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{RefetchInterval, refetch_interval};
use crate::transport::Backend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogGate {
    Enabled { route: String },
    Unavailable,
}

/// Logs may only be fetched for sessions that advertise one and have a
/// worker route to read it from.
pub fn log_gate(session: &Session) -> LogGate {
    match (&session.worker_route, session.has_log) {
        (Some(route), true) if !route.trim().is_empty() => LogGate::Enabled {
            route: route.clone(),
        },
        _ => LogGate::Unavailable,
    }
}

/// What the UI renders for one session's log pane.
#[derive(Debug, Clone, PartialEq)]
pub enum LogView {
    /// The session has no log capability. Informational, not an error.
    Unavailable,
    Log {
        /// `None` until the first fetch completes.
        text: Option<String>,
        fetching: bool,
        error: Option<EngineError>,
        interval: RefetchInterval,
    },
}

impl LogView {
    pub fn build(session: &Session, slot: Option<&SlotState<String>>) -> Self {
        if log_gate(session) == LogGate::Unavailable {
            return LogView::Unavailable;
        }
        let interval = refetch_interval(&session.status);
        match slot {
            Some(state) => LogView::Log {
                text: state.data.clone(),
                fetching: state.fetching,
                error: state.error.clone(),
                interval,
            },
            None => LogView::Log {
                text: None,
                fetching: false,
                error: None,
                interval,
            },
        }
    }
}

/// Runs one fetch and stores its outcome on the slot. A caller arriving
/// while a fetch for the same session is outstanding shares its outcome.
pub async fn fetch_into_slot(backend: &dyn Backend, slot: &Slot<String>, session_id: &str) -> EngineResult<String> {
    let result = slot.fetch_shared(|| backend.fetch_log(session_id)).await;
    if let Err(err) = &result {
        warn!("log fetch for {} failed: {}", session_id, err);
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
    /// The session reached a terminal status.
    Terminal,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
    Invalidated,
}

enum Decision {
    Poll,
    Wait,
    Exit,
}

pub struct PollerHandle {
    session_id: String,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    interval: watch::Receiver<RefetchInterval>,
    task: Option<JoinHandle<PollerExit>>,
}

impl PollerHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Fetches as soon as the current fetch (if any) completes, without
    /// moving the next automatic deadline.
    pub fn refresh_now(&self) {
        self.refresh.notify_one();
    }

    /// The interval chosen at the latest scheduling decision.
    pub fn interval(&self) -> watch::Receiver<RefetchInterval> {
        self.interval.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|task| task.is_finished())
    }

    /// Waits for the poller to stop. Returns `Cancelled` if already awaited.
    pub async fn wait(&mut self) -> PollerExit {
        match self.task.as_mut() {
            Some(task) => {
                let exit = task.await.unwrap_or(PollerExit::Cancelled);
                self.task = None;
                exit
            }
            None => PollerExit::Cancelled,
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        // Unmounted views abandon in-flight work.
        self.cancel.cancel();
    }
}

pub struct LogPoller {
    backend: Arc<dyn Backend>,
    cache: Arc<QueryCache>,
    session_id: String,
    refresh: Arc<Notify>,
    cancel: CancellationToken,
    interval: watch::Sender<RefetchInterval>,
}

impl LogPoller {
    pub fn spawn(backend: Arc<dyn Backend>, cache: Arc<QueryCache>, session_id: &str) -> PollerHandle {
        let refresh = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let (interval_tx, interval_rx) = watch::channel(RefetchInterval::Off);

        let poller = LogPoller {
            backend,
            cache,
            session_id: session_id.to_string(),
            refresh: Arc::clone(&refresh),
            cancel: cancel.clone(),
            interval: interval_tx,
        };
        let task = tokio::spawn(poller.run());

        PollerHandle {
            session_id: session_id.to_string(),
            refresh,
            cancel,
            interval: interval_rx,
            task: Some(task),
        }
    }

    fn decide(&self, session: Option<&Session>) -> (Decision, RefetchInterval) {
        match session {
            None => (Decision::Wait, RefetchInterval::Off),
            Some(session) if session.status.is_terminal() => (Decision::Exit, RefetchInterval::Off),
            Some(session) => match log_gate(session) {
                LogGate::Unavailable => (Decision::Wait, RefetchInterval::Off),
                LogGate::Enabled { .. } => (Decision::Poll, refetch_interval(&session.status)),
            },
        }
    }

    async fn run(self) -> PollerExit {
        let log = self.cache.session_log(&self.session_id);
        let mut sessions = self.cache.sessions().subscribe();
        let mut due = Some(Instant::now());

        loop {
            let current = current_session(&mut sessions, &self.session_id);
            let (decision, interval) = self.decide(current.as_ref());
            self.interval.send_replace(interval);

            match decision {
                Decision::Exit => {
                    debug!("session {} is terminal, log polling stopped", self.session_id);
                    return PollerExit::Terminal;
                }
                Decision::Wait => {
                    // Never fetch without capability; wait for the list to change.
                    tokio::select! {
                        _ = self.cancel.cancelled() => return PollerExit::Cancelled,
                        changed = sessions.changed() => {
                            if changed.is_err() {
                                return PollerExit::Cancelled;
                            }
                        }
                    }
                    continue;
                }
                Decision::Poll => {
                    // Back in the list after a fetch saw it missing.
                    if due.is_none() {
                        due = Some(Instant::now());
                    }
                }
            }

            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PollerExit::Cancelled,
                _ = self.refresh.notified() => Trigger::Manual,
                _ = log.invalidated() => Trigger::Invalidated,
                _ = sleep_until_due(due) => Trigger::Scheduled,
                changed = sessions.changed() => {
                    if changed.is_err() {
                        return PollerExit::Cancelled;
                    }
                    continue;
                }
            };

            let invalidations = log.snapshot().invalidations;
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return PollerExit::Cancelled,
                result = fetch_into_slot(self.backend.as_ref(), &log, &self.session_id) => result,
            };
            debug!(
                "log fetch for {} ({:?}) ok={}",
                self.session_id,
                trigger,
                fetched.is_ok()
            );

            // Next deadline comes from the status as it is now.
            let current = current_session(&mut sessions, &self.session_id);
            let next = current
                .as_ref()
                .map(|session| refetch_interval(&session.status))
                .unwrap_or(RefetchInterval::Off);
            self.interval.send_replace(next);

            if trigger != Trigger::Manual || due.is_none() {
                due = next.duration().map(|every| Instant::now() + every);
            }
            // Invalidated mid-flight: the text we just stored is already stale.
            if log.snapshot().invalidations != invalidations {
                due = Some(Instant::now());
            }
        }
    }
}

fn current_session(sessions: &mut watch::Receiver<SlotState<Vec<Session>>>, session_id: &str) -> Option<Session> {
    sessions
        .borrow_and_update()
        .data
        .as_ref()
        .and_then(|list| list.iter().find(|session| session.id == session_id).cloned())
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
