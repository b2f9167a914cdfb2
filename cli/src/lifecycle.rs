use std::cmp::Ordering;
use std::time::Duration;

use vpsdeck_common::{Session, SessionStatus};

use crate::config::{DEFAULT_REFETCH_MS, PROVISIONING_REFETCH_MS, READY_REFETCH_MS};

/// List ordering rank; lower sorts first.
pub fn sort_priority(status: &SessionStatus) -> u8 {
    match status {
        SessionStatus::Pending | SessionStatus::Provisioning => 0,
        SessionStatus::Ready => 1,
        SessionStatus::Failed => 2,
        SessionStatus::Expired => 3,
        SessionStatus::Deleted => 4,
        SessionStatus::Other(_) => 5,
    }
}

/// Priority ascending, then most recently created first. Sessions without a
/// timestamp go last within their group.
pub fn compare_sessions(a: &Session, b: &Session) -> Ordering {
    sort_priority(&a.status)
        .cmp(&sort_priority(&b.status))
        .then_with(|| match (a.created_at, b.created_at) {
            (Some(left), Some(right)) => right.cmp(&left),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
}

pub fn sort_sessions(sessions: &mut [Session]) {
    sessions.sort_by(compare_sessions);
}

pub fn can_stop(session: &Session) -> bool {
    !session.status.is_terminal()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchInterval {
    Every(Duration),
    Off,
}

impl RefetchInterval {
    fn from_millis(ms: u64) -> Self {
        RefetchInterval::Every(Duration::from_millis(ms))
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            RefetchInterval::Every(every) => Some(*every),
            RefetchInterval::Off => None,
        }
    }

    pub fn as_millis(&self) -> Option<u64> {
        self.duration().map(|d| d.as_millis() as u64)
    }

    pub fn is_off(&self) -> bool {
        matches!(self, RefetchInterval::Off)
    }

    /// The more frequent of the two; `Off` only when both are.
    pub fn shortest(self, other: RefetchInterval) -> RefetchInterval {
        match (self.duration(), other.duration()) {
            (Some(a), Some(b)) => RefetchInterval::Every(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }
}

impl std::fmt::Display for RefetchInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefetchInterval::Every(every) => write!(f, "every {}s", every.as_secs_f32()),
            RefetchInterval::Off => f.write_str("off"),
        }
    }
}

/// Log refetch cadence for a session in `status`.
pub fn refetch_interval(status: &SessionStatus) -> RefetchInterval {
    match status {
        SessionStatus::Deleted | SessionStatus::Failed | SessionStatus::Expired => {
            RefetchInterval::Off
        }
        SessionStatus::Ready => RefetchInterval::from_millis(READY_REFETCH_MS),
        SessionStatus::Pending | SessionStatus::Provisioning => {
            RefetchInterval::from_millis(PROVISIONING_REFETCH_MS)
        }
        SessionStatus::Other(_) => RefetchInterval::from_millis(DEFAULT_REFETCH_MS),
    }
}

/// Cadence for re-reading the session list: as fast as its most urgent member.
pub fn list_refetch_interval(sessions: &[Session]) -> RefetchInterval {
    sessions
        .iter()
        .map(|session| refetch_interval(&session.status))
        .fold(RefetchInterval::Off, RefetchInterval::shortest)
}
