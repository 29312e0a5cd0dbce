use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::fmt;

/// How long an ended entry is kept for reopen detection. Past this the
/// recorder still finds the stored record on the next start.
const ENDED_RETENTION_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Started,
    Running,
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionTrackerEntry {
    pub session_id: i64,
    pub first_packet_time: DateTime<Utc>,
    pub last_packet_time: DateTime<Utc>,
    pub packet_count: u64,
    pub state: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Timeout,
    Explicit,
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EndReason::Timeout => "timeout",
            EndReason::Explicit => "explicit",
            EndReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start {
        session_id: i64,
        at: DateTime<Utc>,
        reopened: bool,
    },
    Launch {
        session_id: i64,
        at: DateTime<Utc>,
    },
    End {
        session_id: i64,
        at: DateTime<Utc>,
        reason: EndReason,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> i64 {
        match self {
            SessionEvent::Start { session_id, .. }
            | SessionEvent::Launch { session_id, .. }
            | SessionEvent::End { session_id, .. } => *session_id,
        }
    }
}

/// Derives session lifecycle from packet arrival times alone. Callers pass
/// `now` explicitly so the timing rules stay deterministic under test.
#[derive(Debug)]
pub struct SessionTracker {
    end_timeout: ChronoDuration,
    entries: HashMap<i64, SessionTrackerEntry>,
}

impl SessionTracker {
    pub fn new(end_timeout: std::time::Duration) -> Self {
        let end_timeout =
            ChronoDuration::from_std(end_timeout).unwrap_or_else(|_| ChronoDuration::seconds(20));
        Self {
            end_timeout,
            entries: HashMap::new(),
        }
    }

    pub fn on_arrival(&mut self, session_id: i64, now: DateTime<Utc>) -> SessionEvent {
        match self.entries.get_mut(&session_id) {
            None => {
                self.entries.insert(
                    session_id,
                    SessionTrackerEntry {
                        session_id,
                        first_packet_time: now,
                        last_packet_time: now,
                        packet_count: 1,
                        state: SessionState::Started,
                    },
                );
                SessionEvent::Start {
                    session_id,
                    at: now,
                    reopened: false,
                }
            }
            Some(entry) if entry.state == SessionState::Ended => {
                entry.state = SessionState::Running;
                entry.last_packet_time = now;
                entry.packet_count += 1;
                SessionEvent::Start {
                    session_id,
                    at: now,
                    reopened: true,
                }
            }
            Some(entry) => {
                entry.state = SessionState::Running;
                entry.last_packet_time = now;
                entry.packet_count += 1;
                SessionEvent::Launch { session_id, at: now }
            }
        }
    }

    /// Ends an open session right away. Unknown or already ended sessions
    /// yield nothing.
    pub fn on_explicit_end(&mut self, session_id: i64, at: DateTime<Utc>) -> Option<SessionEvent> {
        let entry = self.entries.get_mut(&session_id)?;
        if entry.state == SessionState::Ended {
            return None;
        }
        entry.state = SessionState::Ended;
        Some(SessionEvent::End {
            session_id,
            at,
            reason: EndReason::Explicit,
        })
    }

    /// Ends every open session idle for strictly longer than the timeout.
    /// The recorded end is one second after its last packet.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        let end_timeout = self.end_timeout;
        let mut ended = self.end_where(EndReason::Timeout, |entry| {
            now - entry.last_packet_time > end_timeout
        });
        ended.sort_by_key(SessionEvent::session_id);

        let retention = ChronoDuration::seconds(ENDED_RETENTION_SECS);
        self.entries.retain(|_, entry| {
            entry.state != SessionState::Ended || now - entry.last_packet_time <= retention
        });
        ended
    }

    /// Ends every open session regardless of idle time.
    pub fn close_all(&mut self) -> Vec<SessionEvent> {
        let mut ended = self.end_where(EndReason::Shutdown, |_| true);
        ended.sort_by_key(SessionEvent::session_id);
        ended
    }

    fn end_where<F>(&mut self, reason: EndReason, mut due: F) -> Vec<SessionEvent>
    where
        F: FnMut(&SessionTrackerEntry) -> bool,
    {
        let mut events = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.state == SessionState::Ended || !due(entry) {
                continue;
            }
            entry.state = SessionState::Ended;
            events.push(SessionEvent::End {
                session_id: entry.session_id,
                at: entry.last_packet_time + ChronoDuration::seconds(1),
                reason,
            });
        }
        events
    }

    pub fn entry(&self, session_id: i64) -> Option<&SessionTrackerEntry> {
        self.entries.get(&session_id)
    }

    pub fn open_sessions(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state != SessionState::Ended)
            .count()
    }
}
