mod db;
mod recorder;
mod store;
mod tracker;


pub use db::PgSessionStore;
pub use store::SessionStore;
pub use tracker::SessionEvent;

use recorder::SessionRecorder;
use store::SampleRecord;
use tracker::SessionTracker;

use crate::frame::Action;
use crate::geo::GeoFilter;
use crate::relay::{from_unix_seconds, unix_seconds, RelayMessage, Subscription};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::time::{Duration, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub admin_key: String,
    pub geo: GeoFilter,
    pub end_timeout: Duration,
    pub tick_interval: Duration,
}

/// Consumes relayed telemetry, tracks session lifecycle and keeps the
/// session store current.
pub struct SessionService<S> {
    settings: SessionSettings,
    tracker: SessionTracker,
    recorder: SessionRecorder<S>,
    rejected: u64,
}

impl<S> SessionService<S>
where
    S: SessionStore,
{
    pub fn new(settings: SessionSettings, store: S) -> Self {
        let tracker = SessionTracker::new(settings.end_timeout);
        Self {
            settings,
            tracker,
            recorder: SessionRecorder::new(store),
            rejected: 0,
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn recorder(&self) -> &SessionRecorder<S> {
        &self.recorder
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub async fn handle_payload(&mut self, payload: &[u8], now: DateTime<Utc>) -> Option<SessionEvent> {
        match RelayMessage::decode(payload, unix_seconds(now)) {
            Ok(message) => self.handle_message(message, now).await,
            Err(err) => {
                self.rejected += 1;
                tracing::warn!(error = %err, "dropping undecodable relay payload");
                None
            }
        }
    }

    pub async fn handle_message(
        &mut self,
        message: RelayMessage,
        now: DateTime<Utc>,
    ) -> Option<SessionEvent> {
        if message.admin_key != self.settings.admin_key {
            self.rejected += 1;
            tracing::warn!(session_id = message.session_id, "dropping relay message with wrong admin key");
            return None;
        }
        if message.action == Action::IdRequest {
            tracing::debug!("ignoring relayed id request");
            return None;
        }

        let packet = message.into_packet();
        let session_id = packet.session_id;

        // An end frame stores no sample, so its fix is not screened.
        if packet.action == Some(Action::End) {
            let at = from_unix_seconds(packet.ingest_time);
            let Some(event) = self.tracker.on_explicit_end(session_id, at) else {
                tracing::info!(session_id, "ignoring end for unknown or ended session");
                return None;
            };
            self.recorder.on_end(session_id, at).await;
            return Some(event);
        }

        let packet = self.settings.geo.screen(packet)?;

        let event = self.tracker.on_arrival(session_id, now);
        match &event {
            SessionEvent::Start { at, reopened, .. } => {
                self.recorder.on_start(session_id, *at, *reopened).await;
            }
            SessionEvent::Launch { .. } => {
                self.recorder
                    .on_sample(session_id, SampleRecord::from(&packet))
                    .await;
            }
            SessionEvent::End { .. } => {}
        }
        Some(event)
    }

    /// Periodic housekeeping: retries failed writes and closes idle sessions.
    pub async fn handle_tick(&mut self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        self.recorder.retry_dirty().await;
        let ended = self.tracker.tick(now);
        for event in &ended {
            if let SessionEvent::End { session_id, at, reason } = event {
                tracing::debug!(session_id, %reason, "closing idle session");
                self.recorder.on_end(*session_id, *at).await;
            }
        }
        tracing::debug!(
            open_sessions = self.tracker.open_sessions(),
            pending_writes = self.recorder.pending_writes(),
            persist_failures = self.recorder.persist_failures(),
            "session tick"
        );
        ended
    }

    /// Ends every open session and makes a last attempt at pending writes.
    pub async fn shutdown(&mut self) -> Vec<SessionEvent> {
        let ended = self.tracker.close_all();
        for event in &ended {
            if let SessionEvent::End { session_id, at, .. } = event {
                self.recorder.on_end(*session_id, *at).await;
            }
        }
        self.recorder.retry_dirty().await;
        if self.recorder.pending_writes() > 0 {
            tracing::error!(
                pending_writes = self.recorder.pending_writes(),
                "sessions not persisted at shutdown"
            );
        }
        tracing::info!(
            closed = ended.len(),
            rejected = self.rejected,
            persist_failures = self.recorder.persist_failures(),
            "session service stopped"
        );
        ended
    }
}

/// Drives `service` from `subscription` until `shutdown` resolves or the
/// subscription ends, then flushes open sessions.
pub async fn run<S, F>(service: &mut SessionService<S>, mut subscription: Subscription, shutdown: F)
where
    S: SessionStore,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(service.settings.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);
    tracing::info!(
        end_timeout_secs = service.settings.end_timeout.as_secs_f64(),
        "session tracking started"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("session tracking stopping");
                break;
            }
            _ = ticker.tick() => {
                service.handle_tick(Utc::now()).await;
            }
            payload = subscription.next() => {
                let Some(payload) = payload else {
                    tracing::warn!("relay subscription closed");
                    break;
                };
                service.handle_payload(&payload, Utc::now()).await;
            }
        }
    }

    service.shutdown().await;
}
