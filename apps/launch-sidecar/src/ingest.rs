use crate::codec::LinkCodec;
use crate::error::{AuthError, FrameError};
use crate::frame::{Frame, FrameLayout};
use crate::id_alloc::{id_assignment_line, IdAllocator};
use crate::link::LinkHandle;
use crate::relay::{unix_seconds, RelayMessage, RelayPublisher};
use chrono::Utc;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, MissedTickBehavior};

/// Command that asks a polled payload for its next frame.
const REQUEST_DATA_TAG: &str = "REQUEST-DATA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// The payload transmits on its own; just read.
    Listen,
    /// Send `<key>-REQUEST-DATA` and read the reply.
    Poll,
}

impl FromStr for LinkMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "listen" => Ok(LinkMode::Listen),
            "poll" => Ok(LinkMode::Poll),
            other => Err(format!("unknown link mode {other:?} (expected listen or poll)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub admin_key: String,
    pub layout: FrameLayout,
    pub codec: LinkCodec,
    pub mode: LinkMode,
    pub read_timeout: Duration,
    pub poll_interval: Duration,
    pub channel: String,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub lines_read: AtomicU64,
    pub parse_errors: AtomicU64,
    pub auth_rejected: AtomicU64,
    pub published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub id_requests: AtomicU64,
    pub link_errors: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn log_summary(&self, final_summary: bool) {
        let lines_read = self.lines_read.load(Ordering::Relaxed);
        let parse_errors = self.parse_errors.load(Ordering::Relaxed);
        let auth_rejected = self.auth_rejected.load(Ordering::Relaxed);
        let published = self.published.load(Ordering::Relaxed);
        let publish_failures = self.publish_failures.load(Ordering::Relaxed);
        let id_requests = self.id_requests.load(Ordering::Relaxed);
        let link_errors = self.link_errors.load(Ordering::Relaxed);
        if final_summary {
            tracing::info!(
                lines_read,
                parse_errors,
                auth_rejected,
                published,
                publish_failures,
                id_requests,
                link_errors,
                "ingest totals"
            );
        } else {
            tracing::debug!(
                lines_read,
                parse_errors,
                auth_rejected,
                published,
                publish_failures,
                id_requests,
                link_errors,
                "ingest cycle"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    Malformed(FrameError),
    AuthRejected(AuthError),
    PublishFailed,
    AllocFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    Published { session_id: i64 },
    IdAssigned(i64),
    Dropped(DropReason),
}

/// Pulls frames off the radio link and relays authenticated telemetry.
pub struct Ingestor<P, A> {
    link: LinkHandle,
    publisher: P,
    allocator: A,
    settings: IngestSettings,
    stats: Arc<IngestStats>,
}

impl<P, A> Ingestor<P, A>
where
    P: RelayPublisher + Sync,
    A: IdAllocator + Sync,
{
    pub fn new(link: LinkHandle, publisher: P, allocator: A, settings: IngestSettings) -> Self {
        Self {
            link,
            publisher,
            allocator,
            settings,
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Runs poll cycles until `shutdown` resolves. Link failures never end
    /// the loop; the next cycle retries.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        tracing::info!(
            mode = ?self.settings.mode,
            layout = ?self.settings.layout,
            channel = %self.settings.channel,
            "ingest loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("ingest loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                    self.stats.log_summary(false);
                }
            }
        }
        self.stats.log_summary(true);
    }

    /// One link cycle: read (or request) a line and handle it.
    pub async fn poll_once(&self) -> Option<LineOutcome> {
        let timeout = self.settings.read_timeout;
        let read = match self.settings.mode {
            LinkMode::Listen => self.link.read_line(timeout).await,
            LinkMode::Poll => {
                let request = format!("{}-{REQUEST_DATA_TAG}", self.settings.admin_key);
                self.link
                    .request_reply(&self.settings.codec.encode(&request), timeout)
                    .await
            }
        };
        match read {
            Ok(Some(raw)) => Some(self.handle_line(&raw, unix_seconds(Utc::now())).await),
            Ok(None) => None,
            Err(err) => {
                IngestStats::bump(&self.stats.link_errors);
                self.stats.record_error(err.to_string());
                tracing::warn!(error = %err, "radio link read failed");
                None
            }
        }
    }

    pub async fn handle_line(&self, raw: &str, received_at: f64) -> LineOutcome {
        IngestStats::bump(&self.stats.lines_read);
        let decoded = self.settings.codec.decode(raw);
        let frame = match self.settings.layout.parse(&decoded, received_at) {
            Ok(frame) => frame,
            Err(err) => {
                IngestStats::bump(&self.stats.parse_errors);
                tracing::warn!(error = %err, line = %decoded, "dropping unparseable frame");
                return LineOutcome::Dropped(DropReason::Malformed(err));
            }
        };

        match frame {
            Frame::IdRequest { admin_key } => {
                if let Err(err) = self.authenticate(&admin_key, None) {
                    return LineOutcome::Dropped(DropReason::AuthRejected(err));
                }
                self.assign_id(&admin_key).await
            }
            Frame::Telemetry(packet) => {
                if let Err(err) = self.authenticate(&packet.admin_key, Some(packet.session_id)) {
                    return LineOutcome::Dropped(DropReason::AuthRejected(err));
                }
                let message = RelayMessage::from_packet(&packet);
                match self.publisher.publish(&self.settings.channel, &message).await {
                    Ok(()) => {
                        IngestStats::bump(&self.stats.published);
                        tracing::debug!(
                            session_id = message.session_id,
                            action = %message.action,
                            "relayed frame"
                        );
                        LineOutcome::Published {
                            session_id: message.session_id,
                        }
                    }
                    Err(err) => {
                        IngestStats::bump(&self.stats.publish_failures);
                        self.stats.record_error(err.to_string());
                        tracing::warn!(
                            error = %err,
                            session_id = message.session_id,
                            "failed to relay frame"
                        );
                        LineOutcome::Dropped(DropReason::PublishFailed)
                    }
                }
            }
        }
    }

    fn authenticate(&self, admin_key: &str, session_id: Option<i64>) -> Result<(), AuthError> {
        if admin_key == self.settings.admin_key {
            return Ok(());
        }
        IngestStats::bump(&self.stats.auth_rejected);
        let err = AuthError { session_id };
        tracing::warn!(error = %err, "dropping frame with wrong admin key");
        Err(err)
    }

    async fn assign_id(&self, admin_key: &str) -> LineOutcome {
        IngestStats::bump(&self.stats.id_requests);
        let session_id = match self.allocator.allocate().await {
            Ok(id) => id,
            Err(err) => {
                self.stats.record_error(err.to_string());
                tracing::warn!(error = %err, "session id allocation failed");
                return LineOutcome::Dropped(DropReason::AllocFailed);
            }
        };
        let reply = self
            .settings
            .codec
            .encode(&id_assignment_line(admin_key, session_id));
        if let Err(err) = self.link.write_line(&reply).await {
            IngestStats::bump(&self.stats.link_errors);
            tracing::warn!(error = %err, session_id, "failed to send id assignment");
        } else {
            tracing::info!(session_id, "assigned session id");
        }
        LineOutcome::IdAssigned(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::XorCipher;
    use crate::error::{AllocError, BusError};
    use crate::frame::Action;
    use crate::link::scripted::ScriptedLink;
    use crate::link::spawn_link_thread;
    use crate::relay::LocalRelay;
    use std::sync::Mutex as StdMutex;

    const CHANNEL: &str = "cansat/telemetry";

    struct Counter(StdMutex<i64>);

    impl IdAllocator for Counter {
        async fn allocate(&self) -> Result<i64, AllocError> {
            let mut next = self.0.lock().unwrap();
            *next += 1;
            Ok(*next)
        }
    }

    struct Unreachable;

    impl RelayPublisher for Unreachable {
        async fn publish(&self, _channel: &str, _message: &RelayMessage) -> Result<(), BusError> {
            Err(BusError::ConnectTimeout)
        }
    }

    fn settings(codec: LinkCodec, layout: FrameLayout, mode: LinkMode) -> IngestSettings {
        IngestSettings {
            admin_key: "ADMIN".to_string(),
            layout,
            codec,
            mode,
            read_timeout: Duration::from_millis(10),
            poll_interval: Duration::from_millis(5),
            channel: CHANNEL.to_string(),
        }
    }

    #[tokio::test]
    async fn relays_authenticated_frames() {
        let link = ScriptedLink::new(Vec::<String>::new());
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe(CHANNEL);
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            relay.clone(),
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Dash, LinkMode::Listen),
        );

        let outcome = ingestor
            .handle_line("ADMIN-7-launch-12.5-22.1-55.0", 100.0)
            .await;
        assert_eq!(outcome, LineOutcome::Published { session_id: 7 });

        let payload = sub.next().await.unwrap();
        let message = RelayMessage::decode(&payload, 0.0).unwrap();
        assert_eq!(message.action, Action::Launch);
        assert_eq!(message.temperature, Some(22.1));
        assert_eq!(message.ingest_time, 100.0);
    }

    #[tokio::test]
    async fn drops_wrong_key_and_garbage() {
        let link = ScriptedLink::new(Vec::<String>::new());
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            LocalRelay::new(),
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Star, LinkMode::Listen),
        );

        assert_eq!(
            ingestor.handle_line("INTRUDER*3*1.0", 1.0).await,
            LineOutcome::Dropped(DropReason::AuthRejected(AuthError {
                session_id: Some(3)
            }))
        );
        assert!(matches!(
            ingestor.handle_line("ADMIN*x*1.0", 1.0).await,
            LineOutcome::Dropped(DropReason::Malformed(FrameError::NotNumeric { .. }))
        ));
        let stats = ingestor.stats();
        assert_eq!(stats.lines_read.load(Ordering::Relaxed), 2);
        assert_eq!(stats.auth_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.parse_errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_counted_not_fatal() {
        let link = ScriptedLink::new(Vec::<String>::new());
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            Unreachable,
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Star, LinkMode::Listen),
        );
        assert_eq!(
            ingestor.handle_line("ADMIN*3*1.0", 1.0).await,
            LineOutcome::Dropped(DropReason::PublishFailed)
        );
        assert_eq!(ingestor.stats().publish_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn id_request_gets_encoded_assignment() {
        let cipher = XorCipher::default();
        let link = ScriptedLink::new([cipher.encode("ADMIN-CANSAT_REQ_ID")]);
        let written = link.written.clone();
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            LocalRelay::new(),
            Some(Counter(StdMutex::new(40))),
            settings(LinkCodec::Xor(cipher), FrameLayout::Star, LinkMode::Listen),
        );

        assert_eq!(ingestor.poll_once().await, Some(LineOutcome::IdAssigned(41)));
        let sent = written.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(cipher.decode(&sent[0]), "ADMIN-ID_ASSIGN-41");
    }

    #[tokio::test]
    async fn id_request_without_allocator_is_dropped() {
        let link = ScriptedLink::new(Vec::<String>::new());
        let written = link.written.clone();
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            LocalRelay::new(),
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Dash, LinkMode::Listen),
        );
        assert_eq!(
            ingestor.handle_line("ADMIN-CANSAT_REQ_ID", 1.0).await,
            LineOutcome::Dropped(DropReason::AllocFailed)
        );
        assert!(written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_mode_sends_request_before_reading() {
        let link = ScriptedLink::new(["ADMIN*5*2.0*21.0*40.0"]);
        let written = link.written.clone();
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe(CHANNEL);
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            relay.clone(),
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Star, LinkMode::Poll),
        );

        assert_eq!(
            ingestor.poll_once().await,
            Some(LineOutcome::Published { session_id: 5 })
        );
        assert_eq!(*written.lock().unwrap(), vec!["ADMIN-REQUEST-DATA".to_string()]);
        assert!(sub.next().await.is_some());
        // Silent link: nothing to handle.
        assert_eq!(ingestor.poll_once().await, None);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let link = ScriptedLink::new(["ADMIN*1*0.0", "ADMIN*1*1.0"]);
        let relay = LocalRelay::new();
        let mut sub = relay.subscribe(CHANNEL);
        let ingestor = Ingestor::new(
            spawn_link_thread(link).unwrap(),
            relay.clone(),
            None::<Counter>,
            settings(LinkCodec::Plain, FrameLayout::Star, LinkMode::Listen),
        );

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let stopper = tokio::spawn(async move {
            let first = sub.next().await;
            let second = sub.next().await;
            let _ = stop_tx.send(());
            (first.is_some(), second.is_some())
        });
        ingestor
            .run(async {
                let _ = stop_rx.await;
            })
            .await;
        assert_eq!(stopper.await.unwrap(), (true, true));
        assert_eq!(ingestor.stats().published.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn link_mode_parses() {
        assert_eq!("POLL".parse::<LinkMode>(), Ok(LinkMode::Poll));
        assert!("push".parse::<LinkMode>().is_err());
    }
}
