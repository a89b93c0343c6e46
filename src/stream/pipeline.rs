use crate::state::{StreamHandle, TelemetryStore};
use crate::stream::backoff::{BackoffPolicy, ConnectionEvent, ConnectionMachine};
use crate::stream::decoder::{
    decode_frame, format_timestamp, is_handshake, normalize, normalize_alert, AlertDecode,
    DecodedFrame,
};
use crate::stream::record::{AlertEvent, RejectedFrame};
use crate::stream::transport::{Connector, Frame, Session};
use crate::stream::types::{ConnectionState, DecodeFailurePolicy, StreamStatusSnapshot};
use crate::stream::{ALERT_STREAM, TELEMETRY_STREAM};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const WARN_THROTTLE_MS: u64 = 500;

/// Receives every decoded frame of one connection, in arrival order.
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: DecodedFrame, received_at: DateTime<Utc>);
}

/// Suppresses a repeated warning with the same key inside the throttle window.
#[derive(Debug, Default)]
struct WarnThrottle {
    last_emit: HashMap<String, Instant>,
}

impl WarnThrottle {
    fn allow(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = Duration::from_millis(WARN_THROTTLE_MS);
        if let Some(last) = self.last_emit.get(key) {
            if now.duration_since(*last) < window {
                return false;
            }
        }
        self.last_emit.retain(|_, last| now.duration_since(*last) < window);
        self.last_emit.insert(key.to_string(), now);
        true
    }
}

/// Normalizes telemetry frames into the rolling window.
pub struct TelemetrySink {
    store: Arc<TelemetryStore>,
    policy: DecodeFailurePolicy,
    throttle: WarnThrottle,
}

impl TelemetrySink {
    pub fn new(store: Arc<TelemetryStore>, policy: DecodeFailurePolicy) -> Self {
        Self {
            store,
            policy,
            throttle: WarnThrottle::default(),
        }
    }

    fn reject(&mut self, frame: &DecodedFrame, received_at: DateTime<Utc>) {
        let payload = frame.to_text();
        if self.throttle.allow("rejected") {
            tracing::warn!(stream = TELEMETRY_STREAM, %payload, "frame did not normalize into a record");
        }

        let kept = match self.policy {
            DecodeFailurePolicy::Drop => None,
            DecodeFailurePolicy::Degraded => Some(RejectedFrame {
                received_at: format_timestamp(received_at),
                payload,
            }),
        };
        self.store.record_rejected(kept);
    }
}

impl FrameSink for TelemetrySink {
    fn on_frame(&mut self, frame: DecodedFrame, received_at: DateTime<Utc>) {
        let Some(value) = frame.as_json() else {
            self.reject(&frame, received_at);
            return;
        };

        if is_handshake(value) {
            tracing::debug!(stream = TELEMETRY_STREAM, "handshake frame ignored");
            self.store.record_handshake();
            return;
        }

        match normalize(value, received_at) {
            Some(record) => self.store.append(record),
            None => self.reject(&frame, received_at),
        }
    }
}

/// Publishes each decoded alert into a single-slot channel; a new alert replaces the previous one.
pub struct AlertSink {
    slot: watch::Sender<Option<AlertEvent>>,
    throttle: WarnThrottle,
}

impl AlertSink {
    pub fn new(slot: watch::Sender<Option<AlertEvent>>) -> Self {
        Self {
            slot,
            throttle: WarnThrottle::default(),
        }
    }
}

impl FrameSink for AlertSink {
    fn on_frame(&mut self, frame: DecodedFrame, _received_at: DateTime<Utc>) {
        let decoded = match &frame {
            DecodedFrame::Json(value) => normalize_alert(value),
            DecodedFrame::Raw(text) => AlertDecode::Invalid(format!("malformed alert frame: {text}")),
        };

        match decoded {
            AlertDecode::Alert(alert) => {
                tracing::info!(stream = ALERT_STREAM, equipment = ?alert.equipment, prob = alert.prob, "alert received");
                self.slot.send_replace(Some(alert));
            }
            AlertDecode::Handshake => {
                tracing::debug!(stream = ALERT_STREAM, "handshake frame ignored");
            }
            AlertDecode::Invalid(reason) => {
                if self.throttle.allow("invalid") {
                    tracing::warn!(stream = ALERT_STREAM, %reason, "alert frame dropped");
                }
            }
        }
    }
}

struct StreamRuntimeContext {
    label: &'static str,
    endpoint: String,
    status_store: Arc<RwLock<StreamStatusSnapshot>>,
    cancel_token: CancellationToken,
}

/// One supervised streaming connection.
///
/// The connection task owns the socket. Dropping this value cancels the task; [`dispose`](Self::dispose)
/// additionally waits for the socket to be closed.
pub struct StreamConnection {
    label: &'static str,
    status_store: Arc<RwLock<StreamStatusSnapshot>>,
    handle: Option<StreamHandle>,
}

impl StreamConnection {
    /// Spawns the connection task on the current tokio runtime.
    pub fn spawn<C, S>(
        label: &'static str,
        endpoint: impl Into<String>,
        policy: BackoffPolicy,
        connector: C,
        sink: S,
    ) -> Self
    where
        C: Connector,
        S: FrameSink,
    {
        let endpoint = endpoint.into();
        let status_store = Arc::new(RwLock::new(StreamStatusSnapshot::idle(endpoint.clone())));
        let cancellation_token = CancellationToken::new();

        let context = StreamRuntimeContext {
            label,
            endpoint,
            status_store: Arc::clone(&status_store),
            cancel_token: cancellation_token.clone(),
        };
        let join_handle = tokio::spawn(async move {
            run_stream(context, policy, connector, sink).await;
        });

        Self {
            label,
            status_store,
            handle: Some(StreamHandle {
                cancellation_token,
                join_handle,
            }),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn status(&self) -> StreamStatusSnapshot {
        self.status_store.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_store.read().state
    }

    /// Cancels the task without waiting. No connect attempt starts after this returns.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancellation_token.cancel();
        }
    }

    /// Cancels the task and waits until the socket is closed.
    pub async fn dispose(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancellation_token.cancel();
            if let Err(error) = handle.join_handle.await {
                tracing::warn!(stream = self.label, %error, "stream task ended abnormally");
            }
        }
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn run_stream<C, S>(
    context: StreamRuntimeContext,
    policy: BackoffPolicy,
    connector: C,
    mut sink: S,
) where
    C: Connector,
    S: FrameSink,
{
    let mut machine = ConnectionMachine::new(policy);
    let mut throttle = WarnThrottle::default();
    let cancel_token = &context.cancel_token;

    while !cancel_token.is_cancelled() {
        let reason = if machine.attempt() == 0 {
            "opening stream".to_string()
        } else {
            format!("reconnect attempt {}", machine.attempt())
        };
        if !publish_transition(
            &context,
            &mut machine,
            &mut throttle,
            ConnectionEvent::ConnectStarted,
            reason,
        ) {
            break;
        }
        {
            let mut writable = context.status_store.write();
            writable.connect_attempts = writable.connect_attempts.saturating_add(1);
        }

        let connect_result = tokio::select! {
            _ = cancel_token.cancelled() => break,
            result = connector.connect(&context.endpoint) => result,
        };

        let failure_reason = match connect_result {
            Ok(mut session) => {
                publish_transition(
                    &context,
                    &mut machine,
                    &mut throttle,
                    ConnectionEvent::Opened,
                    "stream connected".to_string(),
                );

                let outcome = pump_frames(&context, &mut session, &mut sink).await;
                session.close().await;

                match outcome {
                    Some(reason) => reason,
                    None => break,
                }
            }
            Err(error) => format!("connect error: {error}"),
        };

        if cancel_token.is_cancelled() {
            break;
        }

        publish_transition(
            &context,
            &mut machine,
            &mut throttle,
            ConnectionEvent::Failed,
            failure_reason,
        );
        let ConnectionState::Reconnecting { delay_ms, .. } = machine.state() else {
            break;
        };

        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
    }

    if let Some(state) = machine.apply(ConnectionEvent::Disposed) {
        let mut writable = context.status_store.write();
        writable.state = state;
        writable.reason = Some("stream disposed".to_string());
    }
    tracing::debug!(stream = context.label, "stream task stopped");
}

/// Reads frames until the session ends. Returns the failure reason, or `None` when cancelled.
async fn pump_frames<T, S>(
    context: &StreamRuntimeContext,
    session: &mut T,
    sink: &mut S,
) -> Option<String>
where
    T: Session,
    S: FrameSink,
{
    loop {
        let next = tokio::select! {
            _ = context.cancel_token.cancelled() => return None,
            next = session.next_frame() => next,
        };

        let frame = match next {
            None => return Some("connection closed by peer".to_string()),
            Some(Err(error)) => return Some(format!("stream frame error: {error}")),
            Some(Ok(Frame::Close)) => return Some("close frame received".to_string()),
            Some(Ok(frame)) => frame,
        };

        {
            let mut writable = context.status_store.write();
            writable.frames_received = writable.frames_received.saturating_add(1);
        }

        if let Some(decoded) = decode_frame(frame) {
            sink.on_frame(decoded, Utc::now());
        }
    }
}

/// Applies `event` and mirrors the result into the status store. Returns `false` once the
/// connection is no longer live.
fn publish_transition(
    context: &StreamRuntimeContext,
    machine: &mut ConnectionMachine,
    throttle: &mut WarnThrottle,
    event: ConnectionEvent,
    reason: String,
) -> bool {
    if context.cancel_token.is_cancelled() {
        return false;
    }
    let Some(state) = machine.apply(event) else {
        return machine.is_live();
    };

    match state {
        ConnectionState::Reconnecting { attempt, delay_ms } => {
            if throttle.allow(&reason) {
                tracing::warn!(
                    stream = context.label,
                    endpoint = %context.endpoint,
                    attempt,
                    delay_ms,
                    %reason,
                    "stream lost, scheduling reconnect"
                );
            }
        }
        ConnectionState::Open => {
            tracing::info!(stream = context.label, endpoint = %context.endpoint, "stream open");
        }
        _ => {
            tracing::debug!(stream = context.label, state = state.as_str(), %reason, "stream state changed");
        }
    }

    let mut writable = context.status_store.write();
    writable.state = state;
    writable.reason = Some(reason);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::transport::testing::{text, Script, ScriptedConnector};

    const HELLO: &str = r#"{"type":"hello"}"#;

    fn telemetry_stream(
        scripts: Vec<Script>,
        capacity: usize,
    ) -> (StreamConnection, ScriptedConnector, Arc<TelemetryStore>) {
        let connector = ScriptedConnector::new(scripts);
        let store = Arc::new(TelemetryStore::new(capacity));
        let sink = TelemetrySink::new(Arc::clone(&store), DecodeFailurePolicy::Degraded);
        let connection = StreamConnection::spawn(
            "telemetry",
            "ws://plant.test/ws/data",
            BackoffPolicy::default(),
            connector.clone(),
            sink,
        );
        (connection, connector, store)
    }

    fn connect_gaps_ms(connector: &ScriptedConnector) -> Vec<u128> {
        let log = connector.log.lock();
        log.connect_times
            .windows(2)
            .map(|pair| pair[1].duration_since(pair[0]).as_millis())
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(120)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_exponentially_between_failed_connects() {
        let (connection, connector, _store) = telemetry_stream(
            vec![Script::Refuse, Script::Refuse, Script::Refuse, Script::Hold(vec![])],
            10,
        );
        settle().await;

        assert_eq!(connect_gaps_ms(&connector), vec![2_000, 4_000, 8_000]);
        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(connection.status().connect_attempts, 4);
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_the_attempt_counter() {
        let (connection, connector, _store) = telemetry_stream(
            vec![
                Script::Refuse,
                Script::Frames(vec![]),
                Script::Refuse,
                Script::Hold(vec![]),
            ],
            10,
        );
        settle().await;

        assert_eq!(connect_gaps_ms(&connector), vec![2_000, 2_000, 4_000]);
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_during_backoff_prevents_further_connects() {
        let (connection, connector, _store) = telemetry_stream(vec![Script::Refuse], 10);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            connection.state(),
            ConnectionState::Reconnecting {
                attempt: 1,
                delay_ms: 2_000,
            }
        );

        connection.cancel();
        settle().await;

        assert_eq!(connector.connect_count(), 1);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.status().connect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_closes_the_live_socket_once() {
        let (connection, connector, _store) =
            telemetry_stream(vec![Script::Hold(vec![text(r#"{"power": 1}"#)])], 10);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(connection.state(), ConnectionState::Open);

        connection.dispose().await;
        settle().await;

        assert_eq!(connector.close_calls(), 1);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_closes_then_reconnects() {
        let (connection, connector, store) = telemetry_stream(
            vec![
                Script::Error(vec![text(r#"{"temperature": 99}"#)]),
                Script::Hold(vec![]),
            ],
            10,
        );
        settle().await;

        assert_eq!(connector.connect_count(), 2);
        assert_eq!(connector.close_calls(), 1);
        assert_eq!(connect_gaps_ms(&connector), vec![2_000]);
        assert_eq!(store.latest().and_then(|record| record.temperature), Some(99.0));
        assert_eq!(connection.state(), ConnectionState::Open);

        connection.dispose().await;
        assert_eq!(connector.close_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_do_not_stop_the_stream() {
        let (connection, _connector, store) = telemetry_stream(
            vec![Script::Hold(vec![
                text("not json at all"),
                text("[1, 2, 3]"),
                text(r#"{"metrics": {"vibration": 4.2}}"#),
            ])],
            10,
        );
        settle().await;

        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().rejected, 2);
        assert_eq!(
            store.last_rejected().map(|frame| frame.payload),
            Some("[1,2,3]".to_string())
        );
        assert_eq!(connection.status().frames_received, 3);
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn window_keeps_the_last_records_in_arrival_order() {
        let (connection, _connector, store) = telemetry_stream(
            vec![Script::Hold(vec![
                text(r#"{"metrics":{"temperature":100}}"#),
                text(r#"{"temperature":105}"#),
                text(r#"{"anomaly":true,"anomaly_type":"vibration","equipment":"kiln-1"}"#),
            ])],
            2,
        );
        settle().await;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].temperature, Some(105.0));
        assert!(!snapshot[0].anomaly);
        assert!(snapshot[1].anomaly);
        assert_eq!(snapshot[1].anomaly_type.as_deref(), Some("vibration"));
        assert_eq!(snapshot[1].equipment.as_deref(), Some("kiln-1"));
        assert_eq!(snapshot[1].temperature, None);
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_handshake_changes_nothing() {
        let (connection, _connector, store) = telemetry_stream(
            vec![Script::Hold(vec![text(r#"{"power": 5}"#), text(HELLO)])],
            10,
        );
        settle().await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().and_then(|record| record.power), Some(5.0));
        assert_eq!(store.stats().handshakes, 1);
        assert_eq!(store.stats().rejected, 0);
        connection.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn alert_handshake_does_not_replace_latest_alert() {
        let connector = ScriptedConnector::new(vec![Script::Hold(vec![
            text(r#"{"equipment":"mill-2","prob":0.93}"#),
            text(HELLO),
            text("{broken"),
        ])]);
        let (slot, mut receiver) = watch::channel(None);
        let connection = StreamConnection::spawn(
            "alerts",
            "ws://plant.test/ws/alerts",
            BackoffPolicy::default(),
            connector,
            AlertSink::new(slot),
        );
        settle().await;

        assert!(receiver.has_changed().expect("sender should be alive"));
        let latest = receiver.borrow_and_update().clone().expect("alert should be present");
        assert_eq!(latest.equipment.as_deref(), Some("mill-2"));
        assert_eq!(latest.prob, 0.93);
        connection.dispose().await;
    }

    #[test]
    fn throttle_suppresses_repeats_inside_window() {
        let mut throttle = WarnThrottle::default();
        assert!(throttle.allow("connect error"));
        assert!(!throttle.allow("connect error"));
        assert!(throttle.allow("frame error"));
    }
}
