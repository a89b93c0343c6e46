//! Consumer-facing handle over the telemetry and alert streams.

use crate::state::{IngestStats, TelemetryStore};
use crate::stream::pipeline::{AlertSink, StreamConnection, TelemetrySink};
use crate::stream::record::{AlertEvent, RejectedFrame, TelemetryRecord};
use crate::stream::transport::{Connector, WsConnector};
use crate::stream::types::{ClientConfig, ConnectionState, StreamStatusSnapshot};
use crate::stream::{ALERT_STREAM, TELEMETRY_STREAM};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns both stream connections for one dashboard session.
///
/// Everything handed out is a copy; nothing a consumer holds can mutate the window or the connection
/// state. Call [`dispose`](Self::dispose) to tear down deterministically. Dropping the client cancels
/// both connections without waiting for the sockets to close.
pub struct TelemetryClient {
    store: Arc<TelemetryStore>,
    telemetry: StreamConnection,
    alerts: StreamConnection,
    alert_slot: watch::Receiver<Option<AlertEvent>>,
    subscriptions: CancellationToken,
}

impl TelemetryClient {
    /// Connects both streams over websockets. Must be called inside a tokio runtime.
    pub fn start(config: &ClientConfig) -> Self {
        let connector = WsConnector::new(config.max_message_bytes);
        Self::with_connectors(config, connector, connector)
    }

    pub fn with_connectors<T, A>(config: &ClientConfig, telemetry_connector: T, alert_connector: A) -> Self
    where
        T: Connector,
        A: Connector,
    {
        let store = Arc::new(TelemetryStore::new(config.window_capacity));
        let telemetry = StreamConnection::spawn(
            TELEMETRY_STREAM,
            config.telemetry_url.clone(),
            config.backoff,
            telemetry_connector,
            TelemetrySink::new(Arc::clone(&store), config.decode_failure_policy),
        );

        let (slot, alert_slot) = watch::channel(None);
        let alerts = StreamConnection::spawn(
            ALERT_STREAM,
            config.alerts_url.clone(),
            config.backoff,
            alert_connector,
            AlertSink::new(slot),
        );

        Self {
            store,
            telemetry,
            alerts,
            alert_slot,
            subscriptions: CancellationToken::new(),
        }
    }

    /// The rolling window, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.store.snapshot()
    }

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.store.latest()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.telemetry.state()
    }

    pub fn alert_connection_state(&self) -> ConnectionState {
        self.alerts.state()
    }

    pub fn telemetry_status(&self) -> StreamStatusSnapshot {
        self.telemetry.status()
    }

    pub fn alert_status(&self) -> StreamStatusSnapshot {
        self.alerts.status()
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.store.stats()
    }

    /// Only populated under the `degraded` decode failure policy.
    pub fn last_rejected_frame(&self) -> Option<RejectedFrame> {
        self.store.last_rejected()
    }

    pub fn latest_alert(&self) -> Option<AlertEvent> {
        self.alert_slot.borrow().clone()
    }

    /// A receiver that reports alerts published after this call.
    pub fn alert_receiver(&self) -> watch::Receiver<Option<AlertEvent>> {
        let mut receiver = self.alert_slot.clone();
        let _ = receiver.borrow_and_update();
        receiver
    }

    /// Runs `handler` once for every alert published after this call.
    ///
    /// Alerts supersede each other: a handler that falls behind sees only the newest one.
    pub fn subscribe_to_alerts<F>(&self, mut handler: F) -> AlertSubscription
    where
        F: FnMut(AlertEvent) + Send + 'static,
    {
        let mut receiver = self.alert_receiver();
        let cancellation_token = self.subscriptions.child_token();
        let task_token = cancellation_token.clone();

        let join_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let alert = receiver.borrow_and_update().clone();
                        if let Some(alert) = alert {
                            handler(alert);
                        }
                    }
                }
            }
        });

        AlertSubscription {
            cancellation_token,
            join_handle: Some(join_handle),
        }
    }

    pub async fn dispose(self) {
        self.subscriptions.cancel();
        tokio::join!(self.telemetry.dispose(), self.alerts.dispose());
        tracing::info!("telemetry client disposed");
    }
}

/// Keeps an alert handler registered. Dropping it unsubscribes.
pub struct AlertSubscription {
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl AlertSubscription {
    /// Unsubscribes and waits for an in-flight handler call to finish.
    pub async fn unsubscribe(mut self) {
        self.cancellation_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            if let Err(error) = join_handle.await {
                tracing::warn!(stream = ALERT_STREAM, %error, "alert handler ended abnormally");
            }
        }
    }
}

impl Drop for AlertSubscription {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
