use crate::stream::record::{RejectedFrame, TelemetryRecord};
use crate::stream::window::RollingWindow;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct StreamHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub appended: u64,
    pub handshakes: u64,
    pub rejected: u64,
}

/// Rolling window plus ingest bookkeeping for the telemetry stream.
///
/// Only the telemetry stream task writes here; consumers go through the read-only accessors.
#[derive(Debug)]
pub struct TelemetryStore {
    window: RwLock<RollingWindow>,
    last_rejected: RwLock<Option<RejectedFrame>>,
    stats: Mutex<IngestStats>,
}

impl TelemetryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RwLock::new(RollingWindow::new(capacity)),
            last_rejected: RwLock::new(None),
            stats: Mutex::new(IngestStats::default()),
        }
    }

    pub(crate) fn append(&self, record: TelemetryRecord) {
        self.window.write().append(record);
        let mut stats = self.stats.lock();
        stats.appended = stats.appended.saturating_add(1);
    }

    pub(crate) fn record_handshake(&self) {
        let mut stats = self.stats.lock();
        stats.handshakes = stats.handshakes.saturating_add(1);
    }

    pub(crate) fn record_rejected(&self, frame: Option<RejectedFrame>) {
        if let Some(frame) = frame {
            *self.last_rejected.write() = Some(frame);
        }
        let mut stats = self.stats.lock();
        stats.rejected = stats.rejected.saturating_add(1);
    }

    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.window.read().snapshot()
    }

    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.window.read().latest()
    }

    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.window.read().capacity()
    }

    pub fn stats(&self) -> IngestStats {
        *self.stats.lock()
    }

    pub fn last_rejected(&self) -> Option<RejectedFrame> {
        self.last_rejected.read().clone()
    }
}
