use std::{path::PathBuf, sync::Arc};

use hashlink::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::{
    config::{Param, TransferConfig},
    constants::{TRANSFER_HISTORY_SIZE, VIDEO_INBOX_SIZE},
    drive::VideoStorage,
    format::msg::MsgProgress,
    telegram::{Messenger, VideoRef},
    transfer::{run_transfer, Relay},
};

pub type TransferId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Downloading,
    Uploading,
    Done,
    Error,
    Cancelled,
}

impl Phase {
    pub fn is_finished(self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Cancelled)
    }
}

/// Status record returned by the api, replaced wholesale on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub status: Phase,
    pub progress: u8,
    pub message: String,
}

impl TransferStatus {
    pub fn new(status: Phase, progress: u8, message: impl Into<String>) -> Self {
        Self {
            status,
            progress: progress.min(100),
            message: message.into(),
        }
    }

    pub fn idle() -> Self {
        Self::new(Phase::Idle, 0, "")
    }

    pub fn starting() -> Self {
        Self::new(Phase::Downloading, 0, MsgProgress::Starting.to_string())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Phase::Error, 0, message)
    }
}

pub enum CancelResult {
    Cancelled,
    NotFound,
    Finished,
}

struct TransferEntry {
    status: TransferStatus,
    abort: Option<AbortHandle>,
}

struct TransfersInner {
    entries: LruCache<TransferId, TransferEntry>,
    latest: Option<TransferId>,
}

/// Per-transfer status records.
///
/// Each transfer owns its own record; `latest` only points at the most
/// recently started one for the single-slot status endpoint.
pub struct Transfers {
    inner: Mutex<TransfersInner>,
}

impl Default for Transfers {
    fn default() -> Self {
        Self::new(TRANSFER_HISTORY_SIZE)
    }
}

impl Transfers {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TransfersInner {
                entries: LruCache::new(capacity),
                latest: None,
            }),
        }
    }

    /// Register a new transfer in the starting state and make it the latest.
    pub fn begin(&self) -> TransferId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            id,
            TransferEntry {
                status: TransferStatus::starting(),
                abort: None,
            },
        );
        inner.latest = Some(id);
        id
    }

    /// Record a transfer that failed before it could be started.
    pub fn record_failure(&self, status: TransferStatus) -> TransferId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        inner.entries.insert(id, TransferEntry { status, abort: None });
        inner.latest = Some(id);
        id
    }

    pub fn attach(&self, id: TransferId, abort: AbortHandle) {
        if let Some(entry) = self.inner.lock().entries.get_mut(&id) {
            entry.abort = Some(abort);
        }
    }

    /// Replace the record of `id`. Writes after a cancellation are dropped.
    pub fn update(&self, id: TransferId, status: TransferStatus) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return;
        };
        if entry.status.status == Phase::Cancelled {
            return;
        }
        entry.status = status;
    }

    pub fn get(&self, id: &TransferId) -> Option<TransferStatus> {
        self.inner
            .lock()
            .entries
            .peek(id)
            .map(|entry| entry.status.clone())
    }

    pub fn latest(&self) -> TransferStatus {
        let inner = self.inner.lock();
        inner
            .latest
            .and_then(|id| inner.entries.peek(&id))
            .map(|entry| entry.status.clone())
            .unwrap_or_else(TransferStatus::idle)
    }

    pub fn cancel(&self, id: &TransferId) -> CancelResult {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return CancelResult::NotFound;
        };
        if entry.status.status.is_finished() {
            return CancelResult::Finished;
        }
        if let Some(abort) = entry.abort.take() {
            abort.abort();
        }
        entry.status = TransferStatus::new(
            Phase::Cancelled,
            entry.status.progress,
            "Transfer cancelled",
        );
        CancelResult::Cancelled
    }

    pub fn reporter(self: &Arc<Self>, id: TransferId) -> TransferReporter {
        TransferReporter {
            transfers: self.clone(),
            id,
        }
    }
}

/// Write handle for the record of a single transfer.
#[derive(Clone)]
pub struct TransferReporter {
    transfers: Arc<Transfers>,
    id: TransferId,
}

impl TransferReporter {
    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn report(&self, status: TransferStatus) {
        self.transfers.update(self.id, status);
    }
}

struct InboxInner {
    videos: LruCache<(i64, i32), VideoRef>,
    // chat id -> latest video message id
    latest: LruCache<i64, i32>,
}

/// Recently received videos, used to resolve transfers started from the api.
pub struct VideoInbox {
    inner: Mutex<InboxInner>,
}

impl Default for VideoInbox {
    fn default() -> Self {
        Self::new(VIDEO_INBOX_SIZE)
    }
}

impl VideoInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(InboxInner {
                videos: LruCache::new(capacity),
                latest: LruCache::new(capacity),
            }),
        }
    }

    pub fn record(&self, video: VideoRef) {
        let mut inner = self.inner.lock();
        let newer = inner
            .latest
            .peek(&video.chat_id)
            .map_or(true, |latest| *latest <= video.message_id);
        if newer {
            inner.latest.insert(video.chat_id, video.message_id);
        }
        inner
            .videos
            .insert((video.chat_id, video.message_id), video);
    }

    /// Find a video by message id, or the latest video of the chat.
    pub fn find(&self, chat_id: i64, message_id: Option<i32>) -> Option<VideoRef> {
        let mut inner = self.inner.lock();
        let message_id = match message_id {
            Some(id) => id,
            None => *inner.latest.get(&chat_id)?,
        };
        inner.videos.get(&(chat_id, message_id)).cloned()
    }
}

pub struct State {
    pub messenger: Arc<dyn Messenger>,
    pub storage: Arc<dyn VideoStorage>,
    pub transfers: Arc<Transfers>,
    pub inbox: VideoInbox,
    pub transfer_config: TransferConfig,
}

impl State {
    pub fn new<C: Param<TransferConfig>>(
        cfg: &C,
        messenger: Arc<dyn Messenger>,
        storage: Arc<dyn VideoStorage>,
    ) -> Self {
        Self {
            messenger,
            storage,
            transfers: Arc::new(Transfers::default()),
            inbox: VideoInbox::default(),
            transfer_config: cfg.param(),
        }
    }

    pub fn relay(&self) -> Relay<'_> {
        Relay {
            messenger: self.messenger.as_ref(),
            storage: self.storage.as_ref(),
            temp_dir: PathBuf::from(&self.transfer_config.temp_dir),
        }
    }

    /// Register a transfer and run it on a background task.
    ///
    /// The starting record is visible before the task is spawned.
    pub fn spawn_transfer(self: &Arc<Self>, video: VideoRef) -> (TransferId, JoinHandle<()>) {
        let id = self.transfers.begin();
        let reporter = self.transfers.reporter(id);
        let handle = tokio::spawn(run_transfer(self.clone(), reporter, video));
        self.transfers.attach(id, handle.abort_handle());
        (id, handle)
    }
}
