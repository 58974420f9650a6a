//! The relay pipeline shared by the bot and the status api:
//! telegram -> local temp file -> google drive.

use std::{
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::FutureExt;

use crate::{
    drive::{FileMetadata, RemoteFile, VideoStorage},
    format::{
        msg::{MsgProgress, MsgUploadDone, MsgUploadFailed},
        overall_progress,
    },
    state::{Phase, State, TransferId, TransferReporter, TransferStatus},
    telegram::{Messenger, VideoRef},
};

/// Local copy of a video, removed when dropped.
///
/// Dropping also happens when the owning task is aborted, so cancelled
/// transfers do not leave files behind.
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    // Drop cannot await; removing a single file inline is cheap enough to
    // run on the worker thread.
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("Failed to remove temp file {}: {e}", self.path.display());
            }
        }
    }
}

/// Local path for a video, unique per transfer so that relaying the same
/// video twice at once never shares a file.
pub fn temp_path(temp_dir: &Path, file_id: &str, transfer_id: TransferId) -> PathBuf {
    temp_dir.join(format!("temp_{file_id}_{}.mp4", transfer_id.simple()))
}

pub struct Relay<'a> {
    pub messenger: &'a dyn Messenger,
    pub storage: &'a dyn VideoStorage,
    pub temp_dir: PathBuf,
}

impl Relay<'_> {
    pub async fn run(
        &self,
        video: &VideoRef,
        reporter: &TransferReporter,
    ) -> anyhow::Result<RemoteFile> {
        let temp = TempFile::new(temp_path(&self.temp_dir, &video.file_id, reporter.id()));

        reporter.report(TransferStatus::starting());
        let received = self
            .messenger
            .download(&video.file_id, temp.path(), &|done, total| {
                reporter.report(TransferStatus::new(
                    Phase::Downloading,
                    overall_progress(false, done, total),
                    MsgProgress::Downloading { done, total }.to_string(),
                ));
            })
            .await?;
        tracing::info!(
            "Downloaded video {} ({received} bytes) to {}",
            video.file_id,
            temp.path().display()
        );

        reporter.report(TransferStatus::new(
            Phase::Uploading,
            overall_progress(true, 0, received),
            MsgProgress::Uploading {
                done: 0,
                total: received,
            }
            .to_string(),
        ));
        let metadata = FileMetadata::video(video.file_name.as_deref());
        let remote = self
            .storage
            .upload(temp.path(), &metadata, &|done, total| {
                reporter.report(TransferStatus::new(
                    Phase::Uploading,
                    overall_progress(true, done, total),
                    MsgProgress::Uploading { done, total }.to_string(),
                ));
            })
            .await?;
        tracing::info!("Uploaded video {} as drive file {}", video.file_id, remote.id);
        Ok(remote)
    }
}

/// Relay one video, record the outcome and tell the chat about it.
///
/// Failures are logged with their cause while the chat only gets the
/// generic failure text. A panic inside the relay is treated as a failure
/// so the record never stays in a running phase.
pub async fn run_transfer(state: Arc<State>, reporter: TransferReporter, video: VideoRef) {
    let outcome = AssertUnwindSafe(relay_and_report(&state, &reporter, &video))
        .catch_unwind()
        .await;
    let text = outcome.unwrap_or_else(|_| {
        tracing::error!("Transfer {} of video {} panicked", reporter.id(), video.file_id);
        reporter.report(TransferStatus::error("transfer task panicked"));
        MsgUploadFailed.to_string()
    });
    if let Err(e) = state.messenger.send_text(video.chat_id, text).await {
        tracing::warn!("Failed to notify chat {}: {e}", video.chat_id);
    }
}

async fn relay_and_report(state: &State, reporter: &TransferReporter, video: &VideoRef) -> String {
    match state.relay().run(video, reporter).await {
        Ok(remote) => {
            let text = MsgUploadDone { file_id: &remote.id }.to_string();
            reporter.report(TransferStatus::new(Phase::Done, 100, text.clone()));
            text
        }
        Err(e) => {
            tracing::error!("Transfer {} of video {} failed: {e:#}", reporter.id(), video.file_id);
            reporter.report(TransferStatus::error(e.to_string()));
            MsgUploadFailed.to_string()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        path::Path,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{config::TransferConfig, drive::DriveError};

    /// Telegram stand-in writing fixed content and recording sent texts.
    #[derive(Default)]
    pub(crate) struct FakeMessenger {
        pub username: Option<String>,
        pub sent: Mutex<Vec<(i64, String)>>,
        pub downloads: AtomicUsize,
    }

    #[async_trait]
    impl Messenger for FakeMessenger {
        async fn username(&self) -> anyhow::Result<String> {
            self.username
                .clone()
                .ok_or_else(|| anyhow::anyhow!("bot session is not available"))
        }

        async fn send_text(&self, chat_id: i64, text: String) -> anyhow::Result<()> {
            self.sent.lock().push((chat_id, text));
            Ok(())
        }

        async fn download(
            &self,
            _file_id: &str,
            dest: &Path,
            progress: &(dyn Fn(u64, u64) + Send + Sync),
        ) -> anyhow::Result<u64> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(dest, b"video-bytes").await?;
            progress(11, 11);
            Ok(11)
        }
    }

    /// Drive stand-in that checks the temp file exists while uploading.
    pub(crate) struct FakeStorage {
        pub fail: bool,
        pub delay: Duration,
        pub uploads: AtomicUsize,
        pub seen_file: Mutex<Option<bool>>,
    }

    impl FakeStorage {
        pub fn new(fail: bool) -> Self {
            Self {
                fail,
                delay: Duration::ZERO,
                uploads: AtomicUsize::new(0),
                seen_file: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl VideoStorage for FakeStorage {
        async fn upload(
            &self,
            path: &Path,
            metadata: &FileMetadata,
            progress: &(dyn Fn(u64, u64) + Send + Sync),
        ) -> Result<RemoteFile, DriveError> {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            *self.seen_file.lock() = Some(path.exists());
            assert_eq!(metadata.mime_type, "video/mp4");
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(DriveError::MissingSession);
            }
            progress(11, 11);
            Ok(RemoteFile {
                id: "drive-123".to_string(),
            })
        }
    }

    /// Drive stand-in that panics halfway through an upload.
    struct PanickingStorage;

    #[async_trait]
    impl VideoStorage for PanickingStorage {
        async fn upload(
            &self,
            _path: &Path,
            _metadata: &FileMetadata,
            progress: &(dyn Fn(u64, u64) + Send + Sync),
        ) -> Result<RemoteFile, DriveError> {
            progress(0, 11);
            panic!("upload exploded");
        }
    }

    pub(crate) fn test_state(
        temp_dir: &Path,
        messenger: FakeMessenger,
        storage: FakeStorage,
    ) -> Arc<State> {
        let cfg = TransferConfig {
            temp_dir: temp_dir.display().to_string(),
            auto_upload: true,
        };
        Arc::new(State::new(&cfg, Arc::new(messenger), Arc::new(storage)))
    }

    pub(crate) fn video() -> VideoRef {
        VideoRef {
            chat_id: 42,
            message_id: 7,
            file_id: "AgADfile".to_string(),
            file_name: Some("holiday.mp4".to_string()),
            size: 11,
        }
    }

    /// Temp files left in `dir`.
    pub(crate) fn leftover_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_temp_path() {
        let id = TransferId::nil();
        assert_eq!(
            temp_path(Path::new("/tmp"), "abc", id),
            PathBuf::from("/tmp/temp_abc_00000000000000000000000000000000.mp4")
        );
        assert_ne!(
            temp_path(Path::new("/tmp"), "abc", TransferId::new_v4()),
            temp_path(Path::new("/tmp"), "abc", TransferId::new_v4())
        );
    }

    #[test]
    fn test_temp_file_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.mp4");
        std::fs::write(&path, b"x").unwrap();
        drop(TempFile::new(path.clone()));
        assert!(!path.exists());
        // missing file is fine
        drop(TempFile::new(path));
    }

    async fn relay_with(fail: bool) -> (Arc<State>, TransferReporter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), FakeMessenger::default(), FakeStorage::new(fail));
        let id = state.transfers.begin();
        let reporter = state.transfers.reporter(id);
        run_transfer(state.clone(), reporter.clone(), video()).await;
        (state, reporter, dir)
    }

    #[tokio::test]
    async fn test_successful_transfer_cleans_up_and_replies_with_id() {
        let (state, reporter, dir) = relay_with(false).await;

        assert_eq!(leftover_files(dir.path()), 0);

        let status = state.transfers.get(&reporter.id()).unwrap();
        assert_eq!(status.status, Phase::Done);
        assert_eq!(status.progress, 100);
        assert!(status.message.contains("drive-123"));
    }

    #[tokio::test]
    async fn test_failed_transfer_cleans_up_and_replies_generic_error() {
        let (state, reporter, dir) = relay_with(true).await;

        assert_eq!(leftover_files(dir.path()), 0);
        let status = state.transfers.get(&reporter.id()).unwrap();
        assert_eq!(status.status, Phase::Error);
    }

    #[tokio::test]
    async fn test_replies_and_file_visibility() {
        for fail in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let messenger = Arc::new(FakeMessenger::default());
            let storage = Arc::new(FakeStorage::new(fail));
            let cfg = TransferConfig {
                temp_dir: dir.path().display().to_string(),
                auto_upload: true,
            };
            let state = Arc::new(State::new(&cfg, messenger.clone(), storage.clone()));
            let reporter = state.transfers.reporter(state.transfers.begin());

            run_transfer(state.clone(), reporter, video()).await;

            // the file existed while uploading and is gone afterwards
            assert_eq!(*storage.seen_file.lock(), Some(true));
            assert_eq!(leftover_files(dir.path()), 0);

            let sent = messenger.sent.lock().clone();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].0, 42);
            if fail {
                assert_eq!(sent[0].1, MsgUploadFailed.to_string());
                assert!(!sent[0].1.contains("drive-123"));
            } else {
                assert!(sent[0].1.contains("drive-123"));
            }
        }
    }

    #[tokio::test]
    async fn test_panicking_transfer_is_recorded_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let messenger = Arc::new(FakeMessenger::default());
        let cfg = TransferConfig {
            temp_dir: dir.path().display().to_string(),
            auto_upload: true,
        };
        let state = Arc::new(State::new(&cfg, messenger.clone(), Arc::new(PanickingStorage)));

        let (id, handle) = state.spawn_transfer(video());
        handle.await.unwrap();

        let status = state.transfers.get(&id).unwrap();
        assert_eq!(status.status, Phase::Error);
        assert_eq!(leftover_files(dir.path()), 0);
        assert_eq!(
            messenger.sent.lock().clone(),
            vec![(42, MsgUploadFailed.to_string())]
        );
        assert!(matches!(
            state.transfers.cancel(&id),
            crate::state::CancelResult::Finished
        ));
    }
}
