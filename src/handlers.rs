//! Message handlers for the Telegram bot.
//!
//! Commands get static replies, video messages are relayed to drive and
//! other messages in private chats get a hint to send a video.

use std::sync::Arc;

use teloxide::{prelude::*, types::Me, utils::command::BotCommands};

use crate::format::msg::{MsgReceiving, MsgSendVideo, MsgStart, MsgVideoStored};
use crate::state::State;
use crate::telegram::VideoRef;
use crate::Command;

/// Handle incoming messages from Telegram.
pub async fn message_handler(
    msg: Message,
    me: Me,
    state: Arc<State>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let chat_id = msg.chat.id.0;
    if let Some(text) = msg.text() {
        if handle_command(&state, chat_id, text, me.username()).await? {
            return Ok(());
        }
    }

    handle_video(
        &state,
        chat_id,
        msg.chat.is_private(),
        VideoRef::from_message(&msg),
    )
    .await?;
    Ok(())
}

/// Reply to a bot command. Returns `false` when `text` is not one of ours.
pub async fn handle_command(
    state: &State,
    chat_id: i64,
    text: &str,
    bot_name: &str,
) -> anyhow::Result<bool> {
    let Ok(cmd) = Command::parse(text, bot_name) else {
        return Ok(false);
    };
    let reply = match cmd {
        Command::Help => Command::descriptions().to_string(),
        Command::Start => MsgStart.to_string(),
    };
    state.messenger.send_text(chat_id, reply).await?;
    Ok(true)
}

/// Relay a received video, or ask for one when a private chat sent none.
///
/// Group chatter and service messages without a video are ignored.
pub async fn handle_video(
    state: &Arc<State>,
    chat_id: i64,
    private_chat: bool,
    video: Option<VideoRef>,
) -> anyhow::Result<()> {
    let Some(video) = video else {
        if !private_chat {
            return Ok(());
        }
        state
            .messenger
            .send_text(chat_id, MsgSendVideo.to_string())
            .await?;
        return Ok(());
    };
    state.inbox.record(video.clone());

    if !state.transfer_config.auto_upload {
        state
            .messenger
            .send_text(
                chat_id,
                MsgVideoStored {
                    message_id: video.message_id,
                }
                .to_string(),
            )
            .await?;
        return Ok(());
    }

    state
        .messenger
        .send_text(chat_id, MsgReceiving.to_string())
        .await?;
    let (id, handle) = state.spawn_transfer(video);
    tracing::info!("Transfer {id} started from chat {chat_id}");
    if let Err(e) = handle.await {
        if e.is_cancelled() {
            tracing::info!("Transfer {id} cancelled");
        } else {
            tracing::error!("Transfer {id} task failed: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::TransferConfig;
    use crate::format::msg::{MsgUploadDone, MsgUploadFailed};
    use crate::state::Phase;
    use crate::transfer::tests::{leftover_files, video, FakeMessenger, FakeStorage};

    fn state_with(
        dir: &std::path::Path,
        auto_upload: bool,
        fail: bool,
    ) -> (Arc<State>, Arc<FakeMessenger>, Arc<FakeStorage>) {
        let messenger = Arc::new(FakeMessenger::default());
        let storage = Arc::new(FakeStorage::new(fail));
        let cfg = TransferConfig {
            temp_dir: dir.display().to_string(),
            auto_upload,
        };
        let state = Arc::new(State::new(&cfg, messenger.clone(), storage.clone()));
        (state, messenger, storage)
    }

    #[tokio::test]
    async fn test_message_without_video() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, storage) = state_with(dir.path(), true, false);

        handle_video(&state, 42, true, None).await.unwrap();

        assert_eq!(messenger.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(
            messenger.sent.lock().clone(),
            vec![(42, MsgSendVideo.to_string())]
        );
        assert!(state.inbox.find(42, None).is_none());
    }

    #[tokio::test]
    async fn test_video_is_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, storage) = state_with(dir.path(), true, false);

        handle_video(&state, 42, true, Some(video())).await.unwrap();

        assert_eq!(messenger.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(*storage.seen_file.lock(), Some(true));
        assert_eq!(leftover_files(dir.path()), 0);
        assert_eq!(
            messenger.sent.lock().clone(),
            vec![
                (42, MsgReceiving.to_string()),
                (
                    42,
                    MsgUploadDone {
                        file_id: "drive-123"
                    }
                    .to_string()
                ),
            ]
        );
        assert_eq!(state.transfers.latest().status, Phase::Done);
    }

    #[tokio::test]
    async fn test_failed_upload_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, _storage) = state_with(dir.path(), true, true);

        handle_video(&state, 42, true, Some(video())).await.unwrap();

        assert_eq!(leftover_files(dir.path()), 0);
        let sent = messenger.sent.lock().clone();
        assert_eq!(sent.last().unwrap().1, MsgUploadFailed.to_string());
        assert_eq!(state.transfers.latest().status, Phase::Error);
    }

    #[tokio::test]
    async fn test_video_stored_without_auto_upload() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, storage) = state_with(dir.path(), false, false);

        handle_video(&state, 42, true, Some(video())).await.unwrap();

        assert_eq!(messenger.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(state.inbox.find(42, None), Some(video()));
        assert_eq!(state.transfers.latest().status, Phase::Idle);
    }

    #[tokio::test]
    async fn test_group_message_without_video_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, _storage) = state_with(dir.path(), true, false);

        handle_video(&state, -100, false, None).await.unwrap();

        assert!(messenger.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (state, messenger, storage) = state_with(dir.path(), true, false);

        assert!(handle_command(&state, 42, "/help", "teledrive_bot")
            .await
            .unwrap());
        assert!(handle_command(&state, 42, "/start@teledrive_bot", "teledrive_bot")
            .await
            .unwrap());
        assert_eq!(
            messenger.sent.lock().clone(),
            vec![
                (42, Command::descriptions().to_string()),
                (42, MsgStart.to_string()),
            ]
        );

        // not ours: plain text, unknown commands, commands for another bot
        for text in ["hello", "/unknown", "/start@other_bot"] {
            assert!(!handle_command(&state, 42, text, "teledrive_bot")
                .await
                .unwrap());
        }
        assert_eq!(messenger.sent.lock().len(), 2);
        assert_eq!(messenger.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(storage.uploads.load(Ordering::SeqCst), 0);
    }
}
