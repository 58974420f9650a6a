//! The slice of the telegram bot api used by transfers and the status api.

use std::path::Path;

use async_trait::async_trait;
use futures_util::StreamExt;
use teloxide::{net::Download, prelude::*};
use tokio::io::AsyncWriteExt;

/// A video message waiting to be relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRef {
    pub chat_id: i64,
    pub message_id: i32,
    pub file_id: String,
    pub file_name: Option<String>,
    pub size: u64,
}

impl VideoRef {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let video = msg.video()?;
        Some(Self {
            chat_id: msg.chat.id.0,
            message_id: msg.id.0,
            file_id: video.file.id.to_string(),
            file_name: video.file_name.clone(),
            size: u64::from(video.file.size),
        })
    }
}

#[async_trait]
pub trait Messenger: Send + Sync {
    /// Username of the bot account, fails when the session is not usable.
    async fn username(&self) -> anyhow::Result<String>;

    async fn send_text(&self, chat_id: i64, text: String) -> anyhow::Result<()>;

    /// Save a telegram file to `dest`, reporting `(received, total)` bytes.
    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> anyhow::Result<u64>;
}

#[async_trait]
impl Messenger for Bot {
    async fn username(&self) -> anyhow::Result<String> {
        let me = self.get_me().await?;
        Ok(me.user.username.clone().unwrap_or_default())
    }

    async fn send_text(&self, chat_id: i64, text: String) -> anyhow::Result<()> {
        self.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }

    async fn download(
        &self,
        file_id: &str,
        dest: &Path,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> anyhow::Result<u64> {
        let file = self.get_file(file_id.to_owned()).await?;
        let total = u64::from(file.size);
        let mut dst = tokio::fs::File::create(dest).await?;
        let mut stream = self.download_file_stream(&file.path);
        let mut received = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            dst.write_all(&chunk).await?;
            received += chunk.len() as u64;
            progress(received, total);
        }
        dst.flush().await?;
        Ok(received)
    }
}
