//! Relays uploaded files into the storage channel.

use crate::error::{FlowError, FlowResult};
use sf_catalog::{ArchivalRef, MediaKind};
use sf_channels::{ChannelAdapter, ChatId, FileKind, MessageId, permanent_link};
use std::sync::Arc;

#[derive(Clone)]
pub struct ArchivalForwarder {
    channel: Arc<dyn ChannelAdapter>,
    storage_chat: ChatId,
}

impl ArchivalForwarder {
    pub fn new(channel: Arc<dyn ChannelAdapter>, storage_chat: impl Into<ChatId>) -> Self {
        Self {
            channel,
            storage_chat: storage_chat.into(),
        }
    }

    /// Post the file into the storage channel and return where it landed.
    #[tracing::instrument(level = "info", skip_all, fields(storage_chat = %self.storage_chat))]
    pub async fn forward(
        &self,
        file_id: &str,
        media: MediaKind,
        caption: &str,
    ) -> FlowResult<ArchivalRef> {
        let message_id = self
            .channel
            .send_file(&self.storage_chat, file_id, file_kind(media), Some(caption))
            .await
            .map_err(|e| FlowError::ForwardFailed(e.to_string()))?;
        let channel_message_id: i64 = message_id.parse().map_err(|_| {
            FlowError::ForwardFailed(format!("non-numeric storage message id {message_id}"))
        })?;
        Ok(ArchivalRef {
            channel_message_id,
            permanent_link: permanent_link(&self.storage_chat, channel_message_id),
        })
    }

    /// Copy an archived message back to a user chat.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id, channel_message_id = channel_message_id))]
    pub async fn redeliver(&self, chat_id: &ChatId, channel_message_id: i64) -> FlowResult<()> {
        let message_id = MessageId::new(channel_message_id.to_string());
        self.channel
            .copy_message(chat_id, &self.storage_chat, &message_id)
            .await?;
        Ok(())
    }
}

pub fn media_kind(kind: FileKind) -> MediaKind {
    match kind {
        FileKind::Document => MediaKind::Document,
        FileKind::Video => MediaKind::Video,
    }
}

pub fn file_kind(media: MediaKind) -> FileKind {
    match media {
        MediaKind::Document => FileKind::Document,
        MediaKind::Video => FileKind::Video,
    }
}

pub fn movie_caption(title: &str, language: &str) -> String {
    format!("{title}\nLanguage: {language}")
}

pub fn episode_caption(title: &str, season: u32, episode: u32) -> String {
    format!("{title} S{season:02}E{episode:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingChannel;

    #[tokio::test]
    async fn forward_returns_permanent_link_for_storage_message() {
        let channel = Arc::new(RecordingChannel::new());
        let forwarder = ArchivalForwarder::new(channel.clone(), "-1009876");

        let archive = forwarder
            .forward("BQAC-1", MediaKind::Video, &episode_caption("Dark", 1, 3))
            .await
            .expect("forward");

        let files = channel.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].chat_id, "-1009876");
        assert_eq!(files[0].caption.as_deref(), Some("Dark S01E03"));
        assert_eq!(files[0].kind, FileKind::Video);
        assert_eq!(
            archive.permanent_link,
            format!("https://t.me/c/9876/{}", archive.channel_message_id)
        );
    }

    #[tokio::test]
    async fn transport_failure_becomes_forward_failed() {
        let channel = Arc::new(RecordingChannel::new());
        channel.fail_files(true);
        let forwarder = ArchivalForwarder::new(channel, "-1009876");

        let err = forwarder
            .forward("x", MediaKind::Document, "caption")
            .await.expect_err("fails");
        assert!(matches!(err, FlowError::ForwardFailed(_)));
    }
}
