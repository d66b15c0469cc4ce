use crate::types::{ChatId, FileKind, InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a text message, optionally with a reply keyboard.
    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<()>;

    /// Re-send an already uploaded file by its platform handle. `kind` must
    /// match how the file was first uploaded.
    async fn send_file(
        &self,
        _chat_id: &ChatId,
        _file_id: &str,
        _kind: FileKind,
        _caption: Option<&str>,
    ) -> Result<MessageId> {
        Err(anyhow::anyhow!("send_file is not supported by this channel"))
    }

    /// Copy a message from another chat (e.g. the storage channel) into `chat_id`.
    async fn copy_message(
        &self,
        _chat_id: &ChatId,
        _from_chat_id: &ChatId,
        _message_id: &MessageId,
    ) -> Result<MessageId> {
        Err(anyhow::anyhow!(
            "copy_message is not supported by this channel"
        ))
    }
}
