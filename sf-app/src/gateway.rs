//! Inbound loop: every chat message goes through the conversation engine,
//! and the engine's replies go back out through the channel.

use crate::archive::{ArchivalForwarder, file_kind};
use crate::conversation::{Control, ConversationEngine, Outcome, Reply};
use anyhow::Result;
use futures_util::FutureExt;
use sf_channels::{ChannelAdapter, ChatId, InboundMessage, OutboundMessage};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";
const FILE_DELIVERY_FAILED: &str = "Could not send that file. Please try again.";

pub struct Gateway {
    engine: Arc<ConversationEngine>,
    forwarder: ArchivalForwarder,
    channel: Arc<dyn ChannelAdapter>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        engine: Arc<ConversationEngine>,
        forwarder: ArchivalForwarder,
        channel: Arc<dyn ChannelAdapter>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            forwarder,
            channel,
            inbound_rx: Mutex::new(inbound_rx),
            shutdown,
        }
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
            tracing::info!("gateway loop exited");
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self) {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                msg = rx.recv() => msg,
            };
            let Some(inbound) = inbound else {
                return;
            };
            if let Err(e) = self.handle_inbound(inbound).await {
                tracing::warn!(error = %e, "handle_inbound failed");
            }
        }
    }

    /// A panic inside one chat's step is contained here so the loop keeps
    /// serving every other chat.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %inbound.chat_id, message_id = %inbound.message_id))]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let outcome = match AssertUnwindSafe(self.engine.advance(&inbound))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("conversation step panicked");
                self.channel
                    .send(&inbound.chat_id, OutboundMessage::text(GENERIC_FAILURE))
                    .await?;
                return Ok(());
            }
        };
        self.deliver(&inbound.chat_id, outcome).await
    }

    async fn deliver(&self, chat_id: &ChatId, outcome: Outcome) -> Result<()> {
        let Outcome { replies, control } = outcome;
        for reply in replies {
            match reply {
                Reply::Text {
                    text,
                    options: Some(options),
                } => {
                    self.channel
                        .send(chat_id, OutboundMessage::with_options(text, options))
                        .await?
                }
                Reply::Text {
                    text,
                    options: None,
                } => self.channel.send(chat_id, OutboundMessage::text(text)).await?,
                Reply::File {
                    file_id,
                    media,
                    caption,
                } => {
                    if let Err(e) = self
                        .channel
                        .send_file(chat_id, &file_id, file_kind(media), caption.as_deref())
                        .await
                    {
                        tracing::warn!(error = %e, %file_id, "file delivery failed");
                        self.channel
                            .send(chat_id, OutboundMessage::text(FILE_DELIVERY_FAILED))
                            .await?;
                    }
                }
                Reply::WebApp { text, label, url } => {
                    self.channel
                        .send(chat_id, OutboundMessage::with_web_app(text, label, url))
                        .await?
                }
                Reply::Archived { channel_message_id } => {
                    if let Err(e) = self.forwarder.redeliver(chat_id, channel_message_id).await {
                        tracing::warn!(error = %e, channel_message_id, "archived file redelivery failed");
                        self.channel
                            .send(chat_id, OutboundMessage::text("File not found."))
                            .await?;
                    }
                }
            }
        }
        if control == Control::Shutdown {
            tracing::warn!("shutdown requested from chat");
            self.channel
                .send(chat_id, OutboundMessage::removing_keyboard("Shutting down. Bye!"))
                .await?;
            self.shutdown.cancel();
        }
        Ok(())
    }
}
