use crate::traits::ChannelAdapter;
use crate::types::{
    ChatId, FileKind, InboundFile, InboundMessage, Keyboard, MessageId, OutboundMessage,
};
use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_NON_TEXT_PLACEHOLDER: &str = "[telegram non-text message]";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;
const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";
pub const TELEGRAM_WEBHOOK_PATH: &str = "/telegram/webhook";

/// How updates reach the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramMode {
    Polling,
    Webhook { url: String, secret: Option<String> },
}

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
    mode: TelegramMode,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str, mode: TelegramMode) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: TELEGRAM_API_BASE.to_string(),
            mode,
            inbound_tx: Arc::new(RwLock::new(None)),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Router that receives pushed updates at [`TELEGRAM_WEBHOOK_PATH`].
    pub fn webhook_router(self: Arc<Self>) -> Router {
        Router::new()
            .route(TELEGRAM_WEBHOOK_PATH, post(receive_webhook))
            .with_state(self)
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, self.bot_token, method
        ))?)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = self.api_url(method)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(anyhow::anyhow!(
                "telegram {method} failed: status={status} body={text}"
            ));
        }
        let parsed: TelegramApiResponse<T> = serde_json::from_str(&text)?;
        if !parsed.ok {
            return Err(anyhow::anyhow!(
                "telegram {method} rejected: {}",
                parsed.description.unwrap_or_default()
            ));
        }
        parsed
            .result
            .ok_or_else(|| anyhow::anyhow!("telegram {method} returned no result"))
    }

    async fn register_inbound(&self, tx: mpsc::Sender<InboundMessage>) {
        *self.inbound_tx.write().await = Some(tx);
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        match &self.mode {
            TelegramMode::Polling => {
                // getUpdates is refused while a webhook is registered.
                let _: bool = self
                    .call("deleteWebhook", serde_json::json!({}))
                    .await?;
                let adapter = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = adapter.run_poll_loop(tx).await {
                        tracing::error!(%e, "telegram poll loop exited");
                    }
                });
            }
            TelegramMode::Webhook { url, secret } => {
                let mut body = serde_json::json!({
                    "url": url,
                    "allowed_updates": ["message"],
                });
                if let Some(secret) = secret {
                    body["secret_token"] = serde_json::Value::String(secret.clone());
                }
                let _: bool = self.call("setWebhook", body).await?;
                self.register_inbound(tx).await;
                tracing::info!(%url, "telegram webhook registered");
            }
        }
        Ok(())
    }

    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "text": message.content,
        });
        if let Some(keyboard) = message.keyboard.as_ref() {
            body["reply_markup"] = reply_markup(keyboard);
        }
        let _: TelegramSentMessage = self.call("sendMessage", body).await?;
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: &ChatId,
        file_id: &str,
        kind: FileKind,
        caption: Option<&str>,
    ) -> Result<MessageId> {
        let (method, body) = send_file_request(chat_id, file_id, kind, caption);
        let sent: TelegramSentMessage = self.call(method, body).await?;
        Ok(sent.message_id.to_string().into())
    }

    async fn copy_message(
        &self,
        chat_id: &ChatId,
        from_chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<MessageId> {
        let message_id: i64 = message_id
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid telegram message id {message_id}: {e}"))?;
        let body = serde_json::json!({
            "chat_id": chat_id.as_str(),
            "from_chat_id": from_chat_id.as_str(),
            "message_id": message_id,
        });
        let copied: TelegramSentMessage = self.call("copyMessage", body).await?;
        Ok(copied.message_id.to_string().into())
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let request = self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send();
            let response = tokio::select! {
                _ = tx.closed() => {
                    tracing::info!("telegram inbound queue closed; stopping poll loop");
                    return Ok(());
                }
                result = request => result,
            };
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response
                .json::<TelegramApiResponse<Vec<TelegramUpdate>>>()
                .await
            {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result.unwrap_or_default();
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_inbound_message(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn receive_webhook(
    State(adapter): State<Arc<TelegramAdapter>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let TelegramMode::Webhook {
        secret: Some(expected),
        ..
    } = &adapter.mode
    {
        let provided = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            tracing::warn!("telegram webhook rejected: secret token mismatch");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            // Acknowledge anyway so Telegram does not redeliver a payload we can never parse.
            tracing::warn!(%e, "telegram webhook payload parse failed");
            return StatusCode::OK;
        }
    };
    let Some(inbound) = build_inbound_message(&update) else {
        return StatusCode::OK;
    };

    let tx = adapter.inbound_tx.read().await.clone();
    let Some(tx) = tx else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    match tx.send(inbound).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(%e, "telegram inbound queue closed; refusing webhook update");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Public link to a message in a storage channel. Private channel ids carry
/// the `-100` prefix, which `t.me/c/` links omit.
pub fn permanent_link(channel_id: &str, message_id: i64) -> String {
    let channel_id = channel_id.trim();
    if let Some(username) = channel_id.strip_prefix('@') {
        return format!("https://t.me/{username}/{message_id}");
    }
    let internal = channel_id
        .strip_prefix("-100")
        .unwrap_or_else(|| channel_id.trim_start_matches('-'));
    format!("https://t.me/c/{internal}/{message_id}")
}

fn reply_markup(keyboard: &Keyboard) -> serde_json::Value {
    match keyboard {
        Keyboard::Options(options) => {
            let rows: Vec<serde_json::Value> = options
                .iter()
                .map(|option| serde_json::json!([{ "text": option }]))
                .collect();
            serde_json::json!({
                "keyboard": rows,
                "one_time_keyboard": true,
                "resize_keyboard": true,
            })
        }
        Keyboard::Remove => serde_json::json!({ "remove_keyboard": true }),
        Keyboard::WebApp { label, url } => serde_json::json!({
            "inline_keyboard": [[{ "text": label, "web_app": { "url": url } }]],
        }),
    }
}

/// Bot API method and body for re-sending a file handle. Video handles are
/// refused by `sendDocument`, so each kind goes through its own method.
fn send_file_request(
    chat_id: &ChatId,
    file_id: &str,
    kind: FileKind,
    caption: Option<&str>,
) -> (&'static str, serde_json::Value) {
    let (method, field) = match kind {
        FileKind::Document => ("sendDocument", "document"),
        FileKind::Video => ("sendVideo", "video"),
    };
    let mut body = serde_json::json!({ "chat_id": chat_id.as_str() });
    body[field] = serde_json::Value::String(file_id.to_string());
    if let Some(caption) = caption {
        body["caption"] = serde_json::Value::String(caption.to_string());
    }
    (method, body)
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn build_inbound_message(update: &TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let file = extract_file(message);
    let content = extract_message_content(message, file.is_some())?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| format!("chat:{}", chat.id));
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{}:message", update.update_id));

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: TELEGRAM_CHANNEL_ID.into(),
        chat_id: chat.id.to_string().into(),
        sender_id: sender_id.into(),
        is_group: chat.r#type != "private",
        content,
        file,
        media_group_id: message.media_group_id.clone(),
        metadata: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
        received_at: Utc::now(),
    })
}

fn extract_file(message: &TelegramMessage) -> Option<InboundFile> {
    let (file, kind) = match (&message.document, &message.video) {
        (Some(document), _) => (document, FileKind::Document),
        (None, Some(video)) => (video, FileKind::Video),
        (None, None) => return None,
    };
    Some(InboundFile {
        file_id: file.file_id.clone(),
        file_name: file.file_name.clone(),
        mime_type: file.mime_type.clone(),
        kind,
    })
}

/// Text wins over caption. Files may arrive without any caption; other
/// non-text payloads get a placeholder so the conversation can re-prompt.
fn extract_message_content(message: &TelegramMessage, has_file: bool) -> Option<String> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    if let Some(caption) = message.caption.as_deref().map(str::trim) {
        if !caption.is_empty() {
            return Some(caption.to_string());
        }
    }
    if has_file {
        return Some(String::new());
    }
    if message.has_non_text_payload() {
        return Some(TELEGRAM_NON_TEXT_PLACEHOLDER.to_string());
    }
    None
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    media_group_id: Option<String>,
    #[serde(default)]
    document: Option<TelegramFile>,
    #[serde(default)]
    video: Option<TelegramFile>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramFile {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramUser {
    id: i64,
}

#[derive(Debug, Deserialize, serde::Serialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type")]
    r#type: String,
}

impl TelegramMessage {
    fn has_non_text_payload(&self) -> bool {
        !self.photo.is_empty()
            || self.sticker.is_some()
            || self.audio.is_some()
            || self.voice.is_some()
    }
}
