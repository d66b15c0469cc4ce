//! In-memory fakes for the transport and the metadata source.

use anyhow::Result;
use async_trait::async_trait;
use sf_catalog::{Kind, Language, SeasonDraft, TitleDraft};
use sf_channels::{
    ChannelAdapter, ChatId, FileKind, InboundFile, InboundMessage, Keyboard, MessageId,
    OutboundMessage,
};
use sf_metadata::{Candidate, MetadataError, MetadataLookup, SeasonOutline, TitleDetails};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct SentText {
    pub chat_id: String,
    pub content: String,
    pub keyboard: Option<Keyboard>,
}

#[derive(Debug, Clone)]
pub struct SentFile {
    pub chat_id: String,
    pub file_id: String,
    pub kind: FileKind,
    pub caption: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CopiedMessage {
    pub chat_id: String,
    pub from_chat_id: String,
    pub message_id: String,
}

/// Records everything sent; storage message ids count up from 100.
pub struct RecordingChannel {
    texts: Mutex<Vec<SentText>>,
    files: Mutex<Vec<SentFile>>,
    copies: Mutex<Vec<CopiedMessage>>,
    next_message_id: AtomicI64,
    fail_files: AtomicBool,
    file_delay_ms: AtomicU64,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            next_message_id: AtomicI64::new(100),
            fail_files: AtomicBool::new(false),
            file_delay_ms: AtomicU64::new(0),
        }
    }

    /// Make every `send_file` take this long before it records the file.
    pub fn delay_files(&self, delay: Duration) {
        self.file_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_files(&self, fail: bool) {
        self.fail_files.store(fail, Ordering::SeqCst);
    }

    pub fn texts(&self) -> Vec<SentText> {
        self.texts.lock().expect("texts lock").clone()
    }

    pub fn files(&self) -> Vec<SentFile> {
        self.files.lock().expect("files lock").clone()
    }

    pub fn copies(&self) -> Vec<CopiedMessage> {
        self.copies.lock().expect("copies lock").clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "recording"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, chat_id: &ChatId, message: OutboundMessage) -> Result<()> {
        self.texts.lock().expect("texts lock").push(SentText {
            chat_id: chat_id.to_string(),
            content: message.content,
            keyboard: message.keyboard,
        });
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: &ChatId,
        file_id: &str,
        kind: FileKind,
        caption: Option<&str>,
    ) -> Result<MessageId> {
        let delay = self.file_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_files.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("storage channel unreachable"));
        }
        self.files.lock().expect("files lock").push(SentFile {
            chat_id: chat_id.to_string(),
            file_id: file_id.to_string(),
            kind,
            caption: caption.map(str::to_string),
        });
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId::new(id.to_string()))
    }

    async fn copy_message(
        &self,
        chat_id: &ChatId,
        from_chat_id: &ChatId,
        message_id: &MessageId,
    ) -> Result<MessageId> {
        if self.fail_files.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("message to copy not found"));
        }
        self.copies.lock().expect("copies lock").push(CopiedMessage {
            chat_id: chat_id.to_string(),
            from_chat_id: from_chat_id.to_string(),
            message_id: message_id.to_string(),
        });
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId::new(id.to_string()))
    }
}

/// Canned search results keyed by lowercase query.
#[derive(Default)]
pub struct StaticMetadata {
    results: HashMap<String, Vec<Candidate>>,
    details: HashMap<i64, TitleDetails>,
    unavailable: bool,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn with_title(mut self, query: &str, id: i64, name: &str, year: &str, seasons: u32) -> Self {
        let candidate = Candidate {
            external_id: id,
            display_label: name.to_string(),
            release_date: Some(format!("{year}-01-01")),
            overview: Some(format!("About {name}.")),
        };
        self.results
            .entry(query.to_ascii_lowercase())
            .or_default()
            .push(candidate);
        self.details.insert(
            id,
            TitleDetails {
                external_id: id,
                name: name.to_string(),
                overview: Some(format!("About {name}.")),
                release_date: Some(format!("{year}-01-01")),
                seasons: (1..=seasons)
                    .map(|n| SeasonOutline {
                        season_number: n,
                        name: Some(format!("Season {n}")),
                        episode_count: Some(10),
                    })
                    .collect(),
                raw: serde_json::json!({ "id": id, "name": name, "overview": format!("About {name}.") }),
            },
        );
        self
    }
}

#[async_trait]
impl MetadataLookup for StaticMetadata {
    async fn search(&self, query: &str, _kind: Kind) -> sf_metadata::Result<Vec<Candidate>> {
        if self.unavailable {
            return Err(MetadataError::Http("connection refused".to_string()));
        }
        Ok(self
            .results
            .get(&query.trim().to_ascii_lowercase())
            .cloned()
            .unwrap_or_default())
    }

    async fn details(&self, external_id: i64, _kind: Kind) -> sf_metadata::Result<TitleDetails> {
        if self.unavailable {
            return Err(MetadataError::Http("connection refused".to_string()));
        }
        self.details
            .get(&external_id)
            .cloned()
            .ok_or_else(|| MetadataError::Status {
                status: 404,
                body: "not found".to_string(),
            })
    }
}

pub fn document(file_id: &str, file_name: &str) -> InboundFile {
    InboundFile {
        file_id: file_id.to_string(),
        file_name: Some(file_name.to_string()),
        mime_type: Some("video/x-matroska".to_string()),
        kind: FileKind::Document,
    }
}

pub fn video(file_id: &str) -> InboundFile {
    InboundFile {
        file_id: file_id.to_string(),
        file_name: None,
        mime_type: Some("video/mp4".to_string()),
        kind: FileKind::Video,
    }
}

pub fn show_draft(title: &str, seasons: u32) -> TitleDraft {
    TitleDraft {
        title: title.to_string(),
        language: Language::English,
        kind: Kind::TvShow,
        external_id: None,
        details: serde_json::json!({ "name": title }),
        seasons: (1..=seasons)
            .map(|n| SeasonDraft {
                season_number: n,
                name: None,
                episode_count: None,
            })
            .collect(),
    }
}

pub fn movie_draft(title: &str) -> TitleDraft {
    TitleDraft {
        title: title.to_string(),
        language: Language::English,
        kind: Kind::Movie,
        external_id: None,
        details: serde_json::json!({
            "title": title,
            "overview": "A heist goes wrong.",
            "release_date": "1995-12-15"
        }),
        seasons: Vec::new(),
    }
}

pub fn text_message(chat_id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        message_id: MessageId::new("1"),
        channel_id: "recording".into(),
        chat_id: chat_id.into(),
        sender_id: chat_id.into(),
        is_group: false,
        content: content.to_string(),
        file: None,
        media_group_id: None,
        metadata: serde_json::Value::Null,
        received_at: chrono::Utc::now(),
    }
}

pub fn file_message(
    chat_id: &str,
    caption: &str,
    file: InboundFile,
    media_group_id: Option<&str>,
) -> InboundMessage {
    InboundMessage {
        file: Some(file),
        media_group_id: media_group_id.map(str::to_string),
        ..text_message(chat_id, caption)
    }
}
