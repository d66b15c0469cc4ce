//! Chat transport for SparrowFlix.
//!
//! Adapters are pure I/O: they convert platform updates to/from
//! `InboundMessage` / `OutboundMessage` and expose the file primitives the
//! archive and fetch workflows need.

mod telegram;
mod traits;
mod types;

pub use telegram::{TELEGRAM_WEBHOOK_PATH, TelegramAdapter, TelegramMode, permanent_link};
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, ChatId, FileKind, InboundFile, InboundMessage, Keyboard, MessageId,
    OutboundMessage, SenderId,
};
