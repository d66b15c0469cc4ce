//! Per-chat workflow state machine: menu, Add, Upload and Fetch.

mod context;
mod engine;
mod steps;

pub use engine::{Control, ConversationEngine, Outcome, Reply};
