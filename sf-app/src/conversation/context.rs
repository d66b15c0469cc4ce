use super::steps::Step;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The active step of one chat plus the frames `back` can return to.
///
/// Every frame is a complete [`Step`] with its arguments, so popping one
/// restores that step exactly as it was first entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub current: Step,
    pub history: Vec<Step>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(first: Step) -> Self {
        let now = Utc::now();
        Self {
            current: first,
            history: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn advance(&mut self, next: Step) {
        let previous = std::mem::replace(&mut self.current, next);
        self.history.push(previous);
        self.updated_at = Utc::now();
    }

    /// Swap the current frame without growing the stack.
    pub fn replace(&mut self, step: Step) {
        self.current = step;
        self.updated_at = Utc::now();
    }

    /// Pop one frame. `false` means the workflow root was reached.
    pub fn back(&mut self) -> bool {
        match self.history.pop() {
            Some(previous) => {
                self.current = previous;
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }
}
