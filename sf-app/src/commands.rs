//! Global chat commands, checked before any workflow parsing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalCommand {
    /// Shut the whole instance down gracefully.
    Stop,
    /// Drop the current workflow and show the menu.
    Start,
    /// Re-deliver an archived file by storage-channel message id.
    File(i64),
    /// Offer the streaming web app.
    App,
}

impl GlobalCommand {
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if !trimmed.starts_with('/') {
            return None;
        }
        let mut parts = trimmed.split_whitespace();
        let head = parts.next()?;
        // "/stop@SparrowFlixBot" in group chats.
        let command = head.split('@').next().unwrap_or(head);
        let payload = parts.next();

        match command {
            "/stop" => Some(Self::Stop),
            "/app" | "/stream" | "/watch" => Some(Self::App),
            // Deep links arrive as "/start file_123".
            "/start" => Some(
                payload
                    .and_then(parse_file_payload)
                    .map_or(Self::Start, Self::File),
            ),
            other => other
                .strip_prefix('/')
                .and_then(parse_file_payload)
                .map(Self::File),
        }
    }
}

fn parse_file_payload(payload: &str) -> Option<i64> {
    payload
        .strip_prefix("file_")?
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
}
