use crate::model::{Kind, TitleId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("title not found: {0}")]
    TitleNotFound(TitleId),

    #[error("season {season} not found for title {title_id}")]
    SeasonNotFound { title_id: TitleId, season: u32 },

    #[error("episode {episode} of season {season} not found for title {title_id}")]
    EpisodeNotFound {
        title_id: TitleId,
        season: u32,
        episode: u32,
    },

    #[error("title {title_id} is a {actual}, expected a {expected}")]
    KindMismatch {
        title_id: TitleId,
        expected: Kind,
        actual: Kind,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("catalog connection lock poisoned")]
    Poisoned,

    #[error("catalog worker failed: {0}")]
    Join(String),
}
