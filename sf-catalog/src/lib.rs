//! Catalog store for SparrowFlix.
//!
//! Titles are movies or shows; shows own seasons, seasons own episodes.
//! Persistence is SQLite (via rusqlite, bundled).

mod error;
mod model;
mod operations;
mod schema;
mod store;

pub use error::{CatalogError, Result};
pub use model::{
    ArchivalRef, CatalogStats, Episode, EpisodeWrite, FileRef, Kind, Language, MediaKind, Season,
    SeasonDraft, Title, TitleBody, TitleDraft, TitleId,
};
pub use store::{CatalogStore, SqliteCatalog};
