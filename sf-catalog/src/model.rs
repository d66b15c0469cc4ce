//! Catalog entities.
//!
//! A [`Title`] is either a movie carrying at most one file, or a show whose
//! seasons hold the uploaded episodes. The split is a tagged [`TitleBody`] so
//! attach and fetch code dispatch with `match` instead of comparing strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    Hebrew,
    Japanese,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::English, Language::Hebrew, Language::Japanese];

    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::English => "english",
            Self::Hebrew => "hebrew",
            Self::Japanese => "japanese",
        }
    }

    /// Keyboard label.
    pub fn label(self) -> &'static str {
        match self {
            Self::English => "English",
            Self::Hebrew => "Hebrew",
            Self::Japanese => "Japanese",
        }
    }

    /// Case-insensitive parse of either the label or the storage form.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        Self::ALL
            .into_iter()
            .find(|language| language.as_str().eq_ignore_ascii_case(input))
    }

    pub fn labels() -> Vec<String> {
        Self::ALL.iter().map(|l| l.label().to_string()).collect()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Movie,
    TvShow,
}

impl Kind {
    pub const ALL: [Kind; 2] = [Kind::Movie, Kind::TvShow];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::TvShow => "tv_show",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Movie => "Movie",
            Self::TvShow => "TV Show",
        }
    }

    pub fn plural_label(self) -> &'static str {
        match self {
            Self::Movie => "Movies",
            Self::TvShow => "TV Shows",
        }
    }

    /// Accepts singular and plural labels as well as the storage form, so
    /// "tv show", "TV Shows" and "tv_show" all resolve to the same kind.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = input
            .trim()
            .to_ascii_lowercase()
            .replace(['_', '-'], " ");
        match normalized.as_str() {
            "movie" | "movies" => Some(Self::Movie),
            "tv show" | "tv shows" | "show" | "shows" => Some(Self::TvShow),
            _ => None,
        }
    }

    pub(crate) fn from_storage(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Store-assigned title identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TitleId(i64);

impl TitleId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable pointer into the archival storage channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalRef {
    pub channel_message_id: i64,
    pub permanent_link: String,
}

/// How a file was uploaded. Telegram only re-sends a handle through the
/// method matching its original media type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Document,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Document, MediaKind::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Video => "video",
        }
    }

    pub(crate) fn from_storage(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|media| media.as_str() == value)
    }
}

/// Playable file handle recorded on a movie or an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub media: MediaKind,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default)]
    pub archive: Option<ArchivalRef>,
}

impl FileRef {
    pub fn new(file_id: impl Into<String>, file_name: Option<String>) -> Self {
        Self {
            file_id: file_id.into(),
            file_name,
            media: MediaKind::Document,
            uploaded_at: Utc::now(),
            archive: None,
        }
    }

    pub fn with_media(mut self, media: MediaKind) -> Self {
        self.media = media;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_number: u32,
    #[serde(default)]
    pub file: Option<FileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Season {
    pub season_number: u32,
    #[serde(default)]
    pub name: Option<String>,
    /// Episode count advertised by the metadata source, if any.
    #[serde(default)]
    pub episode_count: Option<u32>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

impl Season {
    pub fn episode(&self, episode_number: u32) -> Option<&Episode> {
        self.episodes
            .iter()
            .find(|e| e.episode_number == episode_number)
    }

    /// Episode numbers that currently have a file attached, ascending.
    pub fn uploaded_episode_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .episodes
            .iter()
            .filter(|e| e.file.is_some())
            .map(|e| e.episode_number)
            .collect();
        numbers.sort_unstable();
        numbers
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TitleBody {
    Movie {
        #[serde(default)]
        file: Option<FileRef>,
    },
    TvShow {
        #[serde(default)]
        seasons: Vec<Season>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Title {
    pub id: TitleId,
    pub title: String,
    pub language: Language,
    #[serde(default)]
    pub external_id: Option<i64>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: TitleBody,
}

impl Title {
    pub fn kind(&self) -> Kind {
        match self.body {
            TitleBody::Movie { .. } => Kind::Movie,
            TitleBody::TvShow { .. } => Kind::TvShow,
        }
    }

    pub fn seasons(&self) -> &[Season] {
        match &self.body {
            TitleBody::Movie { .. } => &[],
            TitleBody::TvShow { seasons } => seasons,
        }
    }

    pub fn season(&self, season_number: u32) -> Option<&Season> {
        self.seasons()
            .iter()
            .find(|s| s.season_number == season_number)
    }

    pub fn movie_file(&self) -> Option<&FileRef> {
        match &self.body {
            TitleBody::Movie { file } => file.as_ref(),
            TitleBody::TvShow { .. } => None,
        }
    }

    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonDraft {
    pub season_number: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub episode_count: Option<u32>,
}

/// Everything needed to create a title. Seasons are only honoured for shows
/// and are never added after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleDraft {
    pub title: String,
    pub language: Language,
    pub kind: Kind,
    #[serde(default)]
    pub external_id: Option<i64>,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default)]
    pub seasons: Vec<SeasonDraft>,
}

/// Whether an episode upsert created the record or replaced its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeWrite {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub movies: u64,
    pub tv_shows: u64,
    pub seasons: u64,
    pub episodes_with_files: u64,
    pub movies_with_files: u64,
    pub archived_files: u64,
}
