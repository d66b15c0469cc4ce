use crate::ingest::{EpisodeTarget, TitleRef};
use serde::{Deserialize, Serialize};
use sf_catalog::{Kind, Language};
use sf_metadata::Candidate;

pub const BACK: &str = "Back";
pub const DONE: &str = "/done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    AddTitle,
    Upload,
    Fetch,
}

impl MenuChoice {
    pub const ALL: [MenuChoice; 3] = [MenuChoice::AddTitle, MenuChoice::Upload, MenuChoice::Fetch];

    pub fn label(self) -> &'static str {
        match self {
            Self::AddTitle => "Add New Title",
            Self::Upload => "Upload",
            Self::Fetch => "Fetch",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("Fetch Movie/Episode") {
            return Some(Self::Fetch);
        }
        Self::ALL
            .into_iter()
            .find(|choice| choice.label().eq_ignore_ascii_case(input))
    }

    pub fn first_step(self) -> Step {
        match self {
            Self::AddTitle => Step::AddLanguage,
            Self::Upload => Step::UploadLanguage,
            Self::Fetch => Step::FetchLanguage,
        }
    }
}

/// One workflow step together with everything it was entered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    AddLanguage,
    AddKind {
        language: Language,
    },
    AddQuery {
        language: Language,
        kind: Kind,
    },
    AddSelect {
        language: Language,
        kind: Kind,
        candidates: Vec<Candidate>,
    },
    UploadLanguage,
    UploadKind {
        language: Language,
    },
    UploadQuery {
        language: Language,
        kind: Kind,
    },
    UploadSelect {
        language: Language,
        kind: Kind,
        titles: Vec<TitleRef>,
    },
    UploadMovieFile {
        title: TitleRef,
    },
    UploadSeason {
        title: TitleRef,
        seasons: Vec<u32>,
    },
    UploadEpisodes {
        target: EpisodeTarget,
        /// Number given to the next file whose caption has none.
        next_episode: u32,
    },
    FetchLanguage,
    FetchKind {
        language: Language,
    },
    FetchSelect {
        language: Language,
        kind: Kind,
        titles: Vec<TitleRef>,
    },
    FetchSeason {
        title: TitleRef,
        seasons: Vec<u32>,
    },
    FetchEpisode {
        title: TitleRef,
        season: u32,
        episodes: Vec<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub options: Vec<String>,
}

impl Prompt {
    fn new(text: impl Into<String>, options: Vec<String>) -> Self {
        let mut options = options;
        options.push(BACK.to_string());
        Self {
            text: text.into(),
            options,
        }
    }
}

pub fn menu_prompt(prefix: Option<&str>) -> Prompt {
    let question = "What would you like to do?";
    Prompt {
        text: match prefix {
            Some(prefix) => format!("{prefix}\n{question}"),
            None => question.to_string(),
        },
        options: MenuChoice::ALL
            .iter()
            .map(|c| c.label().to_string())
            .collect(),
    }
}

fn kind_options() -> Vec<String> {
    Kind::ALL.iter().map(|k| k.label().to_string()).collect()
}

pub fn season_label(season: u32) -> String {
    format!("Season {season}")
}

pub fn episode_label(episode: u32) -> String {
    format!("Episode {episode}")
}

/// Matches "Season 2" or a bare "2" against the offered numbers.
pub fn match_numbered(input: &str, offered: &[u32], label: fn(u32) -> String) -> Option<u32> {
    let input = input.trim();
    offered.iter().copied().find(|n| {
        label(*n).eq_ignore_ascii_case(input) || input.parse::<u32>().ok() == Some(*n)
    })
}

pub fn match_label<'a, T>(input: &str, items: &'a [T], label: impl Fn(&T) -> String) -> Option<&'a T> {
    let input = input.trim();
    items.iter().find(|item| label(item).eq_ignore_ascii_case(input))
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddLanguage => "add_language",
            Self::AddKind { .. } => "add_kind",
            Self::AddQuery { .. } => "add_query",
            Self::AddSelect { .. } => "add_select",
            Self::UploadLanguage => "upload_language",
            Self::UploadKind { .. } => "upload_kind",
            Self::UploadQuery { .. } => "upload_query",
            Self::UploadSelect { .. } => "upload_select",
            Self::UploadMovieFile { .. } => "upload_movie_file",
            Self::UploadSeason { .. } => "upload_season",
            Self::UploadEpisodes { .. } => "upload_episodes",
            Self::FetchLanguage => "fetch_language",
            Self::FetchKind { .. } => "fetch_kind",
            Self::FetchSelect { .. } => "fetch_select",
            Self::FetchSeason { .. } => "fetch_season",
            Self::FetchEpisode { .. } => "fetch_episode",
        }
    }

    /// What the user sees on entering (or re-entering) this step. Depends
    /// only on the step's own arguments.
    pub fn prompt(&self) -> Prompt {
        match self {
            Self::AddLanguage => Prompt::new("Add New Title: choose the language.", Language::labels()),
            Self::AddKind { language } => {
                Prompt::new(format!("Add New Title ({language}): movie or TV show?"), kind_options())
            }
            Self::AddQuery { kind, .. } => Prompt::new(
                format!("Send the name of the {} to search for.", kind.label().to_lowercase()),
                Vec::new(),
            ),
            Self::AddSelect { candidates, .. } => Prompt::new(
                "Select the matching title:",
                candidates.iter().map(Candidate::option_label).collect(),
            ),
            Self::UploadLanguage => Prompt::new("Upload: choose the language.", Language::labels()),
            Self::UploadKind { language } => {
                Prompt::new(format!("Upload ({language}): movie or TV show?"), kind_options())
            }
            Self::UploadQuery { kind, .. } => Prompt::new(
                format!(
                    "Send part of the {} name to search the catalog.",
                    kind.label().to_lowercase()
                ),
                Vec::new(),
            ),
            Self::UploadSelect { titles, .. } => Prompt::new(
                "Select the title to upload for:",
                titles.iter().map(|t| t.title.clone()).collect(),
            ),
            Self::UploadMovieFile { title } => {
                Prompt::new(format!("Send the movie file for {}.", title.title), Vec::new())
            }
            Self::UploadSeason { title, seasons } => Prompt::new(
                format!("{}: choose the season.", title.title),
                seasons.iter().copied().map(season_label).collect(),
            ),
            Self::UploadEpisodes {
                target,
                next_episode,
            } => Prompt::new(
                format!(
                    "Send the episode files for {} season {}. A caption must start with the \
                     episode number; a file without one becomes episode {next_episode}. \
                     Send {DONE} when finished.",
                    target.title.title, target.season
                ),
                vec![DONE.to_string()],
            ),
            Self::FetchLanguage => Prompt::new("Fetch: choose the language.", Language::labels()),
            Self::FetchKind { language } => {
                Prompt::new(format!("Fetch ({language}): movie or TV show?"), kind_options())
            }
            Self::FetchSelect { titles, .. } => Prompt::new(
                "Select a title:",
                titles.iter().map(|t| t.title.clone()).collect(),
            ),
            Self::FetchSeason { title, seasons } => Prompt::new(
                format!("{}: choose the season.", title.title),
                seasons.iter().copied().map(season_label).collect(),
            ),
            Self::FetchEpisode {
                title,
                season,
                episodes,
            } => Prompt::new(
                format!("{} season {season}: choose an episode.", title.title),
                episodes.iter().copied().map(episode_label).collect(),
            ),
        }
    }
}
