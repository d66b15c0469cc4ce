use super::context::ConversationContext;
use super::steps::{
    BACK, DONE, MenuChoice, Prompt, Step, episode_label, match_label, match_numbered, menu_prompt,
    season_label,
};
use crate::archive::episode_caption;
use crate::batch::{
    BatchAggregator, FileEvent, MAX_EPISODE_NUMBER, parse_episode_number, starts_with_number,
};
use crate::commands::GlobalCommand;
use crate::error::{FlowError, FlowResult};
use crate::ingest::{EpisodeTarget, Ingestor, TitleRef};
use dashmap::DashMap;
use sf_catalog::{CatalogStore, Kind, Language, MediaKind, Title, TitleBody, TitleDraft, TitleId};
use sf_channels::{ChatId, InboundFile, InboundMessage};
use sf_metadata::MetadataLookup;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text {
        text: String,
        options: Option<Vec<String>>,
    },
    File {
        file_id: String,
        media: MediaKind,
        caption: Option<String>,
    },
    /// Copy a message out of the storage channel.
    Archived { channel_message_id: i64 },
    /// Inline button that opens the streaming web app.
    WebApp {
        text: String,
        label: String,
        url: String,
    },
}

impl Reply {
    fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            options: None,
        }
    }
}

impl From<Prompt> for Reply {
    fn from(prompt: Prompt) -> Self {
        Self::Text {
            text: prompt.text,
            options: Some(prompt.options),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub replies: Vec<Reply>,
    pub control: Control,
}

impl Outcome {
    fn replies(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            control: Control::Continue,
        }
    }
}

enum Transition {
    /// Push the current step and enter `next`.
    Advance { replies: Vec<Reply>, next: Step },
    /// Stay on this step, possibly with updated arguments.
    Stay { replies: Vec<Reply>, step: Step },
    /// Workflow finished; back to the menu.
    Complete { replies: Vec<Reply> },
}

/// Owns every chat's [`ConversationContext`]. Contexts are only written
/// back after a step succeeds, so a failed or panicking step leaves the
/// chat where it was.
pub struct ConversationEngine {
    contexts: DashMap<ChatId, ConversationContext>,
    catalog: Arc<dyn CatalogStore>,
    metadata: Arc<dyn MetadataLookup>,
    ingestor: Arc<Ingestor>,
    batches: Arc<BatchAggregator>,
    max_results: usize,
    miniapp_url: Option<String>,
}

impl ConversationEngine {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        metadata: Arc<dyn MetadataLookup>,
        ingestor: Arc<Ingestor>,
        batches: Arc<BatchAggregator>,
        max_results: usize,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            catalog,
            metadata,
            ingestor,
            batches,
            max_results: max_results.max(1),
            miniapp_url: None,
        }
    }

    pub fn with_miniapp_url(mut self, url: Option<String>) -> Self {
        self.miniapp_url = url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        self
    }

    pub fn active_conversations(&self) -> usize {
        self.contexts.len()
    }

    #[cfg(test)]
    pub fn current_step(&self, chat_id: &ChatId) -> Option<Step> {
        self.contexts.get(chat_id).map(|ctx| ctx.current.clone())
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %message.chat_id))]
    pub async fn advance(&self, message: &InboundMessage) -> Outcome {
        let chat_id = &message.chat_id;
        let input = message.content.trim();

        if let Some(command) = GlobalCommand::parse(input) {
            return self.run_global(chat_id, command);
        }

        // Clone out of the map: no shard lock may be held across an await.
        let Some(mut context) = self.contexts.get(chat_id).map(|ctx| ctx.clone()) else {
            return self.from_menu(chat_id, input);
        };

        if input.eq_ignore_ascii_case(BACK) {
            if context.back() {
                let prompt = context.current.prompt();
                self.contexts.insert(chat_id.clone(), context);
                return Outcome::replies(vec![prompt.into()]);
            }
            self.contexts.remove(chat_id);
            return Outcome::replies(vec![menu_prompt(Some("Cancelled.")).into()]);
        }

        let current = context.current.clone();
        tracing::debug!(step = current.name(), "running step");
        match self.run_step(&current, message, input).await {
            Ok(Transition::Advance { mut replies, next }) => {
                replies.push(next.prompt().into());
                context.advance(next);
                self.contexts.insert(chat_id.clone(), context);
                Outcome::replies(replies)
            }
            Ok(Transition::Stay { replies, step }) => {
                context.replace(step);
                self.contexts.insert(chat_id.clone(), context);
                Outcome::replies(replies)
            }
            Ok(Transition::Complete { mut replies }) => {
                self.contexts.remove(chat_id);
                replies.push(menu_prompt(None).into());
                Outcome::replies(replies)
            }
            Err(e) => self.recover(chat_id, &current, e),
        }
    }

    fn run_global(&self, chat_id: &ChatId, command: GlobalCommand) -> Outcome {
        match command {
            GlobalCommand::Stop => {
                self.contexts.remove(chat_id);
                tracing::warn!(chat_id = %chat_id, "stop requested from chat");
                Outcome {
                    replies: Vec::new(),
                    control: Control::Shutdown,
                }
            }
            GlobalCommand::Start => {
                self.contexts.remove(chat_id);
                Outcome::replies(vec![menu_prompt(Some("Welcome to SparrowFlix!")).into()])
            }
            GlobalCommand::File(channel_message_id) => {
                Outcome::replies(vec![Reply::Archived { channel_message_id }])
            }
            GlobalCommand::App => Outcome::replies(vec![match &self.miniapp_url {
                Some(url) => Reply::WebApp {
                    text: "Tap the button below to open the SparrowFlix streaming app.".to_string(),
                    label: "Open SparrowFlix".to_string(),
                    url: url.clone(),
                },
                None => Reply::text("The SparrowFlix app is not available on this bot yet."),
            }]),
        }
    }

    fn from_menu(&self, chat_id: &ChatId, input: &str) -> Outcome {
        let Some(choice) = MenuChoice::parse(input) else {
            return Outcome::replies(vec![menu_prompt(None).into()]);
        };
        let first = choice.first_step();
        let prompt = first.prompt();
        self.contexts
            .insert(chat_id.clone(), ConversationContext::new(first));
        Outcome::replies(vec![prompt.into()])
    }

    fn recover(&self, chat_id: &ChatId, current: &Step, error: FlowError) -> Outcome {
        match &error {
            FlowError::DuplicateKey(key) => {
                tracing::info!(%key, "duplicate title rejected");
                self.contexts.remove(chat_id);
                Outcome::replies(vec![menu_prompt(Some(&error.user_message())).into()])
            }
            e if e.is_user_recoverable() => {
                tracing::debug!(step = current.name(), error = %e, "step input rejected");
                Outcome::replies(vec![Reply::text(e.user_message()), current.prompt().into()])
            }
            FlowError::ExternalLookup(e) => {
                tracing::warn!(step = current.name(), error = %e, "metadata lookup failed");
                Outcome::replies(vec![Reply::text(error.user_message()), current.prompt().into()])
            }
            e => {
                tracing::error!(step = current.name(), error = %e, "step failed");
                Outcome::replies(vec![Reply::text(e.user_message()), current.prompt().into()])
            }
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        message: &InboundMessage,
        input: &str,
    ) -> FlowResult<Transition> {
        match step {
            Step::AddLanguage => Ok(advance(Step::AddKind {
                language: choose_language(input)?,
            })),
            Step::AddKind { language } => Ok(advance(Step::AddQuery {
                language: *language,
                kind: choose_kind(input)?,
            })),
            Step::AddQuery { language, kind } => {
                let query = require_text(input)?;
                let candidates = match self.metadata.search(query, *kind).await {
                    Ok(mut candidates) => {
                        candidates.truncate(self.max_results);
                        candidates
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "metadata search failed; treating as no results");
                        Vec::new()
                    }
                };
                if candidates.is_empty() {
                    return Err(FlowError::NotFound(format!(
                        "No results for {query:?}. Try another name."
                    )));
                }
                Ok(advance(Step::AddSelect {
                    language: *language,
                    kind: *kind,
                    candidates,
                }))
            }
            Step::AddSelect {
                language,
                kind,
                candidates,
            } => {
                let candidate = match_label(input, candidates, |c| c.option_label())
                    .or_else(|| match_label(input, candidates, |c| c.display_label.clone()))
                    .ok_or_else(|| not_listed("title"))?;
                self.add_title(*language, *kind, candidate).await
            }

            Step::UploadLanguage => Ok(advance(Step::UploadKind {
                language: choose_language(input)?,
            })),
            Step::UploadKind { language } => Ok(advance(Step::UploadQuery {
                language: *language,
                kind: choose_kind(input)?,
            })),
            Step::UploadQuery { language, kind } => {
                let query = require_text(input)?;
                let titles = self
                    .catalog
                    .search_titles(query, *language, *kind, self.max_results)
                    .await?;
                if titles.is_empty() {
                    return Err(FlowError::NotFound(format!(
                        "No {} in the {language} catalog match {query:?}.",
                        kind.plural_label().to_lowercase()
                    )));
                }
                Ok(advance(Step::UploadSelect {
                    language: *language,
                    kind: *kind,
                    titles: titles.iter().map(title_ref).collect(),
                }))
            }
            Step::UploadSelect { titles, .. } => {
                let selected = match_label(input, titles, |t| t.title.clone())
                    .ok_or_else(|| not_listed("title"))?;
                let title = self.load_title(selected.id).await?;
                match &title.body {
                    TitleBody::Movie { .. } => Ok(advance(Step::UploadMovieFile {
                        title: title_ref(&title),
                    })),
                    TitleBody::TvShow { seasons } => {
                        let numbers: Vec<u32> = seasons.iter().map(|s| s.season_number).collect();
                        if numbers.is_empty() {
                            return Err(FlowError::NotFound(format!(
                                "{} has no seasons to upload into.",
                                title.title
                            )));
                        }
                        Ok(advance(Step::UploadSeason {
                            title: title_ref(&title),
                            seasons: numbers,
                        }))
                    }
                }
            }
            Step::UploadMovieFile { title } => {
                let file = require_file(message, "Please send the movie file.")?;
                let receipt = self.ingestor.attach_movie_file(title, file).await?;
                let mut text = format!("Movie file saved for {}.", title.title);
                if let Some(warning) = receipt.warning() {
                    text.push_str(&format!("\nNote: {warning}."));
                }
                Ok(Transition::Complete {
                    replies: vec![Reply::text(text)],
                })
            }
            Step::UploadSeason { title, seasons } => {
                let season = match_numbered(input, seasons, season_label)
                    .ok_or_else(|| not_listed("season"))?;
                let loaded = self.load_title(title.id).await?;
                let next_episode = loaded
                    .season(season)
                    .and_then(|s| s.uploaded_episode_numbers().last().copied())
                    .map_or(1, |last| last.saturating_add(1));
                Ok(advance(Step::UploadEpisodes {
                    target: EpisodeTarget {
                        title: title.clone(),
                        season,
                    },
                    next_episode,
                }))
            }
            Step::UploadEpisodes {
                target,
                next_episode,
            } => {
                self.upload_episode(message, input, target, *next_episode)
                    .await
            }

            Step::FetchLanguage => Ok(advance(Step::FetchKind {
                language: choose_language(input)?,
            })),
            Step::FetchKind { language } => {
                let kind = choose_kind(input)?;
                let titles = self
                    .catalog
                    .find_by_language_and_kind(*language, kind)
                    .await?;
                if titles.is_empty() {
                    return Err(FlowError::NotFound(format!(
                        "There are no {} in {language} yet.",
                        kind.plural_label().to_lowercase()
                    )));
                }
                Ok(advance(Step::FetchSelect {
                    language: *language,
                    kind,
                    titles: titles.iter().map(title_ref).collect(),
                }))
            }
            Step::FetchSelect { titles, .. } => {
                let selected = match_label(input, titles, |t| t.title.clone())
                    .ok_or_else(|| not_listed("title"))?;
                let title = self.load_title(selected.id).await?;
                match &title.body {
                    TitleBody::Movie { file } => {
                        let mut replies = vec![Reply::text(movie_card(&title))];
                        match file {
                            Some(file) => replies.push(Reply::File {
                                file_id: file.file_id.clone(),
                                media: file.media,
                                caption: Some(title.title.clone()),
                            }),
                            None => replies.push(Reply::text("No file uploaded yet for this movie.")),
                        }
                        Ok(Transition::Complete { replies })
                    }
                    TitleBody::TvShow { seasons } => {
                        let with_uploads: Vec<u32> = seasons
                            .iter()
                            .filter(|s| !s.uploaded_episode_numbers().is_empty())
                            .map(|s| s.season_number)
                            .collect();
                        if with_uploads.is_empty() {
                            return Err(FlowError::NotFound(format!(
                                "No episodes of {} have been uploaded yet.",
                                title.title
                            )));
                        }
                        Ok(advance(Step::FetchSeason {
                            title: title_ref(&title),
                            seasons: with_uploads,
                        }))
                    }
                }
            }
            Step::FetchSeason { title, seasons } => {
                let season = match_numbered(input, seasons, season_label)
                    .ok_or_else(|| not_listed("season"))?;
                let loaded = self.load_title(title.id).await?;
                let episodes = loaded
                    .season(season)
                    .map(|s| s.uploaded_episode_numbers())
                    .unwrap_or_default();
                if episodes.is_empty() {
                    return Err(FlowError::NotFound(format!(
                        "Season {season} has no uploaded episodes."
                    )));
                }
                Ok(advance(Step::FetchEpisode {
                    title: title.clone(),
                    season,
                    episodes,
                }))
            }
            Step::FetchEpisode {
                title,
                season,
                episodes,
            } => {
                let episode = match_numbered(input, episodes, episode_label)
                    .ok_or_else(|| not_listed("episode"))?;
                let loaded = self.load_title(title.id).await?;
                let file = loaded
                    .season(*season)
                    .and_then(|s| s.episode(episode))
                    .and_then(|e| e.file.clone())
                    .ok_or_else(|| {
                        FlowError::NotFound(format!("Episode {episode} has no file anymore."))
                    })?;
                // Keep offering the list until the user goes back.
                Ok(Transition::Stay {
                    replies: vec![
                        Reply::File {
                            file_id: file.file_id,
                            media: file.media,
                            caption: Some(episode_caption(&title.title, *season, episode)),
                        },
                        step.prompt().into(),
                    ],
                    step: step.clone(),
                })
            }
        }
    }

    async fn add_title(
        &self,
        language: Language,
        kind: Kind,
        candidate: &sf_metadata::Candidate,
    ) -> FlowResult<Transition> {
        let details = self.metadata.details(candidate.external_id, kind).await?;
        let seasons = match kind {
            Kind::Movie => Vec::new(),
            Kind::TvShow => details.season_drafts(),
        };
        let season_count = seasons.len();
        let draft = TitleDraft {
            title: candidate.display_label.clone(),
            language,
            kind,
            external_id: Some(details.external_id),
            details: details.raw,
            seasons,
        };
        let title = self.catalog.insert_title(draft).await?;
        let text = match kind {
            Kind::Movie => format!("Added {} to the {language} movies.", title.title),
            Kind::TvShow => format!(
                "Added {} to the {language} TV shows with {season_count} season(s).",
                title.title
            ),
        };
        Ok(Transition::Complete {
            replies: vec![Reply::text(text)],
        })
    }

    async fn upload_episode(
        &self,
        message: &InboundMessage,
        input: &str,
        target: &EpisodeTarget,
        next_episode: u32,
    ) -> FlowResult<Transition> {
        if input.eq_ignore_ascii_case(DONE) {
            return Ok(Transition::Complete {
                replies: vec![Reply::text(format!(
                    "Upload finished for {} season {}.",
                    target.title.title, target.season
                ))],
            });
        }
        let file = require_file(message, "Send episode files, or /done when finished.")?;
        let mut event = FileEvent {
            chat_id: message.chat_id.clone(),
            caption: input.to_string(),
            file: file.clone(),
            episode: None,
        };
        let step = Step::UploadEpisodes {
            target: target.clone(),
            next_episode,
        };

        if let Some(group_id) = message.media_group_id.as_deref() {
            self.batches
                .on_file_event(Some(group_id), target, event)
                .await;
            return Ok(Transition::Stay {
                replies: Vec::new(),
                step,
            });
        }

        let episode = match parse_episode_number(input) {
            Some(episode) => episode,
            None if starts_with_number(input) || next_episode > MAX_EPISODE_NUMBER => {
                return Err(FlowError::Validation(format!(
                    "Episode numbers run from 1 to {MAX_EPISODE_NUMBER}. \
                     Caption the file with its episode number and send it again."
                )));
            }
            None => next_episode,
        };
        event.episode = Some(episode);
        let report = self
            .batches
            .on_file_event(None, target, event)
            .await
            .unwrap_or_default();
        let saved = report.attached.iter().any(|(n, _)| *n == episode);
        Ok(Transition::Stay {
            replies: vec![Reply::text(report.summary(target))],
            step: if saved {
                Step::UploadEpisodes {
                    target: target.clone(),
                    next_episode: episode.saturating_add(1),
                }
            } else {
                step
            },
        })
    }

    async fn load_title(&self, id: TitleId) -> FlowResult<Title> {
        self.catalog
            .get_title(id)
            .await?
            .ok_or_else(|| FlowError::NotFound("That title is no longer in the catalog.".to_string()))
    }
}

fn advance(next: Step) -> Transition {
    Transition::Advance {
        replies: Vec::new(),
        next,
    }
}

fn not_listed(what: &str) -> FlowError {
    FlowError::NotFound(format!("That {what} is not in the list."))
}

fn choose_language(input: &str) -> FlowResult<Language> {
    Language::parse(input).ok_or_else(|| {
        FlowError::Validation(format!(
            "Please choose one of: {}.",
            Language::labels().join(", ")
        ))
    })
}

fn choose_kind(input: &str) -> FlowResult<Kind> {
    Kind::parse(input)
        .ok_or_else(|| FlowError::Validation("Please choose Movie or TV Show.".to_string()))
}

fn require_text(input: &str) -> FlowResult<&str> {
    if input.is_empty() {
        return Err(FlowError::Validation("Please send some text.".to_string()));
    }
    Ok(input)
}

fn require_file<'a>(message: &'a InboundMessage, hint: &str) -> FlowResult<&'a InboundFile> {
    message
        .file
        .as_ref()
        .ok_or_else(|| FlowError::Validation(hint.to_string()))
}

fn title_ref(title: &Title) -> TitleRef {
    TitleRef {
        id: title.id,
        title: title.title.clone(),
        language: title.language,
    }
}

fn movie_card(title: &Title) -> String {
    let mut card = title.title.clone();
    if let Some(overview) = title.detail_str("overview").filter(|s| !s.is_empty()) {
        card.push_str(&format!("\n\n{overview}"));
    }
    if let Some(date) = title.detail_str("release_date").filter(|s| !s.is_empty()) {
        card.push_str(&format!("\nRelease date: {date}"));
    }
    card
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchivalForwarder;
    use crate::config::BatchConfig;
    use crate::testing::{
        RecordingChannel, StaticMetadata, document, file_message, movie_draft, show_draft,
        text_message,
    };
    use sf_catalog::{FileRef, SqliteCatalog};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        engine: ConversationEngine,
        catalog: Arc<SqliteCatalog>,
        channel: Arc<RecordingChannel>,
    }

    async fn harness(metadata: StaticMetadata) -> Harness {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let channel = Arc::new(RecordingChannel::new());
        let ingestor = Arc::new(Ingestor::new(
            catalog.clone(),
            ArchivalForwarder::new(channel.clone(), "-100555"),
        ));
        let batches = BatchAggregator::start(
            BatchConfig {
                quiet_period_ms: 50,
                ..BatchConfig::default()
            },
            ingestor.clone(),
            channel.clone(),
            CancellationToken::new(),
        )
        .await;
        let engine = ConversationEngine::new(
            catalog.clone(),
            Arc::new(metadata),
            ingestor,
            batches,
            5,
        );
        Harness {
            engine,
            catalog,
            channel,
        }
    }

    impl Harness {
        async fn say(&self, chat: &str, text: &str) -> Outcome {
            self.engine.advance(&text_message(chat, text)).await
        }

        async fn say_all(&self, chat: &str, inputs: &[&str]) -> Outcome {
            let mut last = None;
            for input in inputs {
                last = Some(self.say(chat, input).await);
            }
            last.expect("at least one input")
        }

        fn step(&self, chat: &str) -> Option<Step> {
            self.engine.current_step(&ChatId::new(chat))
        }
    }

    fn last_text(outcome: &Outcome) -> &str {
        outcome
            .replies
            .iter()
            .rev()
            .find_map(|r| match r {
                Reply::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .expect("a text reply")
    }

    fn texts(outcome: &Outcome) -> Vec<&str> {
        outcome
            .replies
            .iter()
            .filter_map(|r| match r {
                Reply::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn last_options(outcome: &Outcome) -> Vec<String> {
        outcome
            .replies
            .iter()
            .rev()
            .find_map(|r| match r {
                Reply::Text {
                    options: Some(options),
                    ..
                } => Some(options.clone()),
                _ => None,
            })
            .expect("a prompt with options")
    }

    async fn seed_show(h: &Harness, name: &str, uploaded: &[u32]) -> Title {
        let show = h
            .catalog
            .insert_title(show_draft(name, 2))
            .await
            .expect("insert show");
        for n in uploaded {
            h.catalog
                .attach_episode_file(show.id, 1, *n, FileRef::new(format!("ep-{n}"), None))
                .await
                .expect("attach");
        }
        show
    }

    #[tokio::test]
    async fn add_workflow_inserts_once_then_reports_duplicate() {
        // External ids are unique per kind, so each language gets its own.
        let mut metadata = StaticMetadata::new();
        for (i, language) in Language::ALL.into_iter().enumerate() {
            let offset = i as i64;
            metadata = metadata
                .with_title(&format!("heat {}", language.as_str()), 900 + offset, "Heat", "1995", 0)
                .with_title(&format!("dark {}", language.as_str()), 7000 + offset, "Dark", "2017", 3);
        }
        let h = harness(metadata).await;

        for language in Language::ALL {
            for (kind, name, label) in [
                (Kind::Movie, "heat", "Heat (1995)"),
                (Kind::TvShow, "dark", "Dark (2017)"),
            ] {
                let chat = format!("{}-{}", language.as_str(), kind.as_str());
                let query = format!("{name} {}", language.as_str());
                let steps = ["Add New Title", language.label(), kind.label(), query.as_str(), label];

                let done = h.say_all(&chat, &steps).await;
                assert!(texts(&done)[0].starts_with("Added"));
                assert!(h.step(&chat).is_none(), "context discarded on completion");

                let stored = h
                    .catalog
                    .find_by_language_and_kind(language, kind)
                    .await
                    .expect("list");
                assert_eq!(stored.len(), 1);
                assert_eq!(stored[0].title, if kind == Kind::Movie { "Heat" } else { "Dark" });

                let again = h.say_all(&chat, &steps).await;
                assert!(texts(&again)[0].contains("already exists"));
                assert!(h.step(&chat).is_none());
                let stored = h
                    .catalog
                    .find_by_language_and_kind(language, kind)
                    .await
                    .expect("list");
                assert_eq!(stored.len(), 1, "no second record");
            }
        }

        let dark = h
            .catalog
            .find_by_language_and_kind(Language::English, Kind::TvShow)
            .await
            .expect("list");
        assert_eq!(dark[0].seasons().len(), 3);
    }

    #[tokio::test]
    async fn back_restores_previous_step_with_arguments() {
        let metadata = StaticMetadata::new().with_title("heat", 949, "Heat", "1995", 0);
        let h = harness(metadata).await;
        h.say_all("c", &["Add New Title", "Hebrew", "Movie", "heat"]).await;
        assert!(matches!(h.step("c"), Some(Step::AddSelect { .. })));

        let back = h.say("c", "back").await;
        assert_eq!(
            h.step("c"),
            Some(Step::AddQuery {
                language: Language::Hebrew,
                kind: Kind::Movie
            })
        );
        assert_eq!(back.replies.len(), 1, "back is not validated as input");
        assert_eq!(
            last_text(&back),
            "Send the name of the movie to search for."
        );

        h.say("c", "BACK").await;
        assert_eq!(
            h.step("c"),
            Some(Step::AddKind {
                language: Language::Hebrew
            })
        );
        h.say("c", "Back").await;
        assert_eq!(h.step("c"), Some(Step::AddLanguage));

        let cancelled = h.say("c", "back").await;
        assert!(h.step("c").is_none());
        assert!(last_text(&cancelled).starts_with("Cancelled."));
    }

    #[tokio::test]
    async fn invalid_input_reprompts_same_step_indefinitely() {
        let h = harness(StaticMetadata::new()).await;
        h.say("c", "Upload").await;
        for _ in 0..5 {
            let retry = h.say("c", "Klingon").await;
            assert_eq!(h.step("c"), Some(Step::UploadLanguage));
            assert!(texts(&retry)[0].starts_with("Please choose one of"));
            assert_eq!(last_options(&retry), vec!["English", "Hebrew", "Japanese", "Back"]);
        }
    }

    #[tokio::test]
    async fn stop_mid_workflow_requests_shutdown_without_touching_other_chats() {
        let h = harness(StaticMetadata::new()).await;
        h.say_all("a", &["Fetch", "English"]).await;
        h.say_all("b", &["Upload", "Japanese"]).await;

        let stop = h.say("a", "/stop").await;
        assert_eq!(stop.control, Control::Shutdown);
        assert!(h.step("a").is_none());
        assert_eq!(
            h.step("b"),
            Some(Step::UploadKind {
                language: Language::Japanese
            })
        );
    }

    #[tokio::test]
    async fn start_discards_context_and_bypasses_validation() {
        let h = harness(StaticMetadata::new()).await;
        h.say_all("c", &["Add New Title", "English"]).await;
        let start = h.say("c", "/start").await;
        assert!(h.step("c").is_none());
        assert_eq!(start.control, Control::Continue);
        assert_eq!(last_options(&start), vec!["Add New Title", "Upload", "Fetch"]);
    }

    #[tokio::test]
    async fn unreachable_metadata_is_treated_as_no_results() {
        let h = harness(StaticMetadata::unavailable()).await;
        let outcome = h.say_all("c", &["Add New Title", "English", "Movie", "heat"]).await;
        assert!(texts(&outcome)[0].starts_with("No results"));
        assert_eq!(
            h.step("c"),
            Some(Step::AddQuery {
                language: Language::English,
                kind: Kind::Movie
            })
        );
    }

    #[tokio::test]
    async fn fetch_offers_only_uploaded_episodes_and_reoffers_after_delivery() {
        let h = harness(StaticMetadata::new()).await;
        seed_show(&h, "Dark", &[5, 2]).await;

        let seasons = h.say_all("c", &["Fetch", "English", "TV Show", "Dark"]).await;
        assert_eq!(last_options(&seasons), vec!["Season 1", "Back"], "season 2 has no uploads");

        let episodes = h.say("c", "Season 1").await;
        assert_eq!(last_options(&episodes), vec!["Episode 2", "Episode 5", "Back"]);

        let delivered = h.say("c", "episode 5").await;
        assert_eq!(
            delivered.replies[0],
            Reply::File {
                file_id: "ep-5".to_string(),
                media: MediaKind::Document,
                caption: Some("Dark S01E05".to_string())
            }
        );
        assert_eq!(last_options(&delivered), vec!["Episode 2", "Episode 5", "Back"]);
        assert!(matches!(h.step("c"), Some(Step::FetchEpisode { .. })));

        let missing = h.say("c", "Episode 3").await;
        assert!(texts(&missing)[0].contains("not in the list"));
    }

    #[tokio::test]
    async fn fetch_show_without_uploads_stays_on_selection() {
        let h = harness(StaticMetadata::new()).await;
        seed_show(&h, "Dark", &[]).await;
        let outcome = h.say_all("c", &["Fetch", "English", "TV Show", "Dark"]).await;
        assert!(texts(&outcome)[0].contains("No episodes of Dark"));
        assert!(matches!(h.step("c"), Some(Step::FetchSelect { .. })));
    }

    #[tokio::test]
    async fn fetch_movie_sends_card_then_file() {
        let h = harness(StaticMetadata::new()).await;
        let movie = h.catalog.insert_title(movie_draft("Heat")).await.expect("insert");
        h.catalog
            .attach_movie_file(
                movie.id,
                FileRef::new("heat-file", None).with_media(MediaKind::Video),
            )
            .await
            .expect("attach");

        let outcome = h.say_all("c", &["Fetch", "English", "Movie", "heat"]).await;
        match &outcome.replies[0] {
            Reply::Text { text, .. } => {
                assert!(text.starts_with("Heat\n\nA heist goes wrong."));
                assert!(text.contains("Release date: 1995-12-15"));
            }
            other => panic!("expected card, got {other:?}"),
        }
        assert_eq!(
            outcome.replies[1],
            Reply::File {
                file_id: "heat-file".to_string(),
                media: MediaKind::Video,
                caption: Some("Heat".to_string())
            }
        );
        assert!(h.step("c").is_none());
    }

    #[tokio::test]
    async fn standalone_uploads_follow_caption_or_cursor() {
        let h = harness(StaticMetadata::new()).await;
        let show = seed_show(&h, "Dark", &[]).await;
        h.say_all("c", &["Upload", "English", "TV Show", "da", "Dark", "Season 1"]).await;
        assert!(matches!(
            h.step("c"),
            Some(Step::UploadEpisodes { next_episode: 1, .. })
        ));

        for (caption, id) in [("", "a"), ("", "b"), ("E07", "c"), ("", "d")] {
            h.engine
                .advance(&file_message("c", caption, document(id, "x.mkv"), None))
                .await;
        }
        assert!(matches!(
            h.step("c"),
            Some(Step::UploadEpisodes { next_episode: 9, .. })
        ));

        let title = h.catalog.get_title(show.id).await.expect("get").expect("exists");
        assert_eq!(
            title.season(1).expect("season").uploaded_episode_numbers(),
            vec![1, 2, 7, 8]
        );
        assert_eq!(h.channel.files().len(), 4, "each file archived");

        let done = h.say("c", "/done").await;
        assert!(texts(&done)[0].starts_with("Upload finished"));
        assert!(h.step("c").is_none());
    }

    #[tokio::test]
    async fn oversized_episode_captions_are_rejected_without_breaking_the_season() {
        let h = harness(StaticMetadata::new()).await;
        let show = seed_show(&h, "Dark", &[]).await;
        h.say_all("c", &["Upload", "English", "TV Show", "Dark", "Dark", "Season 1"]).await;

        let outcome = h
            .engine
            .advance(&file_message("c", "4294967295", document("huge", "x.mkv"), None))
            .await;
        assert!(texts(&outcome)[0].starts_with("Episode numbers run from 1 to 9999"));
        assert!(matches!(
            h.step("c"),
            Some(Step::UploadEpisodes { next_episode: 1, .. })
        ));
        let title = h.catalog.get_title(show.id).await.expect("get").expect("exists");
        assert!(title.season(1).expect("season").episodes.is_empty());
        assert!(h.channel.files().is_empty());

        // A row stored before numbers were bounded must not wedge the season.
        h.catalog
            .attach_episode_file(show.id, 1, u32::MAX, FileRef::new("legacy", None))
            .await
            .expect("attach");
        h.say("c", "/start").await;
        h.say_all("c", &["Upload", "English", "TV Show", "Dark", "Dark", "Season 1"]).await;
        assert!(matches!(
            h.step("c"),
            Some(Step::UploadEpisodes { next_episode: u32::MAX, .. })
        ));

        let uncaptioned = h
            .engine
            .advance(&file_message("c", "", document("next", "x.mkv"), None))
            .await;
        assert!(texts(&uncaptioned)[0].starts_with("Episode numbers run from 1 to 9999"));

        h.engine
            .advance(&file_message("c", "3", document("three", "3.mkv"), None))
            .await;
        assert!(matches!(
            h.step("c"),
            Some(Step::UploadEpisodes { next_episode: 4, .. })
        ));
    }

    #[tokio::test]
    async fn grouped_upload_is_flushed_by_aggregator() {
        let h = harness(StaticMetadata::new()).await;
        let show = seed_show(&h, "Dark", &[]).await;
        h.say_all("c", &["Upload", "English", "TV Show", "Dark", "Dark", "1"]).await;

        for (caption, id) in [("1.mp4", "a"), ("2.mp4", "b"), ("bad", "c")] {
            let outcome = h
                .engine
                .advance(&file_message("c", caption, document(id, "x.mkv"), Some("album")))
                .await;
            assert!(outcome.replies.is_empty());
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        let title = h.catalog.get_title(show.id).await.expect("get").expect("exists");
        assert_eq!(
            title.season(1).expect("season").uploaded_episode_numbers(),
            vec![1, 2]
        );
        let summary = &h.channel.texts()[0].content;
        assert!(summary.contains("saved episode(s) 1, 2"));
        assert!(summary.contains("\"bad\""));
    }

    #[tokio::test]
    async fn movie_upload_completes_workflow() {
        let h = harness(StaticMetadata::new()).await;
        let movie = h.catalog.insert_title(movie_draft("Heat")).await.expect("insert");
        h.say_all("c", &["Upload", "English", "Movie", "hea", "Heat"]).await;

        let nudge = h.say("c", "here it comes").await;
        assert!(texts(&nudge)[0].starts_with("Please send the movie file"));

        let outcome = h
            .engine
            .advance(&file_message("c", "", document("heat-file", "heat.mkv"), None))
            .await;
        assert!(texts(&outcome)[0].starts_with("Movie file saved"));
        assert!(h.step("c").is_none());

        let stored = h.catalog.get_title(movie.id).await.expect("get").expect("exists");
        let file = stored.movie_file().expect("file");
        assert_eq!(file.file_id, "heat-file");
        assert!(file.archive.is_some());
    }

    #[tokio::test]
    async fn app_command_offers_web_app_without_leaving_workflow() {
        let mut h = harness(StaticMetadata::new()).await;
        let unconfigured = h.say("c", "/app").await;
        assert!(texts(&unconfigured)[0].contains("not available"));

        h.engine = h
            .engine
            .with_miniapp_url(Some("https://t.me/sparrowflix_bot/app".to_string()));
        h.say_all("c", &["Fetch", "English"]).await;
        let outcome = h.say("c", "/watch").await;
        assert_eq!(
            outcome.replies,
            vec![Reply::WebApp {
                text: "Tap the button below to open the SparrowFlix streaming app.".to_string(),
                label: "Open SparrowFlix".to_string(),
                url: "https://t.me/sparrowflix_bot/app".to_string(),
            }]
        );
        assert!(matches!(h.step("c"), Some(Step::FetchKind { .. })));
    }

    #[tokio::test]
    async fn file_deep_link_keeps_current_workflow() {
        let h = harness(StaticMetadata::new()).await;
        h.say_all("c", &["Fetch", "English"]).await;
        let outcome = h.say("c", "/file_321").await;
        assert_eq!(
            outcome.replies,
            vec![Reply::Archived {
                channel_message_id: 321
            }]
        );
        assert_eq!(
            h.step("c"),
            Some(Step::FetchKind {
                language: Language::English
            })
        );
    }
}
