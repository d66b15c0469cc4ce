//! File intake: catalog attach, archival forward, then the back-link.
//!
//! The three writes are not transactional. A stored file reference is the
//! primary result; a failed forward or link write only downgrades the
//! receipt to a warning.

use crate::archive::{ArchivalForwarder, episode_caption, media_kind, movie_caption};
use crate::error::FlowResult;
use serde::{Deserialize, Serialize};
use sf_catalog::{ArchivalRef, CatalogStore, EpisodeWrite, FileRef, Language, TitleId};
use sf_channels::InboundFile;
use std::sync::Arc;

/// Lightweight handle on a catalog title, carried by workflow steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleRef {
    pub id: TitleId,
    pub title: String,
    pub language: Language,
}

/// Where grouped episode files land.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeTarget {
    pub title: TitleRef,
    pub season: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Linked(ArchivalRef),
    ForwardFailed(String),
    /// Forwarded, but the back-link could not be written.
    LinkFailed { archive: ArchivalRef, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReceipt {
    /// `None` for movies.
    pub write: Option<EpisodeWrite>,
    pub archive: ArchiveOutcome,
}

impl AttachReceipt {
    pub fn warning(&self) -> Option<String> {
        match &self.archive {
            ArchiveOutcome::Linked(_) => None,
            ArchiveOutcome::ForwardFailed(_) => {
                Some("saved, but archiving to the storage channel failed".to_string())
            }
            ArchiveOutcome::LinkFailed { .. } => {
                Some("saved and archived, but the archive link was not recorded".to_string())
            }
        }
    }
}

pub struct Ingestor {
    catalog: Arc<dyn CatalogStore>,
    forwarder: ArchivalForwarder,
}

impl Ingestor {
    pub fn new(catalog: Arc<dyn CatalogStore>, forwarder: ArchivalForwarder) -> Self {
        Self { catalog, forwarder }
    }

    #[tracing::instrument(level = "info", skip_all, fields(title_id = %title.id))]
    pub async fn attach_movie_file(
        &self,
        title: &TitleRef,
        file: &InboundFile,
    ) -> FlowResult<AttachReceipt> {
        self.catalog
            .attach_movie_file(title.id, file_ref(file))
            .await?;

        let caption = movie_caption(&title.title, title.language.label());
        let media = media_kind(file.kind);
        let archive = match self.forwarder.forward(&file.file_id, media, &caption).await {
            Ok(archive) => match self.catalog.set_movie_archive(title.id, archive.clone()).await {
                Ok(()) => ArchiveOutcome::Linked(archive),
                Err(e) => {
                    tracing::warn!(error = %e, "movie archive link write failed");
                    ArchiveOutcome::LinkFailed {
                        archive,
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "movie archive forward failed");
                ArchiveOutcome::ForwardFailed(e.to_string())
            }
        };
        Ok(AttachReceipt {
            write: None,
            archive,
        })
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(title_id = %target.title.id, season = target.season, episode = episode)
    )]
    pub async fn attach_episode_file(
        &self,
        target: &EpisodeTarget,
        episode: u32,
        file: &InboundFile,
    ) -> FlowResult<AttachReceipt> {
        let title_id = target.title.id;
        let season = target.season;
        let write = self
            .catalog
            .attach_episode_file(title_id, season, episode, file_ref(file))
            .await?;

        let caption = episode_caption(&target.title.title, season, episode);
        let media = media_kind(file.kind);
        let archive = match self.forwarder.forward(&file.file_id, media, &caption).await {
            Ok(archive) => match self
                .catalog
                .set_episode_archive(title_id, season, episode, archive.clone())
                .await
            {
                Ok(()) => ArchiveOutcome::Linked(archive),
                Err(e) => {
                    tracing::warn!(error = %e, "episode archive link write failed");
                    ArchiveOutcome::LinkFailed {
                        archive,
                        reason: e.to_string(),
                    }
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "episode archive forward failed");
                ArchiveOutcome::ForwardFailed(e.to_string())
            }
        };
        Ok(AttachReceipt {
            write: Some(write),
            archive,
        })
    }
}

fn file_ref(file: &InboundFile) -> FileRef {
    FileRef::new(file.file_id.clone(), file.file_name.clone()).with_media(media_kind(file.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingChannel, document, movie_draft, show_draft, video};
    use async_trait::async_trait;
    use sf_catalog::{
        CatalogError, CatalogStats, Kind, MediaKind, SqliteCatalog, Title, TitleDraft,
    };
    use sf_channels::FileKind;

    /// Delegates to SQLite but refuses every archive back-link write.
    struct UnlinkableCatalog(SqliteCatalog);

    #[async_trait]
    impl CatalogStore for UnlinkableCatalog {
        async fn insert_title(&self, draft: TitleDraft) -> sf_catalog::Result<Title> {
            self.0.insert_title(draft).await
        }

        async fn get_title(&self, id: TitleId) -> sf_catalog::Result<Option<Title>> {
            self.0.get_title(id).await
        }

        async fn find_by_language_and_kind(
            &self,
            language: Language,
            kind: Kind,
        ) -> sf_catalog::Result<Vec<Title>> {
            self.0.find_by_language_and_kind(language, kind).await
        }

        async fn search_titles(
            &self,
            query: &str,
            language: Language,
            kind: Kind,
            limit: usize,
        ) -> sf_catalog::Result<Vec<Title>> {
            self.0.search_titles(query, language, kind, limit).await
        }

        async fn attach_movie_file(&self, id: TitleId, file: FileRef) -> sf_catalog::Result<()> {
            self.0.attach_movie_file(id, file).await
        }

        async fn attach_episode_file(
            &self,
            id: TitleId,
            season: u32,
            episode: u32,
            file: FileRef,
        ) -> sf_catalog::Result<EpisodeWrite> {
            self.0.attach_episode_file(id, season, episode, file).await
        }

        async fn set_movie_archive(
            &self,
            _id: TitleId,
            _archive: ArchivalRef,
        ) -> sf_catalog::Result<()> {
            Err(CatalogError::Poisoned)
        }

        async fn set_episode_archive(
            &self,
            _id: TitleId,
            _season: u32,
            _episode: u32,
            _archive: ArchivalRef,
        ) -> sf_catalog::Result<()> {
            Err(CatalogError::Poisoned)
        }

        async fn list_archived(&self, kind: Kind) -> sf_catalog::Result<Vec<Title>> {
            self.0.list_archived(kind).await
        }

        async fn stats(&self) -> sf_catalog::Result<CatalogStats> {
            self.0.stats().await
        }
    }

    async fn fixture(channel: Arc<RecordingChannel>) -> (Arc<SqliteCatalog>, Ingestor, EpisodeTarget) {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let show = catalog.insert_title(show_draft("Dark", 2)).await.expect("insert");
        let ingestor = Ingestor::new(
            catalog.clone(),
            ArchivalForwarder::new(channel, "-1005550"),
        );
        let target = EpisodeTarget {
            title: TitleRef {
                id: show.id,
                title: show.title.clone(),
                language: show.language,
            },
            season: 1,
        };
        (catalog, ingestor, target)
    }

    #[tokio::test]
    async fn episode_attach_records_file_and_archive_link() {
        let channel = Arc::new(RecordingChannel::new());
        let (catalog, ingestor, target) = fixture(channel.clone()).await;

        let receipt = ingestor
            .attach_episode_file(&target, 4, &document("f-4", "4.mkv"))
            .await
            .expect("attach");
        assert_eq!(receipt.write, Some(EpisodeWrite::Inserted));
        assert!(receipt.warning().is_none());

        let title = catalog.get_title(target.title.id).await.expect("get").expect("exists");
        let file = title
            .season(1)
            .and_then(|s| s.episode(4))
            .and_then(|e| e.file.clone())
            .expect("file");
        assert_eq!(file.file_id, "f-4");
        let archive = file.archive.expect("archive link");
        assert!(archive.permanent_link.starts_with("https://t.me/c/5550/"));
    }

    #[tokio::test]
    async fn forward_failure_keeps_playable_file() {
        let channel = Arc::new(RecordingChannel::new());
        channel.fail_files(true);
        let (catalog, ingestor, target) = fixture(channel).await;

        let receipt = ingestor
            .attach_episode_file(&target, 1, &document("f-1", "1.mkv"))
            .await
            .expect("attach still succeeds");
        assert!(matches!(receipt.archive, ArchiveOutcome::ForwardFailed(_)));
        assert!(receipt.warning().is_some());

        let title = catalog.get_title(target.title.id).await.expect("get").expect("exists");
        let episode = title.season(1).and_then(|s| s.episode(1)).expect("episode");
        let file = episode.file.as_ref().expect("file");
        assert_eq!(file.file_id, "f-1");
        assert!(file.archive.is_none());
    }

    #[tokio::test]
    async fn link_write_failure_keeps_file_without_archive() {
        let inner = SqliteCatalog::open_in_memory().expect("catalog");
        let show = inner.insert_title(show_draft("Dark", 1)).await.expect("show");
        let movie = inner.insert_title(movie_draft("Heat")).await.expect("movie");
        let catalog = Arc::new(UnlinkableCatalog(inner));
        let channel = Arc::new(RecordingChannel::new());
        let ingestor = Ingestor::new(
            catalog.clone(),
            ArchivalForwarder::new(channel.clone(), "-1005550"),
        );
        let target = EpisodeTarget {
            title: TitleRef {
                id: show.id,
                title: show.title.clone(),
                language: show.language,
            },
            season: 1,
        };

        let receipt = ingestor
            .attach_episode_file(&target, 2, &document("f-2", "2.mkv"))
            .await
            .expect("attach still succeeds");
        assert!(matches!(receipt.archive, ArchiveOutcome::LinkFailed { .. }));
        assert_eq!(
            receipt.warning().as_deref(),
            Some("saved and archived, but the archive link was not recorded")
        );
        let stored = catalog.get_title(show.id).await.expect("get").expect("exists");
        let file = stored
            .season(1)
            .and_then(|s| s.episode(2))
            .and_then(|e| e.file.clone())
            .expect("file");
        assert_eq!(file.file_id, "f-2");
        assert!(file.archive.is_none());

        let movie_ref = TitleRef {
            id: movie.id,
            title: movie.title.clone(),
            language: movie.language,
        };
        let receipt = ingestor
            .attach_movie_file(&movie_ref, &document("heat", "heat.mkv"))
            .await
            .expect("attach still succeeds");
        assert!(receipt.warning().is_some());
        let stored = catalog.get_title(movie.id).await.expect("get").expect("exists");
        let file = stored.movie_file().expect("file");
        assert_eq!(file.file_id, "heat");
        assert!(file.archive.is_none());
        assert_eq!(channel.files().len(), 2, "both files reached storage");
    }

    #[tokio::test]
    async fn video_upload_is_stored_and_archived_as_video() {
        let channel = Arc::new(RecordingChannel::new());
        let (catalog, ingestor, target) = fixture(channel.clone()).await;

        ingestor
            .attach_episode_file(&target, 1, &video("BAAD-1"))
            .await
            .expect("attach");

        let files = channel.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].kind, FileKind::Video);
        let title = catalog.get_title(target.title.id).await.expect("get").expect("exists");
        let file = title
            .season(1)
            .and_then(|s| s.episode(1))
            .and_then(|e| e.file.clone())
            .expect("file");
        assert_eq!(file.media, MediaKind::Video);
        assert!(file.archive.is_some());
    }

    #[tokio::test]
    async fn missing_season_is_not_found() {
        let channel = Arc::new(RecordingChannel::new());
        let (_catalog, ingestor, mut target) = fixture(channel.clone()).await;
        target.season = 7;

        let err = ingestor
            .attach_episode_file(&target, 1, &document("f", "1.mkv"))
            .await
            .expect_err("no season 7");
        assert!(matches!(err, crate::error::FlowError::NotFound(_)));
        assert!(channel.files().is_empty(), "nothing forwarded");
    }
}
