use crate::error::{CatalogError, Result};
use crate::model::{
    ArchivalRef, CatalogStats, EpisodeWrite, FileRef, Kind, Language, Title, TitleDraft, TitleId,
};
use crate::operations;
use crate::schema;
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Persistent collection of titles with nested seasons and episodes.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Create a title. Fails with [`CatalogError::DuplicateKey`] when it already exists.
    async fn insert_title(&self, draft: TitleDraft) -> Result<Title>;

    async fn get_title(&self, id: TitleId) -> Result<Option<Title>>;

    async fn find_by_language_and_kind(&self, language: Language, kind: Kind)
    -> Result<Vec<Title>>;

    async fn search_titles(
        &self,
        query: &str,
        language: Language,
        kind: Kind,
        limit: usize,
    ) -> Result<Vec<Title>>;

    async fn attach_movie_file(&self, id: TitleId, file: FileRef) -> Result<()>;

    /// Update-or-insert an episode file inside an existing season.
    async fn attach_episode_file(
        &self,
        id: TitleId,
        season: u32,
        episode: u32,
        file: FileRef,
    ) -> Result<EpisodeWrite>;

    async fn set_movie_archive(&self, id: TitleId, archive: ArchivalRef) -> Result<()>;

    async fn set_episode_archive(
        &self,
        id: TitleId,
        season: u32,
        episode: u32,
        archive: ArchivalRef,
    ) -> Result<()>;

    async fn list_archived(&self, kind: Kind) -> Result<Vec<Title>>;

    async fn stats(&self) -> Result<CatalogStats>;
}

/// SQLite-backed catalog. Statements run on the blocking pool behind a
/// single connection.
#[derive(Clone)]
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = schema::open_database(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = schema::open_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| CatalogError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CatalogError::Join(e.to_string()))?
    }
}

#[async_trait]
impl CatalogStore for SqliteCatalog {
    #[tracing::instrument(level = "debug", skip_all, fields(title = %draft.title, kind = %draft.kind))]
    async fn insert_title(&self, draft: TitleDraft) -> Result<Title> {
        let title = self
            .with_conn(move |conn| operations::insert_title(conn, &draft))
            .await?;
        tracing::info!(title_id = %title.id, title = %title.title, "catalog title inserted");
        Ok(title)
    }

    async fn get_title(&self, id: TitleId) -> Result<Option<Title>> {
        self.with_conn(move |conn| operations::load_title(conn, id))
            .await
    }

    async fn find_by_language_and_kind(
        &self,
        language: Language,
        kind: Kind,
    ) -> Result<Vec<Title>> {
        self.with_conn(move |conn| operations::find_by_language_and_kind(conn, language, kind))
            .await
    }

    async fn search_titles(
        &self,
        query: &str,
        language: Language,
        kind: Kind,
        limit: usize,
    ) -> Result<Vec<Title>> {
        let query = query.to_string();
        self.with_conn(move |conn| operations::search_titles(conn, &query, language, kind, limit))
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(title_id = %id))]
    async fn attach_movie_file(&self, id: TitleId, file: FileRef) -> Result<()> {
        self.with_conn(move |conn| operations::attach_movie_file(conn, id, &file))
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(title_id = %id, season = season, episode = episode))]
    async fn attach_episode_file(
        &self,
        id: TitleId,
        season: u32,
        episode: u32,
        file: FileRef,
    ) -> Result<EpisodeWrite> {
        let write = self
            .with_conn(move |conn| {
                operations::attach_episode_file(conn, id, season, episode, &file)
            })
            .await?;
        tracing::debug!(?write, "episode file recorded");
        Ok(write)
    }

    async fn set_movie_archive(&self, id: TitleId, archive: ArchivalRef) -> Result<()> {
        self.with_conn(move |conn| operations::set_movie_archive(conn, id, &archive))
            .await
    }

    async fn set_episode_archive(
        &self,
        id: TitleId,
        season: u32,
        episode: u32,
        archive: ArchivalRef,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            operations::set_episode_archive(conn, id, season, episode, &archive)
        })
        .await
    }

    async fn list_archived(&self, kind: Kind) -> Result<Vec<Title>> {
        self.with_conn(move |conn| operations::list_archived(conn, kind))
            .await
    }

    async fn stats(&self) -> Result<CatalogStats> {
        self.with_conn(|conn| operations::stats(conn)).await
    }
}
