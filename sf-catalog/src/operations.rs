//! Synchronous catalog operations over a SQLite connection.
//!
//! Every write that touches a nested episode runs inside one transaction so a
//! retried upload can never leave two records for the same episode number.

use crate::error::{CatalogError, Result};
use crate::model::{
    ArchivalRef, CatalogStats, Episode, EpisodeWrite, FileRef, Kind, Language, MediaKind, Season,
    Title, TitleBody, TitleDraft, TitleId,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

const TITLE_COLUMNS: &str = "id, title, language, kind, external_id, details_json, created_at, \
     file_id, file_name, media, uploaded_at, channel_message_id, permanent_link";

// ── Titles ──────────────────────────────────────────────────────────────────

/// Insert a new title together with its season skeleton.
///
/// Fails with [`CatalogError::DuplicateKey`] when the same external id, or the
/// same title in the same language, already exists for this kind.
pub fn insert_title(conn: &mut Connection, draft: &TitleDraft) -> Result<Title> {
    let title = draft.title.trim();
    if title.is_empty() {
        return Err(CatalogError::InvalidInput("title is required".to_string()));
    }
    if let Some(season) = draft.seasons.iter().find(|s| s.season_number == 0) {
        return Err(CatalogError::InvalidInput(format!(
            "season numbers start at 1, got {}",
            season.season_number
        )));
    }

    let details_json = serde_json::to_string(&draft.details)?;
    let created_at = Utc::now().to_rfc3339();

    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT INTO titles (title, title_key, language, kind, external_id, details_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            title,
            title_key(title),
            draft.language.as_str(),
            draft.kind.as_str(),
            draft.external_id,
            details_json,
            created_at,
        ],
    );
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(CatalogError::DuplicateKey(format!(
                "{} '{}' ({}) already exists",
                draft.kind, title, draft.language
            )));
        }
        Err(e) => return Err(e.into()),
    }
    let id = TitleId::new(tx.last_insert_rowid());

    if draft.kind == Kind::TvShow {
        for season in &draft.seasons {
            tx.execute(
                "INSERT INTO seasons (title_id, season_number, name, episode_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (title_id, season_number) DO NOTHING",
                params![
                    id.value(),
                    season.season_number,
                    season.name,
                    season.episode_count,
                ],
            )?;
        }
    }
    tx.commit()?;

    load_title(conn, id)?.ok_or(CatalogError::TitleNotFound(id))
}

pub fn load_title(conn: &Connection, id: TitleId) -> Result<Option<Title>> {
    let row = conn
        .query_row(
            &format!("SELECT {TITLE_COLUMNS} FROM titles WHERE id = ?1"),
            params![id.value()],
            TitleRow::from_row,
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };
    row.into_title(conn).map(Some)
}

pub fn find_by_language_and_kind(
    conn: &Connection,
    language: Language,
    kind: Kind,
) -> Result<Vec<Title>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TITLE_COLUMNS} FROM titles
          WHERE language = ?1 AND kind = ?2
          ORDER BY title_key, id"
    ))?;
    let rows = stmt
        .query_map(params![language.as_str(), kind.as_str()], TitleRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(|row| row.into_title(conn)).collect()
}

/// Case-insensitive substring search over titles of one language and kind.
pub fn search_titles(
    conn: &Connection,
    query: &str,
    language: Language,
    kind: Kind,
    limit: usize,
) -> Result<Vec<Title>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(CatalogError::InvalidInput(
            "search query is empty".to_string(),
        ));
    }
    let pattern = format!("%{}%", escape_like(&title_key(query)));
    let mut stmt = conn.prepare(&format!(
        "SELECT {TITLE_COLUMNS} FROM titles
          WHERE language = ?1 AND kind = ?2 AND title_key LIKE ?3 ESCAPE '\\'
          ORDER BY title_key, id
          LIMIT ?4"
    ))?;
    let rows = stmt
        .query_map(
            params![language.as_str(), kind.as_str(), pattern, limit as i64],
            TitleRow::from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(|row| row.into_title(conn)).collect()
}

/// Titles of a kind that carry at least one archival link.
pub fn list_archived(conn: &Connection, kind: Kind) -> Result<Vec<Title>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TITLE_COLUMNS} FROM titles t
          WHERE t.kind = ?1
            AND (t.channel_message_id IS NOT NULL
                 OR EXISTS (SELECT 1 FROM episodes e
                             WHERE e.title_id = t.id AND e.channel_message_id IS NOT NULL))
          ORDER BY t.title_key, t.id"
    ))?;
    let rows = stmt
        .query_map(params![kind.as_str()], TitleRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(|row| row.into_title(conn)).collect()
}

pub fn stats(conn: &Connection) -> Result<CatalogStats> {
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    };
    Ok(CatalogStats {
        movies: count("SELECT COUNT(*) FROM titles WHERE kind = 'movie'")?,
        tv_shows: count("SELECT COUNT(*) FROM titles WHERE kind = 'tv_show'")?,
        seasons: count("SELECT COUNT(*) FROM seasons")?,
        episodes_with_files: count("SELECT COUNT(*) FROM episodes")?,
        movies_with_files: count(
            "SELECT COUNT(*) FROM titles WHERE kind = 'movie' AND file_id IS NOT NULL",
        )?,
        archived_files: count(
            "SELECT (SELECT COUNT(*) FROM titles WHERE channel_message_id IS NOT NULL)
                  + (SELECT COUNT(*) FROM episodes WHERE channel_message_id IS NOT NULL)",
        )?,
    })
}

// ── File attachment ─────────────────────────────────────────────────────────

/// Replace the file attached to a movie.
pub fn attach_movie_file(conn: &Connection, id: TitleId, file: &FileRef) -> Result<()> {
    expect_kind(conn, id, Kind::Movie)?;
    let (channel_message_id, permanent_link) = archive_columns(file.archive.as_ref());
    conn.execute(
        "UPDATE titles
            SET file_id = ?2, file_name = ?3, media = ?4, uploaded_at = ?5,
                channel_message_id = ?6, permanent_link = ?7
          WHERE id = ?1",
        params![
            id.value(),
            file.file_id,
            file.file_name,
            file.media.as_str(),
            file.uploaded_at.to_rfc3339(),
            channel_message_id,
            permanent_link,
        ],
    )?;
    Ok(())
}

/// Attach a file to an episode of an existing season.
///
/// An existing episode with the same number has its file replaced in place;
/// otherwise a new episode record is inserted. Seasons are never created here.
pub fn attach_episode_file(
    conn: &mut Connection,
    id: TitleId,
    season: u32,
    episode: u32,
    file: &FileRef,
) -> Result<EpisodeWrite> {
    if episode == 0 {
        return Err(CatalogError::InvalidInput(
            "episode numbers start at 1".to_string(),
        ));
    }

    let tx = conn.transaction()?;
    expect_kind(&tx, id, Kind::TvShow)?;

    let season_exists: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM seasons WHERE title_id = ?1 AND season_number = ?2)",
        params![id.value(), season],
        |row| row.get(0),
    )?;
    if !season_exists {
        return Err(CatalogError::SeasonNotFound {
            title_id: id,
            season,
        });
    }

    let episode_exists: bool = tx.query_row(
        "SELECT EXISTS (SELECT 1 FROM episodes
                         WHERE title_id = ?1 AND season_number = ?2 AND episode_number = ?3)",
        params![id.value(), season, episode],
        |row| row.get(0),
    )?;

    let (channel_message_id, permanent_link) = archive_columns(file.archive.as_ref());
    tx.execute(
        "INSERT INTO episodes (title_id, season_number, episode_number, file_id, file_name,
                               media, uploaded_at, channel_message_id, permanent_link)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (title_id, season_number, episode_number) DO UPDATE SET
             file_id = excluded.file_id,
             file_name = excluded.file_name,
             media = excluded.media,
             uploaded_at = excluded.uploaded_at,
             channel_message_id = excluded.channel_message_id,
             permanent_link = excluded.permanent_link",
        params![
            id.value(),
            season,
            episode,
            file.file_id,
            file.file_name,
            file.media.as_str(),
            file.uploaded_at.to_rfc3339(),
            channel_message_id,
            permanent_link,
        ],
    )?;
    tx.commit()?;

    Ok(if episode_exists {
        EpisodeWrite::Updated
    } else {
        EpisodeWrite::Inserted
    })
}

pub fn set_movie_archive(conn: &Connection, id: TitleId, archive: &ArchivalRef) -> Result<()> {
    expect_kind(conn, id, Kind::Movie)?;
    let changed = conn.execute(
        "UPDATE titles SET channel_message_id = ?2, permanent_link = ?3
          WHERE id = ?1 AND file_id IS NOT NULL",
        params![id.value(), archive.channel_message_id, archive.permanent_link],
    )?;
    if changed == 0 {
        return Err(CatalogError::InvalidInput(format!(
            "movie {id} has no attached file to link"
        )));
    }
    Ok(())
}

pub fn set_episode_archive(
    conn: &Connection,
    id: TitleId,
    season: u32,
    episode: u32,
    archive: &ArchivalRef,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE episodes SET channel_message_id = ?4, permanent_link = ?5
          WHERE title_id = ?1 AND season_number = ?2 AND episode_number = ?3",
        params![
            id.value(),
            season,
            episode,
            archive.channel_message_id,
            archive.permanent_link,
        ],
    )?;
    if changed == 0 {
        return Err(CatalogError::EpisodeNotFound {
            title_id: id,
            season,
            episode,
        });
    }
    Ok(())
}

// ── Row mapping ─────────────────────────────────────────────────────────────

struct TitleRow {
    id: i64,
    title: String,
    language: String,
    kind: String,
    external_id: Option<i64>,
    details_json: String,
    created_at: String,
    file_id: Option<String>,
    file_name: Option<String>,
    media: String,
    uploaded_at: Option<String>,
    channel_message_id: Option<i64>,
    permanent_link: Option<String>,
}

impl TitleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            language: row.get(2)?,
            kind: row.get(3)?,
            external_id: row.get(4)?,
            details_json: row.get(5)?,
            created_at: row.get(6)?,
            file_id: row.get(7)?,
            file_name: row.get(8)?,
            media: row.get(9)?,
            uploaded_at: row.get(10)?,
            channel_message_id: row.get(11)?,
            permanent_link: row.get(12)?,
        })
    }

    fn into_title(self, conn: &Connection) -> Result<Title> {
        let id = TitleId::new(self.id);
        let language = Language::parse(&self.language).ok_or_else(|| {
            CatalogError::CorruptRow(format!("title {id} has unknown language {:?}", self.language))
        })?;
        let kind = Kind::from_storage(&self.kind).ok_or_else(|| {
            CatalogError::CorruptRow(format!("title {id} has unknown kind {:?}", self.kind))
        })?;
        let body = match kind {
            Kind::Movie => {
                let file = match (self.file_id, self.uploaded_at) {
                    (Some(file_id), Some(uploaded_at)) => Some(FileRef {
                        file_id,
                        file_name: self.file_name,
                        media: parse_media(&self.media)?,
                        uploaded_at: parse_timestamp(&uploaded_at)?,
                        archive: archive_from_columns(self.channel_message_id, self.permanent_link),
                    }),
                    _ => None,
                };
                TitleBody::Movie { file }
            }
            Kind::TvShow => TitleBody::TvShow {
                seasons: load_seasons(conn, id)?,
            },
        };
        Ok(Title {
            id,
            title: self.title,
            language,
            external_id: self.external_id,
            details: serde_json::from_str(&self.details_json)?,
            created_at: parse_timestamp(&self.created_at)?,
            body,
        })
    }
}

fn load_seasons(conn: &Connection, id: TitleId) -> Result<Vec<Season>> {
    let mut season_stmt = conn.prepare(
        "SELECT season_number, name, episode_count FROM seasons
          WHERE title_id = ?1 ORDER BY season_number",
    )?;
    let season_rows = season_stmt
        .query_map(params![id.value()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut seasons = Vec::with_capacity(season_rows.len());
    for (season_number, name, episode_count) in season_rows {
        seasons.push(Season {
            season_number: to_u32(season_number, "season_number")?,
            name,
            episode_count: episode_count
                .map(|n| to_u32(n, "episode_count"))
                .transpose()?,
            episodes: Vec::new(),
        });
    }

    let mut episode_stmt = conn.prepare(
        "SELECT season_number, episode_number, file_id, file_name, media, uploaded_at,
                channel_message_id, permanent_link
           FROM episodes
          WHERE title_id = ?1
          ORDER BY season_number, episode_number",
    )?;
    let episode_rows = episode_stmt
        .query_map(params![id.value()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (season_number, episode_number, file_id, file_name, media, uploaded_at, message_id, link) in
        episode_rows
    {
        let season_number = to_u32(season_number, "season_number")?;
        let Some(season) = seasons
            .iter_mut()
            .find(|s| s.season_number == season_number)
        else {
            continue;
        };
        season.episodes.push(Episode {
            episode_number: to_u32(episode_number, "episode_number")?,
            file: Some(FileRef {
                file_id,
                file_name,
                media: parse_media(&media)?,
                uploaded_at: parse_timestamp(&uploaded_at)?,
                archive: archive_from_columns(message_id, link),
            }),
        });
    }
    Ok(seasons)
}

fn expect_kind(conn: &Connection, id: TitleId, expected: Kind) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT kind FROM titles WHERE id = ?1",
            params![id.value()],
            |row| row.get(0),
        )
        .optional()?;
    let stored = stored.ok_or(CatalogError::TitleNotFound(id))?;
    let actual = Kind::from_storage(&stored).ok_or_else(|| {
        CatalogError::CorruptRow(format!("title {id} has unknown kind {stored:?}"))
    })?;
    if actual != expected {
        return Err(CatalogError::KindMismatch {
            title_id: id,
            expected,
            actual,
        });
    }
    Ok(())
}

fn archive_columns(archive: Option<&ArchivalRef>) -> (Option<i64>, Option<String>) {
    match archive {
        Some(a) => (Some(a.channel_message_id), Some(a.permanent_link.clone())),
        None => (None, None),
    }
}

fn archive_from_columns(message_id: Option<i64>, link: Option<String>) -> Option<ArchivalRef> {
    match (message_id, link) {
        (Some(channel_message_id), Some(permanent_link)) => Some(ArchivalRef {
            channel_message_id,
            permanent_link,
        }),
        _ => None,
    }
}

fn parse_media(value: &str) -> Result<MediaKind> {
    MediaKind::from_storage(value)
        .ok_or_else(|| CatalogError::CorruptRow(format!("unknown media kind {value:?}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CatalogError::CorruptRow(format!("bad timestamp {value:?}: {e}")))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| CatalogError::CorruptRow(format!("{column} out of range: {value}")))
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
