use crate::error::{MetadataError, Result};
use crate::lookup::MetadataLookup;
use crate::types::{Candidate, SeasonOutline, TitleDetails};
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use sf_catalog::Kind;

pub const TMDB_DEFAULT_BASE_URL: &str = "https://api.themoviedb.org/3";

#[derive(Clone)]
pub struct TmdbClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    language: String,
}

impl TmdbClient {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn new(api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: TMDB_DEFAULT_BASE_URL.to_string(),
            language: "en-US".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = language.to_string();
        self
    }

    fn kind_segment(kind: Kind) -> &'static str {
        match kind {
            Kind::Movie => "movie",
            Kind::TvShow => "tv",
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("api_key", self.api_key.as_str()), ("language", self.language.as_str())])
            .query(query)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl MetadataLookup for TmdbClient {
    #[tracing::instrument(level = "info", skip_all, fields(kind = %kind))]
    async fn search(&self, query: &str, kind: Kind) -> Result<Vec<Candidate>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(MetadataError::InvalidInput("empty search query".to_string()));
        }
        let path = format!("search/{}", Self::kind_segment(kind));
        let response: SearchResponse = self.get_json(&path, &[("query", query)]).await?;
        let candidates = candidates_from_search(response);
        tracing::debug!(count = candidates.len(), "metadata search finished");
        Ok(candidates)
    }

    #[tracing::instrument(level = "info", skip_all, fields(external_id = external_id, kind = %kind))]
    async fn details(&self, external_id: i64, kind: Kind) -> Result<TitleDetails> {
        let path = format!("{}/{external_id}", Self::kind_segment(kind));
        let raw: serde_json::Value = self.get_json(&path, &[]).await?;
        details_from_value(raw)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

/// Movies carry `title`/`release_date`, shows carry `name`/`first_air_date`.
#[derive(Debug, Deserialize)]
struct SearchResult {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    first_air_date: Option<String>,
    #[serde(default)]
    overview: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsPayload {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    #[serde(default)]
    first_air_date: Option<String>,
    #[serde(default)]
    seasons: Vec<SeasonPayload>,
}

#[derive(Debug, Deserialize)]
struct SeasonPayload {
    season_number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    episode_count: Option<u32>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn candidates_from_search(response: SearchResponse) -> Vec<Candidate> {
    response
        .results
        .into_iter()
        .filter_map(|r| {
            let label = non_empty(r.title).or(non_empty(r.name))?;
            Some(Candidate {
                external_id: r.id,
                display_label: label,
                release_date: non_empty(r.release_date).or(non_empty(r.first_air_date)),
                overview: non_empty(r.overview),
            })
        })
        .collect()
}

fn details_from_value(raw: serde_json::Value) -> Result<TitleDetails> {
    let payload: DetailsPayload = serde_json::from_value(raw.clone())?;
    let name = non_empty(payload.title)
        .or(non_empty(payload.name))
        .ok_or_else(|| MetadataError::ResponseFormat("details without a title".to_string()))?;
    let mut seasons: Vec<SeasonOutline> = payload
        .seasons
        .into_iter()
        .filter(|s| s.season_number >= 1)
        .map(|s| SeasonOutline {
            season_number: s.season_number,
            name: non_empty(s.name),
            episode_count: s.episode_count,
        })
        .collect();
    seasons.sort_by_key(|s| s.season_number);
    seasons.dedup_by_key(|s| s.season_number);

    Ok(TitleDetails {
        external_id: payload.id,
        name,
        overview: non_empty(payload.overview),
        release_date: non_empty(payload.release_date).or(non_empty(payload.first_air_date)),
        seasons,
        raw,
    })
}
