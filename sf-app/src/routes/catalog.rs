//! Read-only catalog listings for the mini-app.

use crate::server::AppState;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json};
use serde::Deserialize;
use sf_catalog::{Kind, Language, Title};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct TitlesQuery {
    language: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ArchivedQuery {
    kind: String,
}

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/catalog/titles", get(list_titles))
        .route("/api/v1/catalog/archived", get(list_archived))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_titles(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<TitlesQuery>,
) -> Response {
    let Some(language) = Language::parse(&query.language) else {
        return bad_request(format!("unknown language: {}", query.language));
    };
    let Some(kind) = Kind::parse(&query.kind) else {
        return bad_request(format!("unknown kind: {}", query.kind));
    };
    match state.catalog.find_by_language_and_kind(language, kind).await {
        Ok(titles) => titles_response(titles),
        Err(e) => internal_error(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_archived(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<ArchivedQuery>,
) -> Response {
    let Some(kind) = Kind::parse(&query.kind) else {
        return bad_request(format!("unknown kind: {}", query.kind));
    };
    match state.catalog.list_archived(kind).await {
        Ok(titles) => titles_response(titles),
        Err(e) => internal_error(e),
    }
}

fn titles_response(titles: Vec<Title>) -> Response {
    Json(serde_json::json!({ "count": titles.len(), "titles": titles })).into_response()
}

fn bad_request(error: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "status": "error", "error": error })),
    )
        .into_response()
}

fn internal_error(e: sf_catalog::CatalogError) -> Response {
    tracing::error!(error = %e, "catalog listing failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "status": "error", "error": "catalog unavailable" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchivalForwarder;
    use crate::batch::BatchAggregator;
    use crate::config::BatchConfig;
    use crate::conversation::ConversationEngine;
    use crate::ingest::Ingestor;
    use crate::testing::{RecordingChannel, StaticMetadata, movie_draft, show_draft};
    use axum::body::Body;
    use axum::http::Request;
    use sf_catalog::{ArchivalRef, CatalogStore, FileRef, SqliteCatalog};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    async fn app(catalog: Arc<SqliteCatalog>) -> axum::Router {
        let channel = Arc::new(RecordingChannel::new());
        let ingestor = Arc::new(Ingestor::new(
            catalog.clone(),
            ArchivalForwarder::new(channel.clone(), "-100555"),
        ));
        let batches = BatchAggregator::start(
            BatchConfig::default(),
            ingestor.clone(),
            channel,
            CancellationToken::new(),
        )
        .await;
        let engine = Arc::new(ConversationEngine::new(
            catalog.clone(),
            Arc::new(StaticMetadata::new()),
            ingestor,
            batches.clone(),
            5,
        ));
        let state = Arc::new(AppState {
            started_at: Instant::now(),
            catalog,
            engine,
            batches,
        });
        crate::routes::router().layer(Extension(state))
    }

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn titles_listing_filters_by_language_and_kind() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        catalog.insert_title(movie_draft("Heat")).await.expect("movie");
        catalog.insert_title(show_draft("Dark", 1)).await.expect("show");

        let (status, body) = get_json(
            app(catalog).await,
            "/api/v1/catalog/titles?language=English&kind=movie",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["titles"][0]["title"], "Heat");
        assert_eq!(body["titles"][0]["kind"], "movie");
    }

    #[tokio::test]
    async fn unknown_language_is_bad_request() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let (status, body) = get_json(
            app(catalog).await,
            "/api/v1/catalog/titles?language=klingon&kind=movie",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown language: klingon");
    }

    #[tokio::test]
    async fn archived_listing_and_health_report_counts() {
        let catalog = Arc::new(SqliteCatalog::open_in_memory().expect("catalog"));
        let heat = catalog.insert_title(movie_draft("Heat")).await.expect("movie");
        catalog.insert_title(movie_draft("Ronin")).await.expect("movie");
        catalog
            .attach_movie_file(heat.id, FileRef::new("heat-file", None))
            .await
            .expect("attach");
        catalog
            .set_movie_archive(
                heat.id,
                ArchivalRef {
                    channel_message_id: 9,
                    permanent_link: "https://t.me/c/555/9".to_string(),
                },
            )
            .await
            .expect("archive");

        let router = app(catalog).await;
        let (status, body) = get_json(router.clone(), "/api/v1/catalog/archived?kind=Movies").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["titles"][0]["title"], "Heat");

        let (status, body) = get_json(router, "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["catalog"]["movies"], 2);
        assert_eq!(body["catalog"]["archived_files"], 1);
        assert_eq!(body["pending_batch_groups"], 0);
    }
}
