//! Write-back endpoints for the render pipeline.
//!
//! Every route except health requires the preview credential in
//! `x-prerender-revalidate`.

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::HttpState;
use crate::{
    application::error::HttpError,
    cache::{ArtifactRecord, ComposableEntry, Namespace},
    queue::consumer::REVALIDATE_HEADER,
};

const SOURCE: &str = "infra::http::internal";

#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    key: String,
    #[serde(default)]
    fetch: bool,
}

#[derive(Debug, Deserialize)]
pub struct TagsQuery {
    #[serde(default)]
    tags: String,
}

#[derive(Debug, Deserialize)]
pub struct RevalidateTagsBody {
    tags: Vec<String>,
}

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn authorize(state: &HttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let presented = headers
        .get(REVALIDATE_HEADER)
        .map(|value| value.as_bytes())
        .unwrap_or_default();

    if !state
        .gateway
        .engine
        .prerender()
        .accepts_preview_credential(presented)
    {
        return Err(HttpError::new(
            SOURCE,
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "missing or invalid preview credential",
        ));
    }
    Ok(())
}

pub async fn get_artifact(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Response, HttpError> {
    authorize(&state, &headers)?;
    let namespace = if query.fetch {
        Namespace::Fetch
    } else {
        Namespace::Cache
    };

    match state.gateway.incremental.get(&query.key, namespace).await? {
        Some(stored) => Ok(Json(json!({
            "value": stored.value,
            "lastModified": stored.last_modified,
        }))
        .into_response()),
        None => Err(HttpError::new(
            SOURCE,
            StatusCode::NOT_FOUND,
            "Not found",
            format!("no artifact stored for `{}`", query.key),
        )),
    }
}

pub async fn put_artifact(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
    Json(record): Json<ArtifactRecord>,
) -> Result<StatusCode, HttpError> {
    authorize(&state, &headers)?;
    state.gateway.incremental.set(&query.key, &record).await?;
    debug!(key = %query.key, kind = record.kind(), "Artifact written back");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_artifact(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<StatusCode, HttpError> {
    authorize(&state, &headers)?;
    state.gateway.incremental.delete(&query.key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revalidate_tags(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Json(body): Json<RevalidateTagsBody>,
) -> Result<StatusCode, HttpError> {
    authorize(&state, &headers)?;
    state.gateway.incremental.revalidate_tags(&body.tags).await?;
    info!(tags = ?body.tags, "Tags revalidated");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn tag_expiration(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TagsQuery>,
) -> Result<Json<serde_json::Value>, HttpError> {
    authorize(&state, &headers)?;
    let tags: Vec<String> = query
        .tags
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect();
    let expiration = state.gateway.composable.get_expiration(&tags).await?;
    Ok(Json(json!({ "expiration": expiration })))
}

pub async fn get_composable(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
) -> Result<Json<ComposableEntry>, HttpError> {
    authorize(&state, &headers)?;
    state
        .gateway
        .composable
        .get(&query.key)
        .await
        .map(Json)
        .ok_or_else(|| {
            HttpError::new(
                SOURCE,
                StatusCode::NOT_FOUND,
                "Not found",
                format!("no composable entry for `{}`", query.key),
            )
        })
}

pub async fn put_composable(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<KeyQuery>,
    Json(entry): Json<ComposableEntry>,
) -> Result<StatusCode, HttpError> {
    authorize(&state, &headers)?;
    state
        .gateway
        .composable
        .set(&query.key, async move { Some(entry) })
        .await;
    Ok(StatusCode::NO_CONTENT)
}
