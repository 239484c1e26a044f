use actix_web::{HttpResponse, get, web};
use serde::Deserialize;

use modelwatch::orchestrator::{RefreshMode, SnapshotService};

use crate::error::AppError;

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    refresh: Option<String>,
}

/// Latest snapshot of every enabled target.
///
/// `?refresh=always|missing|never` picks whether a probe batch runs first;
/// the default only reads history.
#[get("/api/status")]
pub async fn status_route(
    snapshots: web::Data<SnapshotService>,
    query: web::Query<StatusQuery>,
) -> Result<HttpResponse, AppError> {
    let mode = match query.refresh.as_deref() {
        Some(raw) => raw.parse::<RefreshMode>().map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => RefreshMode::default(),
    };

    let snapshot = snapshots.get_snapshot(mode).await?;
    Ok(HttpResponse::Ok().json(&*snapshot))
}
