//! Transfer handlers
//!
//! Export and import require a nonce issued by `POST /transfers/nonce`
//! for the same actor and action, sent in the `x-transfer-nonce` header.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use sitebridge_common::{
    auth::AuthContext,
    errors::{AppError, Result},
    snapshot::EntityId,
    store::EntitySummary,
    transfer::{MaterializeReport, TransferAction},
};

/// Header carrying the transfer nonce
pub const NONCE_HEADER: &str = "x-transfer-nonce";

#[derive(Debug, Deserialize)]
pub struct NonceRequest {
    pub action: TransferAction,
}

#[derive(Serialize)]
pub struct NonceResponse {
    pub action: TransferAction,
    pub nonce: String,
}

fn nonce_header(headers: &HeaderMap, action: TransferAction) -> Result<&str> {
    headers
        .get(NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidNonce {
            action: action.as_str().to_string(),
        })
}

/// `attachment` disposition with an ASCII `filename` and the UTF-8 name as `filename*`
fn content_disposition(filename: &str) -> Result<HeaderValue> {
    let ascii: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '-',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '-',
        })
        .collect();
    let value = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(filename)
    );
    HeaderValue::from_str(&value).map_err(|e| AppError::Internal {
        message: format!("Invalid export filename: {}", e),
    })
}

/// List entities that can be exported
pub async fn list_entities(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<EntitySummary>>> {
    let entities = state.transfers.list_transferable(&auth).await?;
    Ok(Json(entities))
}

/// Issue a nonce for one export or import
pub async fn issue_nonce(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<NonceRequest>,
) -> Result<Json<NonceResponse>> {
    let nonce = state.transfers.issue_nonce(&auth, request.action).await?;
    Ok(Json(NonceResponse {
        action: request.action,
        nonce,
    }))
}

/// Download the snapshot of one entity
pub async fn export(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<u64>,
    headers: HeaderMap,
) -> Result<Response> {
    let nonce = nonce_header(&headers, TransferAction::Export)?;
    let file = state.transfers.export(&auth, EntityId(id), nonce).await?;

    let disposition = content_disposition(&file.filename)?;

    tracing::info!(
        entity_id = id,
        actor = %auth.actor_id,
        request_id = %auth.request_id,
        filename = %file.filename,
        "Snapshot downloaded"
    );

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(file.content_type)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        file.body,
    )
        .into_response())
}

/// Materialize an uploaded snapshot
pub async fn import(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MaterializeReport>> {
    let nonce = nonce_header(&headers, TransferAction::Import)?;
    if body.is_empty() {
        return Err(AppError::Validation {
            message: "No snapshot uploaded".to_string(),
            field: Some("file".to_string()),
        });
    }

    let report = state.transfers.import(&auth, body.to_vec(), nonce).await?;

    tracing::info!(
        actor = %auth.actor_id,
        request_id = %auth.request_id,
        run_id = %report.run_id,
        entities = report.id_map.len(),
        "Snapshot imported"
    );

    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disposition_of_ascii_name() {
        let value = content_disposition("export-acf-post-type-Courses.json").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"export-acf-post-type-Courses.json\"; filename*=UTF-8''export-acf-post-type-Courses.json"
        );
    }

    #[test]
    fn test_disposition_of_unicode_name() {
        let value = content_disposition("export-acf-post-type-Café Kurse.json").unwrap();
        assert_eq!(
            value.to_str().unwrap(),
            "attachment; filename=\"export-acf-post-type-Caf- Kurse.json\"; filename*=UTF-8''export-acf-post-type-Caf%C3%A9%20Kurse.json"
        );
    }
}
