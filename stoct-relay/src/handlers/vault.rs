//! Vault init / meta / get / put handlers.
//!
//! The relay never interprets the KDF descriptor, the wrapped key or the blob.
//! It only checks their shape and enforces the etag precondition.

use super::AppState;
use crate::error::RelayError;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_TYPE, IF_MATCH};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ETAG_HEADER: HeaderName = HeaderName::from_static("x-stoct-etag");
pub const VERSION_HEADER: HeaderName = HeaderName::from_static("x-stoct-v");
pub const KDF_HEADER: HeaderName = HeaderName::from_static("x-stoct-kdf");

const MAX_USER_ID_LEN: usize = 128;

#[derive(Deserialize)]
pub struct UserQuery {
    pub user: Option<String>,
}

impl UserQuery {
    fn user_id(self) -> Result<String, RelayError> {
        let user = self
            .user
            .filter(|u| !u.is_empty())
            .ok_or_else(|| RelayError::BadRequest("Missing user parameter".to_string()))?;
        validate_user_id(&user)?;
        Ok(user)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub user_id: String,
    pub kdf: Value,
    pub wrapped_vault_key: String,
}

#[derive(Serialize)]
pub struct InitResponse {
    pub etag: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaResponse {
    pub has_vault: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kdf: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wrapped_vault_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Serialize)]
pub struct PutResponse {
    pub etag: String,
    pub version: u64,
}

/// `POST /v1/init`
pub async fn init(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<InitResponse>, RelayError> {
    // Parsed by hand so malformed input is a 400 rather than axum's 422.
    let req: InitRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::BadRequest(format!("Invalid init request: {}", e)))?;

    validate_user_id(&req.user_id)?;
    match req.kdf.get("algorithm") {
        Some(Value::String(algorithm)) if !algorithm.is_empty() => {}
        _ => {
            return Err(RelayError::BadRequest(
                "kdf must be an object with an algorithm".to_string(),
            ))
        }
    }
    let wrapped = base64::engine::general_purpose::STANDARD
        .decode(&req.wrapped_vault_key)
        .map_err(|_| RelayError::BadRequest("wrappedVaultKey is not base64".to_string()))?;
    if wrapped.is_empty() {
        return Err(RelayError::BadRequest("wrappedVaultKey is empty".to_string()));
    }

    let revision = state
        .store
        .init(&req.user_id, &req.kdf, &req.wrapped_vault_key)
        .inspect_err(|e| {
            if matches!(e, RelayError::Conflict(_)) {
                tracing::warn!(user_id = %req.user_id, "Init rejected, vault exists");
            }
        })?;

    tracing::info!(user_id = %req.user_id, "Vault initialized");
    Ok(Json(InitResponse {
        etag: revision.etag,
    }))
}

/// `GET /v1/meta?user=<id>`
pub async fn meta(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Json<MetaResponse>, RelayError> {
    let user_id = query.user_id()?;

    let response = match state.store.meta(&user_id)? {
        Some(meta) => MetaResponse {
            has_vault: true,
            kdf: Some(meta.kdf),
            wrapped_vault_key: Some(meta.wrapped_vault_key),
            etag: Some(meta.etag),
            version: Some(meta.version),
        },
        None => MetaResponse {
            has_vault: false,
            kdf: None,
            wrapped_vault_key: None,
            etag: None,
            version: None,
        },
    };
    Ok(Json(response))
}

/// `GET /v1/get?user=<id>`
pub async fn get(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
) -> Result<Response, RelayError> {
    let user_id = query.user_id()?;
    let blob = state.store.download(&user_id)?;
    tracing::debug!(%user_id, version = blob.version, size = blob.bytes.len(), "Blob served");

    let mut headers = revision_headers(&blob.etag, blob.version)?;
    let kdf = header_json(&blob.kdf)?;
    headers.insert(
        KDF_HEADER,
        HeaderValue::from_str(&kdf)
            .map_err(|e| RelayError::Internal(format!("KDF header: {}", e)))?,
    );
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );

    Ok((headers, blob.bytes).into_response())
}

/// `POST /v1/put?user=<id>` with `If-Match: <etag>`
pub async fn put(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let user_id = query.user_id()?;
    let expected = headers
        .get(IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().trim_matches('"'))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RelayError::BadRequest("Missing If-Match header".to_string()))?
        .to_string();

    if body.is_empty() {
        return Err(RelayError::BadRequest("Empty blob".to_string()));
    }
    if body.len() > state.max_blob_bytes {
        tracing::warn!(%user_id, size = body.len(), "Blob over size limit");
        return Err(RelayError::PayloadTooLarge);
    }

    let revision = state
        .store
        .upload(&user_id, &expected, &body)
        .inspect_err(|e| {
            if matches!(e, RelayError::PreconditionFailed) {
                tracing::warn!(%user_id, "Put rejected, stale etag");
            }
        })?;
    tracing::debug!(%user_id, version = revision.version, size = body.len(), "Blob stored");

    let headers = revision_headers(&revision.etag, revision.version)?;
    let body = Json(PutResponse {
        etag: revision.etag,
        version: revision.version,
    });
    Ok((headers, body).into_response())
}

fn revision_headers(etag: &str, version: u64) -> Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ETAG_HEADER,
        HeaderValue::from_str(etag).map_err(|e| RelayError::Internal(format!("Etag header: {}", e)))?,
    );
    headers.insert(VERSION_HEADER, HeaderValue::from(version));
    Ok(headers)
}

/// Compact JSON restricted to visible ASCII so it fits a header value.
///
/// Anything else can only occur inside JSON strings, where `\uXXXX`
/// (UTF-16, surrogate pairs for astral characters) decodes back to the
/// same text.
fn header_json(value: &Value) -> Result<String, RelayError> {
    let json = serde_json::to_string(value)?;
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if (' '..='~').contains(&c) {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(out)
}

fn validate_user_id(user_id: &str) -> Result<(), RelayError> {
    if user_id.is_empty() || user_id.len() > MAX_USER_ID_LEN {
        return Err(RelayError::BadRequest("Invalid user id".to_string()));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RelayError::BadRequest("Invalid user id".to_string()));
    }
    Ok(())
}
