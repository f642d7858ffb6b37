//! HTTP sync transport for the stoct relay.
//!
//! Stateless: no retries, no caching. Each call maps HTTP and connection
//! failures onto [`SyncError`] and returns. Retry policy belongs to
//! [`crate::SyncManager`].

use crate::crypto::KdfDescriptor;
use crate::sync::config::ClientConfig;
use crate::sync::models::{
    DownloadedBlob, InitVaultRequest, InitVaultResponse, MetaResponse, PutResponse, RemoteMeta,
    Revision, ETAG_HEADER, KDF_HEADER, VERSION_HEADER,
};
use crate::{Result, SyncError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_TYPE, IF_MATCH};
use reqwest::StatusCode;
use std::time::Duration;

/// The four remote operations of the sync protocol.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Create metadata for a new user. Returns the initial version token.
    async fn init_vault(&self, request: &InitVaultRequest) -> Result<String>;

    /// Read metadata. An absent vault is `exists == false`, not an error.
    async fn fetch_meta(&self, user_id: &str) -> Result<RemoteMeta>;

    /// Download the encrypted blob with its revision.
    async fn download_blob(&self, user_id: &str) -> Result<DownloadedBlob>;

    /// Replace the blob iff `expected_token` is still current.
    async fn upload_blob(&self, user_id: &str, bytes: &[u8], expected_token: &str)
        -> Result<Revision>;
}

/// HTTP client for the stoct relay.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new transport for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Build from configuration. `Ok(None)` when no endpoint is configured.
    pub fn from_config(config: &ClientConfig) -> Result<Option<Self>> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config.timeout()))
            .transpose()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn init_vault(&self, request: &InitVaultRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.url("/v1/init"))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;

        let resp = check_status(resp).await?;
        let body: InitVaultResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Unknown(format!("Invalid init response: {}", e)))?;
        Ok(body.etag)
    }

    async fn fetch_meta(&self, user_id: &str) -> Result<RemoteMeta> {
        let resp = self
            .client
            .get(self.url("/v1/meta"))
            .query(&[("user", user_id)])
            .send()
            .await
            .map_err(request_error)?;

        let resp = check_status(resp).await?;
        let body: MetaResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Unknown(format!("Invalid meta response: {}", e)))?;
        Ok(body.into())
    }

    async fn download_blob(&self, user_id: &str) -> Result<DownloadedBlob> {
        let resp = self
            .client
            .get(self.url("/v1/get"))
            .query(&[("user", user_id)])
            .send()
            .await
            .map_err(request_error)?;

        let resp = check_status(resp).await?;
        let headers = resp.headers().clone();
        let version_token = required_header(&headers, ETAG_HEADER)?;
        let version = parse_version(&headers)?;
        let kdf = parse_kdf(&headers)?;

        let bytes = resp.bytes().await.map_err(request_error)?.to_vec();

        Ok(DownloadedBlob {
            bytes,
            version_token,
            version,
            kdf,
        })
    }

    async fn upload_blob(
        &self,
        user_id: &str,
        bytes: &[u8],
        expected_token: &str,
    ) -> Result<Revision> {
        let resp = self
            .client
            .post(self.url("/v1/put"))
            .query(&[("user", user_id)])
            .header(IF_MATCH, expected_token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(request_error)?;

        let resp = check_status(resp).await?;
        let headers = resp.headers().clone();

        // Headers are authoritative; the JSON body is a convenience mirror.
        match (required_header(&headers, ETAG_HEADER), parse_version(&headers)) {
            (Ok(version_token), Ok(version)) => Ok(Revision {
                version_token,
                version,
            }),
            _ => {
                let body: PutResponse = resp
                    .json()
                    .await
                    .map_err(|e| SyncError::Unknown(format!("Invalid put response: {}", e)))?;
                Ok(Revision {
                    version_token: body.etag,
                    version: body.version,
                })
            }
        }
    }
}

/// Map a failed request (no HTTP status available) to the taxonomy.
fn request_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SyncError::Network(e.to_string())
    } else if e.is_decode() || e.is_body() {
        SyncError::Network(format!("Response interrupted: {}", e))
    } else {
        SyncError::Unknown(e.to_string())
    }
}

/// Map an HTTP status to the taxonomy. `None` for success.
pub fn status_error(status: StatusCode, detail: &str) -> Option<SyncError> {
    if status.is_success() {
        return None;
    }
    Some(match status.as_u16() {
        404 => SyncError::NotFound,
        409 => SyncError::Conflict("Vault already exists".to_string()),
        412 => SyncError::PreconditionFailed,
        413 | 429 => SyncError::QuotaExceeded,
        503 => SyncError::ServiceUnavailable,
        _ => SyncError::Unknown(format!("Relay error {}: {}", status, detail)),
    })
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let detail = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
    tracing::debug!(%status, "relay rejected request");
    Err(status_error(status, &detail).unwrap_or_else(|| SyncError::Unknown(detail)))
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| SyncError::Unknown(format!("Missing {} header", name)))
}

fn parse_version(headers: &HeaderMap) -> Result<u64> {
    required_header(headers, VERSION_HEADER)?
        .parse()
        .map_err(|e| SyncError::Unknown(format!("Invalid {} header: {}", VERSION_HEADER, e)))
}

/// The descriptor header is JSON; read it as bytes since a relay may send
/// raw UTF-8 that `HeaderValue::to_str` refuses.
fn parse_kdf(headers: &HeaderMap) -> Result<Option<KdfDescriptor>> {
    headers
        .get(KDF_HEADER)
        .map(|v| {
            serde_json::from_slice::<KdfDescriptor>(v.as_bytes())
                .map_err(|e| SyncError::Unknown(format!("Invalid {} header: {}", KDF_HEADER, e)))
        })
        .transpose()
}
