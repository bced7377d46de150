//! Remote directory client: the collaborator identities are replicated to.

use crate::database::Role;
use crate::sync::models::ErrorKind;
use crate::{BioConnectError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure reported by the remote directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure or timeout. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The directory refused the request. Retrying will not help.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Mutable profile fields sent on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityFields {
    pub display_name: String,
    pub role: Role,
}

/// The remote user directory.
///
/// `create_identity` must treat `local_id` as an idempotency key: sending
/// the same registration twice returns the same remote id and creates
/// one record.
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    async fn create_identity(
        &self,
        local_id: &str,
        display_name: &str,
        role: Role,
    ) -> std::result::Result<String, RemoteError>;

    async fn update_identity(
        &self,
        remote_id: &str,
        fields: &IdentityFields,
    ) -> std::result::Result<(), RemoteError>;
}

#[derive(Serialize)]
struct CreateIdentityRequest<'a> {
    local_id: &'a str,
    display_name: &'a str,
    role: Role,
}

#[derive(Deserialize)]
struct CreateIdentityResponse {
    remote_id: String,
}

/// HTTP client for the directory service.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    /// Create a new directory client with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BioConnectError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `host:port` of the directory, for reachability probes.
    pub fn probe_addr(&self) -> Result<String> {
        let url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| BioConnectError::Config(format!("Invalid remote URL: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| BioConnectError::Config("Remote URL has no host".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| BioConnectError::Config("Remote URL has no port".to_string()))?;
        Ok(format!("{}:{}", host, port))
    }
}

/// Map a transport error. Everything below HTTP is worth retrying.
fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

/// Map an unsuccessful HTTP status onto the directory error taxonomy.
fn status_error(status: StatusCode, body: String) -> RemoteError {
    let message = format!("directory returned {}: {}", status, body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        RemoteError::Transient(message)
    } else if status == StatusCode::NOT_FOUND {
        RemoteError::NotFound(message)
    } else {
        RemoteError::Rejected(message)
    }
}

#[async_trait]
impl RemoteDirectory for HttpDirectory {
    async fn create_identity(
        &self,
        local_id: &str,
        display_name: &str,
        role: Role,
    ) -> std::result::Result<String, RemoteError> {
        let url = format!("{}/api/v1/identities", self.base_url);
        let resp = self
            .client
            .post(&url)
            .header("Idempotency-Key", local_id)
            .json(&CreateIdentityRequest {
                local_id,
                display_name,
                role,
            })
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(status_error(status, body));
        }

        let body: CreateIdentityResponse = resp.json().await.map_err(|e| {
            RemoteError::Rejected(format!("Invalid create response: {}", e))
        })?;
        Ok(body.remote_id)
    }

    async fn update_identity(
        &self,
        remote_id: &str,
        fields: &IdentityFields,
    ) -> std::result::Result<(), RemoteError> {
        let url = format!("{}/api/v1/identities/{}", self.base_url, remote_id);
        let resp = self
            .client
            .patch(&url)
            .json(fields)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(status_error(status, body));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, String::new()).is_transient());
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, String::new()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, String::new()).kind(),
            ErrorKind::Rejected
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, String::new()).kind(),
            ErrorKind::Rejected
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let client = HttpDirectory::new("http://directory.local/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://directory.local");
        assert_eq!(client.probe_addr().unwrap(), "directory.local:80");

        let tls = HttpDirectory::new("https://10.0.0.5:8443/api", Duration::from_secs(5)).unwrap();
        assert_eq!(tls.probe_addr().unwrap(), "10.0.0.5:8443");
    }

    #[tokio::test]
    async fn unreachable_directory_is_transient() {
        // Port 9 on localhost is the discard service; nothing listens there in CI.
        let client = HttpDirectory::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client
            .create_identity("local-1", "Ana", Role::Worker)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
