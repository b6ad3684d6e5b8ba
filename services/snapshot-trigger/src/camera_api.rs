//! HTTP client for the camera vendor's snapshot API.
//!
//! Snapshots are produced in two phases: a `generateSnapshot` request is
//! accepted with `202` and answers with the URL the image will be served
//! from, then the image itself is fetched from that URL.

use crate::config::CameraApiConfig;
use crate::event_filter::is_valid_device_serial;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised by the transport layer
#[derive(Error, Debug)]
pub enum CameraApiError {
    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Invalid API key header: {0}")]
    InvalidHeader(String),

    #[error("Invalid base URL {url}: {message}")]
    InvalidBaseUrl { url: String, message: String },

    #[error("Invalid device serial {0:?}")]
    InvalidSerial(String),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Status and body of an API response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

#[derive(Deserialize)]
struct SnapshotInfo {
    url: Option<String>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Snapshot URL carried by a generate response, if any.
    ///
    /// Bodies that are not JSON or carry an empty `url` yield `None`.
    pub fn snapshot_url(&self) -> Option<String> {
        serde_json::from_slice::<SnapshotInfo>(&self.body)
            .ok()
            .and_then(|info| info.url)
            .filter(|url| !url.is_empty())
    }

    /// Body as text, for diagnostics
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Operations of the camera snapshot API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CameraApi: Send + Sync {
    /// Ask the device to generate a snapshot
    async fn generate_snapshot(&self, device_serial: &str) -> Result<ApiResponse, CameraApiError>;

    /// Fetch a generated snapshot
    async fn download(&self, url: &str) -> Result<ApiResponse, CameraApiError>;
}

/// `reqwest` implementation of [`CameraApi`]
pub struct HttpCameraApi {
    client: reqwest::Client,
    base_url: Url,
    key_header: HeaderName,
    key_value: HeaderValue,
}

impl HttpCameraApi {
    pub fn new(config: &CameraApiConfig) -> Result<Self, CameraApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(CameraApiError::Client)?;

        let key_header = HeaderName::from_bytes(config.api_key_header.as_bytes())
            .map_err(|e| CameraApiError::InvalidHeader(e.to_string()))?;
        let mut key_value = HeaderValue::from_str(&config.api_key)
            .map_err(|e| CameraApiError::InvalidHeader(e.to_string()))?;
        key_value.set_sensitive(true);

        let base_url = Url::parse(&config.base_url).map_err(|e| CameraApiError::InvalidBaseUrl {
            url: config.base_url.clone(),
            message: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CameraApiError::InvalidBaseUrl {
                url: config.base_url.clone(),
                message: "URL cannot carry a path".to_string(),
            });
        }

        Ok(Self {
            client,
            base_url,
            key_header,
            key_value,
        })
    }

    /// Endpoint generating a snapshot for `device_serial`.
    ///
    /// The serial is appended as a single path segment and must look like a
    /// device serial, so it can never redirect the request elsewhere.
    pub fn generate_snapshot_url(&self, device_serial: &str) -> Result<Url, CameraApiError> {
        if !is_valid_device_serial(device_serial) {
            return Err(CameraApiError::InvalidSerial(device_serial.to_string()));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CameraApiError::InvalidBaseUrl {
                url: self.base_url.to_string(),
                message: "URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(["devices", device_serial, "camera", "generateSnapshot"]);
        Ok(url)
    }
}

#[async_trait]
impl CameraApi for HttpCameraApi {
    #[instrument(skip(self))]
    async fn generate_snapshot(&self, device_serial: &str) -> Result<ApiResponse, CameraApiError> {
        let url = self.generate_snapshot_url(device_serial)?;
        debug!(url = %url, "Requesting snapshot generation");

        let response = self
            .client
            .post(url)
            .header(self.key_header.clone(), self.key_value.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(ApiResponse { status, body })
    }

    #[instrument(skip(self))]
    async fn download(&self, url: &str) -> Result<ApiResponse, CameraApiError> {
        // The snapshot URL is pre-signed; the API key is not sent to it
        let response = self.client.get(url).send().await?;

        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_url_present() {
        let response = ApiResponse::new(
            202,
            r#"{"url": "https://spn4.meraki.com/stream/jpeg/snapshot/abc", "expiry": "2024-01-15T10:35:00Z"}"#,
        );
        assert_eq!(
            response.snapshot_url().as_deref(),
            Some("https://spn4.meraki.com/stream/jpeg/snapshot/abc")
        );
    }

    #[test]
    fn test_snapshot_url_missing_or_empty() {
        assert_eq!(ApiResponse::new(202, "{}").snapshot_url(), None);
        assert_eq!(ApiResponse::new(202, r#"{"url": ""}"#).snapshot_url(), None);
        assert_eq!(ApiResponse::new(202, r#"{"url": null}"#).snapshot_url(), None);
        assert_eq!(ApiResponse::new(202, "").snapshot_url(), None);
        assert_eq!(ApiResponse::new(202, "<html>").snapshot_url(), None);
    }

    #[test]
    fn test_generate_snapshot_url() {
        let mut config = CameraApiConfig::new("key");
        config.base_url = "https://api.example.com/api/v1/".to_string();
        let api = HttpCameraApi::new(&config).unwrap();

        assert_eq!(
            api.generate_snapshot_url("Q2XX-ABCD-1234").unwrap().as_str(),
            "https://api.example.com/api/v1/devices/Q2XX-ABCD-1234/camera/generateSnapshot"
        );

        config.base_url = "https://api.example.com/api/v1".to_string();
        let api = HttpCameraApi::new(&config).unwrap();
        assert_eq!(
            api.generate_snapshot_url("Q2XX").unwrap().path(),
            "/api/v1/devices/Q2XX/camera/generateSnapshot"
        );
    }

    #[test]
    fn test_serial_cannot_rewrite_endpoint() {
        let api = HttpCameraApi::new(&CameraApiConfig::new("key")).unwrap();

        for serial in ["x?y", "x#frag", "..", ".", "a/b", "x y", ""] {
            assert!(
                matches!(
                    api.generate_snapshot_url(serial),
                    Err(CameraApiError::InvalidSerial(_))
                ),
                "serial {:?} accepted",
                serial
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_serial_sends_no_request() {
        // Port 1 refuses connections, so only a pre-flight rejection passes
        let mut config = CameraApiConfig::new("key");
        config.base_url = "http://127.0.0.1:1/api/v1".to_string();
        let api = HttpCameraApi::new(&config).unwrap();

        assert!(matches!(
            api.generate_snapshot("x?y").await,
            Err(CameraApiError::InvalidSerial(serial)) if serial == "x?y"
        ));
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = CameraApiConfig::new("key");
        config.base_url = "not a url".to_string();

        assert!(matches!(
            HttpCameraApi::new(&config),
            Err(CameraApiError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_invalid_api_key_header() {
        let mut config = CameraApiConfig::new("key");
        config.api_key_header = "bad header".to_string();

        assert!(matches!(
            HttpCameraApi::new(&config),
            Err(CameraApiError::InvalidHeader(_))
        ));
    }
}
