//! Requests against the remote collector.
//!
//! Every operation reduces its outcome to a `bool`; transport errors, timeouts and unexpected
//! status codes never escape this crate.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use stalk_core::config::StalkConfig;
use stalk_core::SampleReport;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("api key is not a valid header value")]
    InvalidApiKey,
    #[error("http client setup failed: {0}")]
    Build(#[from] reqwest::Error),
}

/// The three collector operations the tracker and the control surface rely on.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn report_position(&self, report: &SampleReport) -> bool;
    async fn check_exists(&self, identity: &str) -> bool;
    async fn delete_data(&self, identity: &str) -> bool;
}

#[derive(Clone, Debug)]
pub struct CollectorClient {
    http: reqwest::Client,
    base: String,
}

impl CollectorClient {
    pub fn new(
        server_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ClientError::InvalidApiKey)?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base: server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &StalkConfig) -> Result<Self, ClientError> {
        Self::new(&config.server_url, &config.api_key, config.request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn identity_url(&self, identity: &str) -> String {
        format!("{}/{}", self.base, encode_identity(identity))
    }
}

/// Form-style percent-encoding of an identity for use as a single path segment.
pub fn encode_identity(identity: &str) -> String {
    url::form_urlencoded::byte_serialize(identity.as_bytes()).collect()
}

pub fn report_accepted(status: StatusCode) -> bool {
    matches!(status, StatusCode::OK | StatusCode::CREATED)
}

pub fn exists_from_status(status: StatusCode) -> bool {
    status == StatusCode::OK
}

/// Already-absent data counts as deleted.
pub fn delete_succeeded(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND
    )
}

#[async_trait]
impl Collector for CollectorClient {
    async fn report_position(&self, report: &SampleReport) -> bool {
        match self.http.post(&self.base).json(report).send().await {
            Ok(res) => {
                let status = res.status();
                debug!(event = "collector_post", status = status.as_u16());
                report_accepted(status)
            }
            Err(err) => {
                warn!(event = "collector_post_error", error = %err);
                false
            }
        }
    }

    async fn check_exists(&self, identity: &str) -> bool {
        match self.http.get(self.identity_url(identity)).send().await {
            Ok(res) => {
                let status = res.status();
                debug!(event = "collector_get", identity, status = status.as_u16());
                exists_from_status(status)
            }
            Err(err) => {
                warn!(event = "collector_get_error", identity, error = %err);
                false
            }
        }
    }

    async fn delete_data(&self, identity: &str) -> bool {
        match self.http.delete(self.identity_url(identity)).send().await {
            Ok(res) => {
                let status = res.status();
                debug!(event = "collector_delete", identity, status = status.as_u16());
                delete_succeeded(status)
            }
            Err(err) => {
                warn!(event = "collector_delete_error", identity, error = %err);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_encoded_as_one_segment() {
        assert_eq!(encode_identity("Alice"), "Alice");
        assert_eq!(encode_identity("Alice Smith"), "Alice+Smith");
        assert_eq!(encode_identity("a/b?c"), "a%2Fb%3Fc");
        assert_eq!(encode_identity("Åsa"), "%C3%85sa");
    }

    #[test]
    fn identity_url_strips_trailing_slash_from_base() {
        let client = CollectorClient::new(
            "http://localhost:8080/api/coords/",
            "key",
            Duration::from_secs(10),
        )
        .expect("client");
        assert_eq!(client.base_url(), "http://localhost:8080/api/coords");
        assert_eq!(
            client.identity_url("Bob Jr"),
            "http://localhost:8080/api/coords/Bob+Jr"
        );
    }

    #[test]
    fn status_policies_match_collector_contract() {
        assert!(report_accepted(StatusCode::OK));
        assert!(report_accepted(StatusCode::CREATED));
        assert!(!report_accepted(StatusCode::ACCEPTED));
        assert!(!report_accepted(StatusCode::BAD_REQUEST));

        assert!(exists_from_status(StatusCode::OK));
        assert!(!exists_from_status(StatusCode::NOT_FOUND));
        assert!(!exists_from_status(StatusCode::INTERNAL_SERVER_ERROR));

        for status in [StatusCode::OK, StatusCode::NO_CONTENT, StatusCode::NOT_FOUND] {
            assert!(delete_succeeded(status), "{status}");
        }
        assert!(!delete_succeeded(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!delete_succeeded(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn api_keys_with_control_characters_are_rejected() {
        let result = CollectorClient::new("http://localhost", "bad\nkey", Duration::from_secs(1));
        assert!(matches!(result, Err(ClientError::InvalidApiKey)));
    }
}
