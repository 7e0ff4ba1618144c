//! HTTP client for the InfluxDB v2 API, behind the [`InfluxSink`] seam so
//! the upload pump and tests never depend on a live endpoint.

use std::time::Duration;

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::debug;

use super::encoder::{encode_lines, Point};

pub const URL_ENV: &str = "INFLUXDB_URL";
pub const TOKEN_ENV: &str = "INFLUXDB_TOKEN";
pub const ORG_ENV: &str = "INFLUXDB_ORG";
pub const BUCKET_ENV: &str = "INFLUXDB_BUCKET";

const DEFAULT_URL: &str = "https://cloud2.influxdata.com";
const DEFAULT_ORG: &str = "globalcorp";
const DEFAULT_BUCKET: &str = "industrial-data";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum SinkError {
    #[snafu(display(
        "InfluxDB token not provided; set the {TOKEN_ENV} environment variable"
    ))]
    MissingToken,
    #[snafu(display("Unable to build HTTP client: {source}"))]
    ClientBuild { source: reqwest::Error },
    #[snafu(display("InfluxDB request failed: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("InfluxDB rejected the request: {status}: {body}"))]
    Rejected { status: u16, body: String },
    #[snafu(display("Batch could not be encoded: {source}"))]
    Encode {
        source: super::encoder::EncodeError,
    },
}

/// The remote time-series store as the pump sees it: a liveness probe and
/// an idempotent point write.
#[async_trait]
pub trait InfluxSink: Send + Sync {
    async fn ping(&self) -> Result<(), SinkError>;
    async fn write(&self, points: &[Point]) -> Result<(), SinkError>;
}

/// reqwest-backed v2 client. TLS verification stays on; credentials come
/// from the environment only.
pub struct InfluxHttpClient {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxHttpClient {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        org: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Result<Self, SinkError> {
        let token = token.into();
        if token.is_empty() {
            return Err(SinkError::MissingToken);
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(ClientBuildSnafu)?;
        Ok(Self {
            http,
            url: url.into().trim_end_matches('/').to_owned(),
            token,
            org: org.into(),
            bucket: bucket.into(),
        })
    }

    /// Reads `INFLUXDB_URL` / `INFLUXDB_TOKEN` / `INFLUXDB_ORG` /
    /// `INFLUXDB_BUCKET`; a missing token is a startup-fatal error.
    pub fn from_env() -> Result<Self, SinkError> {
        let token = std::env::var(TOKEN_ENV).ok().context(MissingTokenSnafu)?;
        let url = std::env::var(URL_ENV).unwrap_or_else(|_| DEFAULT_URL.to_owned());
        let org = std::env::var(ORG_ENV).unwrap_or_else(|_| DEFAULT_ORG.to_owned());
        let bucket = std::env::var(BUCKET_ENV).unwrap_or_else(|_| DEFAULT_BUCKET.to_owned());
        Self::new(url, token, org, bucket)
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl InfluxSink for InfluxHttpClient {
    async fn ping(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .get(format!("{}/ping", self.url))
            .send()
            .await
            .context(RequestSnafu)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }

    async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
        if points.is_empty() {
            return Ok(());
        }
        let body = encode_lines(points).context(EncodeSnafu)?;
        let response = self
            .http
            .post(format!("{}/api/v2/write", self.url))
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.freeze())
            .send()
            .await
            .context(RequestSnafu)?;

        let status = response.status();
        if status.is_success() {
            debug!(message = "Wrote batch to InfluxDB.", points = points.len());
            Ok(())
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_rejected() {
        assert!(matches!(
            InfluxHttpClient::new("http://localhost:8086", "", "org", "bucket"),
            Err(SinkError::MissingToken)
        ));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let client =
            InfluxHttpClient::new("http://localhost:8086/", "token", "org", "bucket").unwrap();
        assert_eq!(client.url, "http://localhost:8086");
        assert_eq!(client.org(), "org");
        assert_eq!(client.bucket(), "bucket");
    }
}
