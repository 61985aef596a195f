//! HTTP client for the control endpoint
//!
//! A poll sends the metric batch together with the instance identity, the
//! stored revision and the managed-section fingerprint. The response status
//! tells the agent what to do next:
//!
//! | Status                | Meaning                         |
//! |-----------------------|---------------------------------|
//! | 202                   | a new agent binary is available |
//! | 200, non-blank body   | body is new managed content     |
//! | other 2xx, blank body | nothing to do                   |
//! | anything else         | transport failure               |

use crate::config::{ContentEncoding, HttpOutputConfig};
use crate::metrics::DataFormat;
use crate::sync::auth::Credentials;
use crate::sync::error::SyncError;
use crate::sync::fingerprint::Fingerprint;
use crate::sync::revision::Revision;
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use futures_util::StreamExt;
use reqwest::{Client, Method, StatusCode};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Response header carrying the server-assigned revision
pub const REVISION_HEADER: &str = "X-Revision";

/// Classified poll response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResponse {
    NoChange,
    ConfigAvailable {
        content: String,
        revision: Option<Revision>,
    },
    BinaryAvailable,
}

/// A successful update response whose body has not been read yet
pub struct UpdateDownload {
    response: reqwest::Response,
    revision: Option<Revision>,
}

impl UpdateDownload {
    /// Revision announced by the server, if any
    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    /// Stream the body into `path`, returning the MD5 of the bytes written
    pub async fn write_to(self, path: &Path) -> Result<String, SyncError> {
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| SyncError::io("failed to create", path, e))?;
        let mut digest = md5::Context::new();
        let mut written: u64 = 0;

        let mut stream = self.response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.consume(&chunk);
            written += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io("failed to write", path, e))?;
        }

        file.flush()
            .await
            .and(file.sync_all().await)
            .map_err(|e| SyncError::io("failed to sync", path, e))?;

        debug!("Downloaded {} bytes to {}", written, path.display());
        Ok(format!("{:x}", digest.compute()))
    }
}

/// Control endpoint client
pub struct SyncClient {
    client: Client,
    url: String,
    update_url: String,
    method: Method,
    source: String,
    headers: BTreeMap<String, String>,
    content_encoding: ContentEncoding,
    content_type: &'static str,
    credentials: Credentials,
}

impl SyncClient {
    /// Build a client from `[outputs.http]`
    pub fn from_config(config: &HttpOutputConfig, data_format: DataFormat) -> Result<Self> {
        let method = match config.method.to_uppercase().as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            other => return Err(anyhow::anyhow!("invalid method [{}] {}", config.url, other)),
        };

        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .user_agent(format!("syncagent/{}", env!("CARGO_PKG_VERSION")));

        if let Some(ca) = &config.tls_ca {
            let pem = std::fs::read(ca)
                .with_context(|| format!("Failed to read tls_ca {}", ca.display()))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("Invalid certificate in {}", ca.display()))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
            let mut pem = std::fs::read(cert)
                .with_context(|| format!("Failed to read tls_cert {}", cert.display()))?;
            pem.push(b'\n');
            pem.extend(
                std::fs::read(key)
                    .with_context(|| format!("Failed to read tls_key {}", key.display()))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .context("Invalid client certificate or key")?;
            builder = builder.identity(identity);
        }

        if config.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        let source = config
            .source_address
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_source);

        Ok(Self {
            client,
            url: config.url.clone(),
            update_url: format!("{}Update", config.url),
            method,
            source,
            headers: config.headers.clone(),
            content_encoding: config.content_encoding,
            content_type: data_format.content_type(),
            credentials: Credentials::from_config(config),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Instance identity reported as `source`
    pub fn source(&self) -> &str {
        &self.source
    }

    fn identity_query(&self, revision: Option<&Revision>) -> Vec<(&'static str, String)> {
        vec![
            ("isWindows", cfg!(windows).to_string()),
            ("source", self.source.clone()),
            (
                "revision",
                revision.map(|r| r.to_string()).unwrap_or_default(),
            ),
        ]
    }

    fn encode_body(&self, payload: &[u8]) -> Result<Vec<u8>, SyncError> {
        match self.content_encoding {
            ContentEncoding::Identity => Ok(payload.to_vec()),
            ContentEncoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(payload).map_err(SyncError::Encode)?;
                encoder.finish().map_err(SyncError::Encode)
            }
        }
    }

    /// Send one batch and classify the answer
    pub async fn poll(
        &self,
        payload: &[u8],
        fingerprint: &Fingerprint,
        revision: Option<&Revision>,
    ) -> Result<PollResponse, SyncError> {
        let mut query = self.identity_query(revision);
        query.push(("md5", fingerprint.to_string()));

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .query(&query)
            .header("Content-Type", self.content_type);
        if self.content_encoding == ContentEncoding::Gzip {
            request = request.header("Content-Encoding", "gzip");
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let request = self.credentials.authorize(&self.client, request).await?;

        let response = request.body(self.encode_body(payload)?).send().await?;
        let status = response.status();
        let revision_header = header_revision(&response);
        let body = if status.is_success() {
            response.text().await?
        } else {
            String::new()
        };

        classify_poll(&self.url, status, body, revision_header)
    }

    /// Ask for the binary that goes with a 202 poll response.
    ///
    /// `Ok(None)` means the server has no real update for this revision.
    pub async fn fetch_update(
        &self,
        revision: Option<&Revision>,
    ) -> Result<Option<UpdateDownload>, SyncError> {
        let mut request = self
            .client
            .get(&self.update_url)
            .query(&self.identity_query(revision));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        let request = self.credentials.authorize(&self.client, request).await?;

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            info!(
                "No real update available ({} returned {})",
                self.update_url,
                response.status().as_u16()
            );
            return Ok(None);
        }

        let revision = header_revision(&response);
        Ok(Some(UpdateDownload { response, revision }))
    }
}

fn header_revision(response: &reqwest::Response) -> Option<Revision> {
    response
        .headers()
        .get(REVISION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(Revision::new)
        .filter(|r| !r.is_empty())
}

fn default_source() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Map a poll status and body to a [`PollResponse`]
pub fn classify_poll(
    url: &str,
    status: StatusCode,
    body: String,
    revision: Option<Revision>,
) -> Result<PollResponse, SyncError> {
    if !status.is_success() {
        return Err(SyncError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    match status {
        StatusCode::ACCEPTED => Ok(PollResponse::BinaryAvailable),
        StatusCode::OK if !body.trim().is_empty() => Ok(PollResponse::ConfigAvailable {
            content: body,
            revision,
        }),
        _ => Ok(PollResponse::NoChange),
    }
}
