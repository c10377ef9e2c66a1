//! The production HTTP client.

use crate::auth::TokenManager;
use crate::remote::RemoteStore;
use crate::throttle::RateLimiter;
use crate::types::{
    BlockHashResponse, ChangesResponse, RemoteMetadata, Share, SyncConfigDoc, SyncStateDoc,
};
use crate::{Result, TransportError};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode, header};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

/// Transport construction parameters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL, e.g. `https://cloud.example.com/`.
    pub base_url: String,
    /// Device identifier.
    pub device_id: String,
    /// Last known access token; may be empty (forces a refresh).
    pub access_token: String,
    /// Long-lived refresh token.
    pub refresh_token: String,
    /// Timeout for metadata calls.
    pub metadata_timeout: Duration,
    /// Timeout for byte transfers.
    pub transfer_timeout: Duration,
    /// Advisory upload pacing in bytes/second; 0 = unlimited.
    pub upload_limit: u64,
    /// Advisory download pacing in bytes/second; 0 = unlimited.
    pub download_limit: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            device_id: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            metadata_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(300),
            upload_limit: 0,
            download_limit: 0,
        }
    }
}

/// Authenticated client for the sync API and the WebDAV byte endpoints.
pub struct SyncClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: TokenManager,
    metadata_timeout: Duration,
    transfer_timeout: Duration,
    upload_limiter: RateLimiter,
    download_limiter: RateLimiter,
}

impl SyncClient {
    /// Build a client. Fails on an unparseable base URL.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut base = config.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url =
            Url::parse(&base).map_err(|e| TransportError::Protocol(format!("base URL: {e}")))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url,
            tokens: TokenManager::new(
                &config.device_id,
                &config.access_token,
                &config.refresh_token,
            ),
            metadata_timeout: config.metadata_timeout,
            transfer_timeout: config.transfer_timeout,
            upload_limiter: RateLimiter::new(config.upload_limit),
            download_limiter: RateLimiter::new(config.download_limit),
        })
    }

    /// Whether device credentials are present.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.tokens.is_configured()
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::Protocol(format!("endpoint URL {path}: {e}")))
    }

    fn dav_url(&self, share_id: &str, path: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TransportError::Protocol("base URL cannot hold paths".into()))?;
            segments.pop_if_empty();
            segments.push("dav");
            segments.push(share_id);
            for part in path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        Ok(url)
    }

    /// Send a request with the bearer token; on a 401, refresh exactly
    /// once and retry, then surface an auth failure.
    async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let token = self.tokens.access_token();
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!("access token rejected, attempting refresh");
        self.tokens.refresh(&self.http, &self.base_url, &token).await?;

        let token = self.tokens.access_token();
        let response = build(&self.http).bearer_auth(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Auth(
                "access token rejected after refresh".to_string(),
            ));
        }
        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let timeout = self.metadata_timeout;
        let response = self
            .send_authorized(|http| http.get(url.clone()).timeout(timeout))
            .await?;
        decode_json(response).await
    }

    async fn put_json<B: Serialize + Sync>(&self, url: Url, body: &B) -> Result<()> {
        let timeout = self.metadata_timeout;
        self.send_authorized(|http| http.put(url.clone()).timeout(timeout).json(body))
            .await?;
        Ok(())
    }

    fn dav_method(name: &str) -> Result<Method> {
        Method::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::Protocol(format!("method {name}")))
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(TransportError::Http { status: status.as_u16(), message })
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await?;
    serde_json::from_slice(&body)
        .map_err(|e| TransportError::Protocol(format!("response decode: {e}")))
}

#[async_trait]
impl RemoteStore for SyncClient {
    async fn list_shares(&self) -> Result<Vec<Share>> {
        self.get_json(self.api_url("api/v1/sync/shares")?).await
    }

    async fn get_config(&self) -> Result<SyncConfigDoc> {
        self.get_json(self.api_url("api/v1/sync/config")?).await
    }

    async fn put_config(&self, config: &SyncConfigDoc) -> Result<()> {
        self.put_json(self.api_url("api/v1/sync/config")?, config).await
    }

    async fn get_changes(
        &self,
        share_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ChangesResponse> {
        let mut url = self.api_url("api/v1/sync/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("share_id", share_id);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
            query.append_pair("limit", &limit.to_string());
        }
        self.get_json(url).await
    }

    async fn get_metadata(
        &self,
        share_id: &str,
        path: &str,
        include_children: bool,
    ) -> Result<RemoteMetadata> {
        let mut url = self.api_url(&format!("api/v1/sync/files/{share_id}/metadata"))?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("include_children", if include_children { "true" } else { "false" });
        self.get_json(url).await
    }

    async fn get_block_hashes(
        &self,
        share_id: &str,
        path: &str,
        block_size: u32,
    ) -> Result<BlockHashResponse> {
        #[derive(Serialize)]
        struct HashRequest<'a> {
            path: &'a str,
            block_size: u32,
        }

        let url = self.api_url(&format!("api/v1/sync/files/{share_id}/hash"))?;
        let timeout = self.metadata_timeout;
        let body = HashRequest { path, block_size };
        let response = self
            .send_authorized(|http| http.post(url.clone()).timeout(timeout).json(&body))
            .await?;
        decode_json(response).await
    }

    async fn get_sync_state(&self, share_id: &str) -> Result<SyncStateDoc> {
        self.get_json(self.api_url(&format!("api/v1/sync/state/{share_id}"))?).await
    }

    async fn put_sync_state(&self, share_id: &str, state: &SyncStateDoc) -> Result<()> {
        self.put_json(self.api_url(&format!("api/v1/sync/state/{share_id}"))?, state)
            .await
    }

    async fn download(&self, share_id: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.dav_url(share_id, path)?;
        let timeout = self.transfer_timeout;
        let response = self
            .send_authorized(|http| http.get(url.clone()).timeout(timeout))
            .await?;
        let body = response.bytes().await?;
        self.download_limiter.acquire(body.len() as u64).await;
        trace!(path, bytes = body.len(), "downloaded");
        Ok(body.to_vec())
    }

    async fn download_range(
        &self,
        share_id: &str,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let url = self.dav_url(share_id, path)?;
        let timeout = self.transfer_timeout;
        let range = format!("bytes={}-{}", offset, offset + length.saturating_sub(1));
        let response = self
            .send_authorized(|http| {
                http.get(url.clone()).timeout(timeout).header(header::RANGE, range.clone())
            })
            .await?;

        let ranged = response.status() == StatusCode::PARTIAL_CONTENT;
        let body = response.bytes().await?;
        self.download_limiter.acquire(body.len().min(length as usize) as u64).await;

        if ranged {
            return Ok(body.to_vec());
        }
        // Server ignored the range and sent the whole body; slice locally.
        let start = usize::try_from(offset)
            .map_err(|_| TransportError::Protocol("range offset overflow".into()))?;
        let end = start.saturating_add(length as usize).min(body.len());
        if start > body.len() {
            return Err(TransportError::Protocol(format!(
                "range {offset}+{length} beyond body of {} bytes",
                body.len()
            )));
        }
        Ok(body[start..end].to_vec())
    }

    async fn upload(&self, share_id: &str, path: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.dav_url(share_id, path)?;
        let timeout = self.transfer_timeout;
        self.upload_limiter.acquire(bytes.len() as u64).await;
        let size = bytes.len();
        self.send_authorized(move |http| {
            http.put(url.clone()).timeout(timeout).body(bytes.clone())
        })
        .await?;
        trace!(path, bytes = size, "uploaded");
        Ok(())
    }

    async fn delete(&self, share_id: &str, path: &str) -> Result<()> {
        let url = self.dav_url(share_id, path)?;
        let timeout = self.metadata_timeout;
        self.send_authorized(|http| http.delete(url.clone()).timeout(timeout))
            .await?;
        Ok(())
    }

    async fn mkdir(&self, share_id: &str, path: &str) -> Result<()> {
        let url = self.dav_url(share_id, path)?;
        let method = Self::dav_method("MKCOL")?;
        let timeout = self.metadata_timeout;
        self.send_authorized(|http| http.request(method.clone(), url.clone()).timeout(timeout))
            .await?;
        Ok(())
    }

    async fn rename(&self, share_id: &str, src: &str, dst: &str) -> Result<()> {
        let url = self.dav_url(share_id, src)?;
        let destination = self.dav_url(share_id, dst)?;
        let method = Self::dav_method("MOVE")?;
        let timeout = self.metadata_timeout;
        self.send_authorized(|http| {
            http.request(method.clone(), url.clone())
                .timeout(timeout)
                .header("Destination", destination.as_str())
                .header("Overwrite", "F")
        })
        .await?;
        Ok(())
    }
}

/// One entry of a PROPFIND multistatus response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavEntry {
    /// Server-reported href of the resource.
    pub href: String,
    /// Whether the resource is a collection.
    pub is_directory: bool,
    /// Content length; 0 for collections.
    pub size: u64,
}

impl SyncClient {
    /// PROPFIND a path at depth 0 or 1.
    pub async fn propfind(&self, share_id: &str, path: &str, depth: u8) -> Result<Vec<DavEntry>> {
        const BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:"><D:prop><D:resourcetype/><D:getcontentlength/></D:prop></D:propfind>"#;

        let url = self.dav_url(share_id, path)?;
        let method = Self::dav_method("PROPFIND")?;
        let timeout = self.metadata_timeout;
        let depth_value = if depth == 0 { "0" } else { "1" };
        let response = self
            .send_authorized(|http| {
                http.request(method.clone(), url.clone())
                    .timeout(timeout)
                    .header("Depth", depth_value)
                    .header(header::CONTENT_TYPE, "application/xml")
                    .body(BODY)
            })
            .await?;

        let body = response.text().await?;
        parse_multistatus(&body)
    }
}

/// Lenient multistatus parser: namespace prefixes vary by server, so
/// elements are matched by local name only.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut capture: Option<&'static str> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(e.name().as_ref()) {
                b"response" => {
                    current = Some(DavEntry {
                        href: String::new(),
                        is_directory: false,
                        size: 0,
                    });
                }
                b"href" => capture = Some("href"),
                b"getcontentlength" => capture = Some("length"),
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_directory = true;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| TransportError::Protocol(format!("multistatus text: {e}")))?;
                match (capture, current.as_mut()) {
                    (Some("href"), Some(entry)) => entry.href = value.into_owned(),
                    (Some("length"), Some(entry)) => {
                        entry.size = value.trim().parse().unwrap_or(0);
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => match local_name(e.name().as_ref()) {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getcontentlength" => capture = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Protocol(format!("multistatus parse: {e}")));
            }
        }
    }
    Ok(entries)
}

fn local_name(qname: &[u8]) -> &[u8] {
    match qname.iter().rposition(|&b| b == b':') {
        Some(idx) => &qname[idx + 1..],
        None => qname,
    }
}
