//! Direct content proxy
//!
//! `GET /ipfs/direct/{cid}` asks every configured gateway at once and answers
//! with the first one that returns a non-empty body. When the gateway does not
//! declare a useful content type, a few well-known formats are sniffed from
//! the leading bytes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::select_ok;
use socialsync_core::{gateway_url, GatewayTransport, HttpTransport};
use tracing::{debug, warn};

use crate::config::CacheServiceConfig;
use crate::error::{CacheError, CacheResult};

const OCTET_STREAM: &str = "application/octet-stream";

/// Content returned by the first gateway to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedContent {
    pub bytes: Bytes,
    pub content_type: String,
    pub gateway: String,
}

pub struct DirectProxy {
    gateways: Vec<String>,
    timeout: Duration,
    transport: Arc<dyn GatewayTransport>,
}

impl std::fmt::Debug for DirectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectProxy")
            .field("gateways", &self.gateways)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DirectProxy {
    pub fn new(
        gateways: Vec<String>,
        timeout: Duration,
        transport: Arc<dyn GatewayTransport>,
    ) -> Self {
        Self {
            gateways,
            timeout,
            transport,
        }
    }

    pub fn from_config(config: &CacheServiceConfig) -> CacheResult<Self> {
        let transport = HttpTransport::new().map_err(|e| CacheError::Config(e.to_string()))?;
        Ok(Self::new(
            config.gateways.clone(),
            config.fetch_timeout(),
            Arc::new(transport),
        ))
    }

    /// Fetch `cid` from whichever gateway answers first.
    pub async fn fetch(&self, cid: &str) -> CacheResult<ProxiedContent> {
        if cid.is_empty() || !cid.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CacheError::BadRequest(format!("Invalid CID: {:?}", cid)));
        }
        if self.gateways.is_empty() {
            return Err(CacheError::NotFound(format!("{} (no gateways configured)", cid)));
        }

        let attempts = self
            .gateways
            .iter()
            .map(|gateway| Box::pin(self.fetch_one(gateway, cid)));

        match select_ok(attempts).await {
            Ok((content, _pending)) => {
                debug!(%cid, gateway = %content.gateway, len = content.bytes.len(), "Proxied content");
                Ok(content)
            }
            Err(last) => {
                warn!(%cid, tried = self.gateways.len(), last_error = %last, "All gateways failed");
                Err(CacheError::NotFound(cid.to_string()))
            }
        }
    }

    async fn fetch_one(&self, gateway: &str, cid: &str) -> Result<ProxiedContent, String> {
        let url = gateway_url(gateway, cid);
        let response = match tokio::time::timeout(self.timeout, self.transport.get(&url, self.timeout)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(format!("{}: {}", gateway, e)),
            Err(_) => return Err(format!("{}: timed out", gateway)),
        };
        if response.bytes.is_empty() {
            return Err(format!("{}: empty body", gateway));
        }

        let content_type = match response.content_type {
            Some(declared) if !declared.is_empty() && !declared.starts_with(OCTET_STREAM) => declared,
            _ => sniff(&response.bytes).to_string(),
        };
        Ok(ProxiedContent {
            bytes: response.bytes,
            content_type,
            gateway: gateway.to_string(),
        })
    }
}

/// Guess a MIME type from leading magic bytes.
pub fn sniff(bytes: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"\x1a\x45\xdf\xa3", "video/webm"),
        (b"OggS", "audio/ogg"),
        (b"ID3", "audio/mpeg"),
    ];

    if let Some((_, mime)) = SIGNATURES.iter().find(|(magic, _)| bytes.starts_with(magic)) {
        return *mime;
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return "image/webp";
    }
    if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
        return "video/mp4";
    }

    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let trimmed = text.trim_start();
            if (trimmed.starts_with('{') || trimmed.starts_with('['))
                && serde_json::from_str::<serde_json::Value>(text).is_ok()
            {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            }
        }
        Err(_) => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use socialsync_core::{GatewayResponse, SyncError, SyncResult};

    use super::*;

    /// Each gateway answers after its latency, or fails when it has no body.
    struct Upstreams {
        routes: HashMap<String, (u64, Option<(Vec<u8>, Option<&'static str>)>)>,
    }

    #[async_trait]
    impl GatewayTransport for Upstreams {
        async fn get(&self, url: &str, _timeout: Duration) -> SyncResult<GatewayResponse> {
            let (base, (latency, body)) = self
                .routes
                .iter()
                .find(|(base, _)| url.starts_with(base.as_str()))
                .ok_or_else(|| SyncError::NotFound(url.to_string()))?;
            tokio::time::sleep(Duration::from_millis(*latency)).await;
            match body {
                Some((bytes, content_type)) => Ok(GatewayResponse {
                    bytes: Bytes::from(bytes.clone()),
                    content_type: content_type.map(str::to_string),
                }),
                None => Err(SyncError::NotFound(format!("{} has nothing", base))),
            }
        }
    }

    type Route<'a> = (&'a str, u64, Option<(Vec<u8>, Option<&'static str>)>);

    fn proxy(routes: Vec<Route<'_>>) -> DirectProxy {
        let gateways = routes.iter().map(|(g, _, _)| g.to_string()).collect();
        let routes = routes
            .into_iter()
            .map(|(g, latency, body)| (g.to_string(), (latency, body)))
            .collect();
        DirectProxy::new(gateways, Duration::from_secs(5), Arc::new(Upstreams { routes }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_success_wins() {
        let proxy = proxy(vec![
            ("https://slow/ipfs/", 800, Some((b"slow copy".to_vec(), Some("text/plain")))),
            ("https://fast/ipfs/", 20, Some((b"fast copy".to_vec(), Some("text/plain")))),
            ("https://broken/ipfs/", 1, None),
        ]);

        let content = proxy.fetch("bafyabc").await.unwrap();
        assert_eq!(content.gateway, "https://fast/ipfs/");
        assert_eq!(content.bytes, Bytes::from_static(b"fast copy"));
        assert_eq!(content.content_type, "text/plain");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failing_is_not_found() {
        let proxy = proxy(vec![("https://a/ipfs/", 1, None), ("https://b/ipfs/", 2, None)]);
        assert!(matches!(proxy.fetch("bafyabc").await, Err(CacheError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_timeout_counts_as_failure() {
        let proxy = proxy(vec![("https://stuck/ipfs/", 60_000, Some((b"late".to_vec(), None)))]);
        assert!(matches!(proxy.fetch("bafyabc").await, Err(CacheError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeclared_type_is_sniffed() {
        let proxy = proxy(vec![(
            "https://gw/ipfs/",
            1,
            Some((b"\x89PNG\r\n\x1a\n....".to_vec(), Some("application/octet-stream"))),
        )]);
        assert_eq!(proxy.fetch("bafyabc").await.unwrap().content_type, "image/png");
    }

    #[tokio::test]
    async fn test_rejects_path_like_cids() {
        let proxy = proxy(vec![("https://gw/ipfs/", 1, Some((b"x".to_vec(), None)))]);
        assert!(matches!(proxy.fetch("../etc").await, Err(CacheError::BadRequest(_))));
        assert!(matches!(proxy.fetch("").await, Err(CacheError::BadRequest(_))));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff(b"\xff\xd8\xff\xe0rest"), "image/jpeg");
        assert_eq!(sniff(b"GIF89a..."), "image/gif");
        assert_eq!(sniff(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(sniff(b"\0\0\0\x18ftypmp42"), "video/mp4");
        assert_eq!(sniff(br#"{"posts": []}"#), "application/json");
        assert_eq!(sniff(b"{ not json"), "text/plain; charset=utf-8");
        assert_eq!(sniff(&[0xfe, 0x00, 0x81]), OCTET_STREAM);
    }
}
