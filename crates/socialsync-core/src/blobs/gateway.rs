//! Gateway ranking and failover
//!
//! Gateways are HTTP endpoints that resolve `{base}{cid}` over the public
//! content network. They are the slow, untrusted path: the blob store only
//! reaches for them after local and peer resolution have failed.
//!
//! Ranking probes every candidate concurrently against a known-good CID and
//! keeps the survivors sorted by round-trip time. The ranked order is cached
//! until a fetch fails against every cached gateway, at which point the cache
//! is dropped and the next call probes again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};

/// Body and declared content type of a successful gateway response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// How gateway requests leave the process.
///
/// Any 2xx response is success; everything else is an error.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> SyncResult<GatewayResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("socialsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::StorageUnavailable(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> SyncResult<GatewayResponse> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::NotFound(format!("{} returned {}", url, status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SyncError::StorageUnavailable(format!("{}: {}", url, e)))?;

        Ok(GatewayResponse {
            bytes,
            content_type,
        })
    }
}

/// A gateway that answered the probe, with its measured latency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedGateway {
    pub base_url: String,
    pub rtt: Duration,
}

/// Build the retrieval URL for `cid` on a gateway.
pub fn gateway_url(base_url: &str, cid: &str) -> String {
    format!("{}{}", base_url, cid)
}

/// Ranks gateway candidates by latency and serves that order to fetches.
pub struct GatewaySelector {
    candidates: Vec<String>,
    probe_cid: String,
    probe_timeout: Duration,
    fetch_timeout: Duration,
    transport: Arc<dyn GatewayTransport>,
    /// Ranked order from the last successful probe
    cache: RwLock<Option<Vec<RankedGateway>>>,
}

impl std::fmt::Debug for GatewaySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySelector")
            .field("candidates", &self.candidates)
            .field("cached", &self.cache.read().is_some())
            .finish()
    }
}

impl GatewaySelector {
    pub fn new(
        candidates: Vec<String>,
        probe_cid: impl Into<String>,
        probe_timeout: Duration,
        fetch_timeout: Duration,
        transport: Arc<dyn GatewayTransport>,
    ) -> Self {
        Self {
            candidates,
            probe_cid: probe_cid.into(),
            probe_timeout,
            fetch_timeout,
            transport,
            cache: RwLock::new(None),
        }
    }

    /// Selector over the configured gateways using the HTTP transport.
    pub fn from_config(config: &EngineConfig) -> SyncResult<Self> {
        Ok(Self::new(
            config.gateways.clone(),
            config.probe_cid.clone(),
            config.probe_timeout(),
            config.fetch_timeout(),
            Arc::new(HttpTransport::new()?),
        ))
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Probe `candidates` and return the responsive ones, fastest first.
    ///
    /// Probes run concurrently; each is abandoned after the probe timeout.
    /// A non-empty result replaces the cached order.
    pub async fn rank(&self, candidates: &[String]) -> Vec<RankedGateway> {
        let probes = candidates.iter().map(|base| self.probe(base));
        let mut ranked: Vec<RankedGateway> = join_all(probes).await.into_iter().flatten().collect();
        ranked.sort_by_key(|g| g.rtt);

        info!(
            probed = candidates.len(),
            responsive = ranked.len(),
            "Ranked gateways"
        );

        if !ranked.is_empty() {
            *self.cache.write() = Some(ranked.clone());
        }
        ranked
    }

    async fn probe(&self, base_url: &str) -> Option<RankedGateway> {
        let url = gateway_url(base_url, &self.probe_cid);
        let started = Instant::now();

        match tokio::time::timeout(self.probe_timeout, self.transport.get(&url, self.probe_timeout))
            .await
        {
            Ok(Ok(_)) => {
                let rtt = started.elapsed();
                debug!(gateway = base_url, ?rtt, "Gateway probe succeeded");
                Some(RankedGateway {
                    base_url: base_url.to_string(),
                    rtt,
                })
            }
            Ok(Err(e)) => {
                debug!(gateway = base_url, error = %e, "Gateway probe failed");
                None
            }
            Err(_) => {
                debug!(gateway = base_url, "Gateway probe timed out");
                None
            }
        }
    }

    /// The cached ranked order, probing the configured candidates if none is cached.
    pub async fn ranked(&self) -> Vec<RankedGateway> {
        if let Some(cached) = self.cached() {
            return cached;
        }
        self.rank(&self.candidates).await
    }

    pub fn cached(&self) -> Option<Vec<RankedGateway>> {
        self.cache.read().clone()
    }

    /// Drop the cached order; the next fetch re-probes.
    pub fn invalidate(&self) {
        if self.cache.write().take().is_some() {
            info!("Gateway ranking invalidated");
        }
    }

    /// Fetch `cid` through the ranked gateways, first success wins.
    ///
    /// Returns `None` when every gateway fails. The cached order is
    /// invalidated in that case but not re-probed within this call.
    pub async fn fetch_via_gateways(&self, cid: &str) -> Option<Bytes> {
        self.fetch_accepting(cid, |_| true)
            .await
            .map(|response| response.bytes)
    }

    /// Like [`Self::fetch_via_gateways`], treating responses rejected by
    /// `accept` as failures of that gateway.
    pub async fn fetch_accepting<F>(&self, cid: &str, accept: F) -> Option<GatewayResponse>
    where
        F: Fn(&GatewayResponse) -> bool,
    {
        let ranked = self.ranked().await;
        if ranked.is_empty() {
            warn!(%cid, "No responsive gateways");
            return None;
        }

        for gateway in &ranked {
            let url = gateway_url(&gateway.base_url, cid);
            match self.transport.get(&url, self.fetch_timeout).await {
                Ok(response) if accept(&response) => {
                    debug!(%cid, gateway = %gateway.base_url, len = response.bytes.len(), "Fetched via gateway");
                    return Some(response);
                }
                Ok(_) => {
                    warn!(%cid, gateway = %gateway.base_url, "Gateway returned content that failed verification");
                }
                Err(e) => {
                    debug!(%cid, gateway = %gateway.base_url, error = %e, "Gateway fetch failed");
                }
            }
        }

        warn!(%cid, tried = ranked.len(), "All gateways failed");
        self.invalidate();
        None
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    const PROBE: &str = "probe-cid";
    const SLOW: &str = "https://slow.example/ipfs/";
    const FAST: &str = "https://fast.example/ipfs/";
    const DEAD: &str = "https://dead.example/ipfs/";

    fn selector(transport: Arc<MockTransport>) -> GatewaySelector {
        GatewaySelector::new(
            vec![SLOW.into(), FAST.into(), DEAD.into()],
            PROBE,
            Duration::from_secs(3),
            Duration::from_secs(30),
            transport,
        )
    }

    fn bases(ranked: &[RankedGateway]) -> Vec<&str> {
        ranked.iter().map(|g| g.base_url.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_rank_orders_by_latency_and_drops_dead() {
        let transport = Arc::new(MockTransport::new(PROBE, &[(SLOW, 800), (FAST, 50)]));
        let selector = selector(transport.clone());

        let ranked = selector.rank(selector.candidates()).await;

        assert_eq!(bases(&ranked), vec![FAST, SLOW]);
        assert!(ranked[0].rtt < ranked[1].rtt);
        assert_eq!(selector.cached().map(|c| c.len()), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_excludes_gateway() {
        let transport = Arc::new(MockTransport::new(
            PROBE,
            &[(SLOW, 10_000), (FAST, 50), (DEAD, 2_900)],
        ));
        let selector = selector(transport);

        let ranked = selector.rank(selector.candidates()).await;
        assert_eq!(bases(&ranked), vec![FAST, DEAD]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_ranking_is_not_cached() {
        let transport = Arc::new(MockTransport::new(PROBE, &[]));
        let selector = selector(transport);

        assert!(selector.ranked().await.is_empty());
        assert!(selector.cached().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ranked_reuses_cache() {
        let transport = Arc::new(MockTransport::new(PROBE, &[(SLOW, 800), (FAST, 50)]));
        let selector = selector(transport.clone());

        selector.ranked().await;
        selector.ranked().await;
        // The dead gateway never answers, so one pass counts two probes.
        assert_eq!(transport.probe_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_falls_over_to_next_gateway() {
        let transport = Arc::new(MockTransport::new(PROBE, &[(SLOW, 800), (FAST, 50)]));
        transport.serve("cid-1", "payload");
        transport.fail(FAST, "cid-1");
        let selector = selector(transport.clone());

        let bytes = selector.fetch_via_gateways("cid-1").await.unwrap();
        assert_eq!(bytes.as_ref(), b"payload");
        assert!(selector.cached().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_invalidates_then_reprobes() {
        let transport = Arc::new(MockTransport::new(PROBE, &[(SLOW, 800), (FAST, 50)]));
        let selector = selector(transport.clone());

        selector.ranked().await;
        let probes_after_rank = transport.probe_count();

        // Nobody serves this CID: every cached gateway fails.
        assert!(selector.fetch_via_gateways("missing").await.is_none());
        assert!(selector.cached().is_none());
        // No re-probe inside the failing call.
        assert_eq!(transport.probe_count(), probes_after_rank);

        transport.serve("missing", "now here");
        let bytes = selector.fetch_via_gateways("missing").await.unwrap();
        assert_eq!(bytes.as_ref(), b"now here");
        assert!(transport.probe_count() > probes_after_rank);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_content_counts_as_failure() {
        let transport = Arc::new(MockTransport::new(PROBE, &[(FAST, 50)]));
        transport.serve("cid-2", "tampered");
        let selector = selector(transport);

        let result = selector
            .fetch_accepting("cid-2", |r| r.bytes.as_ref() == b"original")
            .await;
        assert!(result.is_none());
        assert!(selector.cached().is_none());
    }

    #[test]
    fn test_gateway_url() {
        assert_eq!(
            gateway_url("https://ipfs.io/ipfs/", "bafy"),
            "https://ipfs.io/ipfs/bafy"
        );
    }
}
