use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{Direction, SessionRegistry, StoreConfig};
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    registry: SessionRegistry,
    metrics: PrometheusHandle,
    public_url: Option<String>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub offers: usize,
    pub answers: usize,
    pub ttl_secs: u64,
    pub overwrite_policy: &'static str,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        metrics: PrometheusHandle,
        public_url: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                metrics,
                public_url,
            }),
        }
    }

    /// State with a private, uninstalled metrics recorder.
    pub fn detached(config: StoreConfig) -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self::new(SessionRegistry::new(config), recorder.handle(), None)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn public_url(&self) -> Option<&str> {
        self.inner.public_url.as_deref()
    }

    pub fn render_metrics(&self) -> String {
        self.inner.metrics.render()
    }

    pub fn stats(&self) -> StatsResponse {
        let registry = self.registry();
        let config = registry.store(Direction::Offer).config();
        StatsResponse {
            offers: registry.store(Direction::Offer).len(),
            answers: registry.store(Direction::Answer).len(),
            ttl_secs: config.ttl.as_secs(),
            overwrite_policy: config.overwrite_policy.as_str(),
        }
    }

    /// Evict expired records in the background every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let registry = self.registry().clone();
        let mut interval = tokio::time::interval(period);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                sweep(&registry, Instant::now());
            }
        })
    }
}

pub(crate) fn sweep(registry: &SessionRegistry, now: Instant) -> usize {
    let mut total = 0;
    for direction in Direction::ALL {
        let purged = registry.store(direction).purge_expired(now);
        if purged > 0 {
            counter!("tether_relay_expired_total", "direction" => direction.as_str())
                .increment(purged as u64);
            debug!(%direction, purged, "swept expired payloads");
        }
        total += purged;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::{HandshakePayload, SessionId};

    #[test_timeout::timeout]
    fn sweep_drops_only_expired_records() {
        let state = AppState::detached(StoreConfig {
            ttl: Duration::from_secs(10),
            ..StoreConfig::default()
        });
        let payload = HandshakePayload::from_value(&json!({ "type": "offer" })).unwrap();
        let start = Instant::now();
        let offers = state.registry().store(Direction::Offer);
        offers.put_at(SessionId::parse("old").unwrap(), payload.clone(), start);
        offers.put_at(
            SessionId::parse("new").unwrap(),
            payload,
            start + Duration::from_secs(8),
        );

        assert_eq!(sweep(state.registry(), start + Duration::from_secs(12)), 1);
        assert_eq!(state.stats().offers, 1);
    }

    #[test_timeout::timeout]
    fn stats_report_policy_and_ttl() {
        let state = AppState::detached(StoreConfig::default());
        assert_eq!(
            state.stats(),
            StatsResponse {
                offers: 0,
                answers: 0,
                ttl_secs: 600,
                overwrite_policy: "keep-delivered",
            }
        );
    }
}
