//! The two control loops that keep the registry populated and current:
//! refetch (discover new endpoints) and recheck (re-probe known ones).
//! Ported from `internal/derperer/map.go`'s `refetch`/`recheck`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::assets::AssetSource;
use crate::config::Config;
use crate::normalize::Normalizer;
use crate::prober::Prober;
use crate::registry::Registry;

/// Query fingerprint for an unrestricted search, ported from the Go
/// `FINGERPRINT` constant.
const FINGERPRINT: &str = r#"body="<h1>DERP</h1>""#;
/// Variant restricting results to China-hosted relays, ported from
/// `FINGERPRIINT_CN` (the original's misspelling is not carried over).
const FINGERPRINT_CN: &str = r#"body="<h1>DERP</h1>" && country="CN""#;

/// The live, admin-mutable configuration the two loops consult on every
/// iteration. `GET/POST /admin/config` writes here; a write only changes
/// the parameters of the *next* iteration of each loop, never the one
/// already in flight.
pub type SharedConfig = Arc<RwLock<Config>>;

pub struct Scheduler {
    config: SharedConfig,
    registry: Arc<Registry>,
    asset_source: Arc<dyn AssetSource>,
    normalizer: Arc<Normalizer>,
    prober: Arc<Prober>,
}

impl Scheduler {
    pub fn new(
        config: SharedConfig,
        registry: Arc<Registry>,
        asset_source: Arc<dyn AssetSource>,
        normalizer: Arc<Normalizer>,
        prober: Arc<Prober>,
    ) -> Self {
        Self {
            config,
            registry,
            asset_source,
            normalizer,
            prober,
        }
    }

    fn snapshot_config(&self) -> Config {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Runs both loops until `cancel` fires. Each loop runs its body
    /// immediately on entry, then sleeps for its own (possibly since
    /// updated) interval before running again, mirroring the Go source's
    /// `time.After(0)` first tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let refetch = tokio::spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move { this.refetch_loop(cancel).await }
        });
        let recheck = tokio::spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move { this.recheck_loop(cancel).await }
        });

        let _ = tokio::join!(refetch, recheck);
    }

    async fn refetch_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.refetch_once(&cancel) => {}
            }
            let interval = self.snapshot_config().refetch_interval;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn refetch_once(&self, cancel: &CancellationToken) {
        use futures::StreamExt;

        let config = self.snapshot_config();
        let fingerprint = if config.cn { FINGERPRINT_CN } else { FINGERPRINT };
        tracing::debug!(fingerprint, "refetching assets");

        let mut stream = self.asset_source.query(fingerprint, 100, Some(config.fetch_limit));
        let mut count = 0usize;
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            if count >= config.fetch_limit {
                tracing::debug!("reached fetch limit");
                break;
            }
            let asset = match item {
                Ok(asset) => asset,
                Err(err) => {
                    tracing::warn!(%err, "failed to fetch assets");
                    break;
                }
            };
            let normalized = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.normalizer.normalize(&asset) => result,
            };
            match normalized {
                Ok(candidate) => {
                    self.registry.upsert(candidate);
                    count += 1;
                }
                Err(err) => {
                    tracing::debug!(%err, ip = %asset.ip, "skipping unnormalizable asset");
                }
            }
        }
    }

    async fn recheck_loop(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.recheck_once(&cancel) => {}
            }
            let interval = self.snapshot_config().recheck_interval;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn recheck_once(&self, cancel: &CancellationToken) {
        tracing::debug!("starting recheck");
        let config = self.snapshot_config();
        let semaphore = Arc::new(Semaphore::new(config.check_concurrency.max(1)));
        let endpoints = self.registry.snapshot();

        let tasks = endpoints.into_iter().map(|endpoint| {
            let semaphore = semaphore.clone();
            let prober = self.prober.clone();
            let registry = self.registry.clone();
            let duration = config.check_duration;
            let cancel = cancel.clone();
            async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = semaphore.acquire_owned() => permit.expect("semaphore never closed"),
                };
                let result = prober
                    .probe(&endpoint, duration, &cancel)
                    .await
                    .map_err(|err| err.to_string());
                drop(permit);
                registry.record(endpoint.id, result);
            }
        });

        futures::future::join_all(tasks).await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::Stream;

    use super::*;
    use crate::assets::{Asset, AssetStream};
    use crate::normalize::Normalizer;
    use crate::prober::{Connector, Prober};
    use crate::relay::{DynStream, RelaySession};

    struct EmptyAssetSource;
    impl AssetSource for EmptyAssetSource {
        fn query<'a>(&'a self, _expr: &'a str, _page_size: usize, _max_results: Option<usize>) -> AssetStream<'a> {
            Box::pin(futures::stream::empty())
        }
    }

    /// A [`Connector`] whose `connect` never resolves until dropped,
    /// letting the test assert the in-flight count never exceeds
    /// `check_concurrency` without needing a real relay on the other end.
    struct CountingStuckConnector {
        in_flight: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    impl Connector for CountingStuckConnector {
        fn connect<'a>(
            &'a self,
            _addr: &'a str,
        ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<RelaySession<DynStream>>> + Send + 'a>>
        {
            Box::pin(async move {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_observed.fetch_max(now, Ordering::SeqCst);
                // Never produces a session; the probe will hang in the
                // handshake until this future is dropped/cancelled.
                futures::future::pending::<()>().await;
                unreachable!()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_respects_the_concurrency_cap() {
        let registry = Arc::new(Registry::new());
        for i in 0..20 {
            registry.upsert(crate::registry::EndpointCandidate {
                name: format!("n{i}"),
                host: format!("host{i}"),
                port: 443,
                ipv4: Some(Ipv4Addr::new(1, 2, 3, 4)),
                ipv6: None,
                insecure: false,
            });
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let connector = CountingStuckConnector {
            in_flight: in_flight.clone(),
            max_observed: max_observed.clone(),
        };
        let prober = Arc::new(Prober::new(Arc::new(connector)));

        let mut config = Config::default();
        config.check_concurrency = 3;
        config.check_duration = Duration::from_secs(1);
        let shared_config = Arc::new(RwLock::new(config));

        let scheduler = Scheduler::new(
            shared_config,
            registry,
            Arc::new(EmptyAssetSource),
            // Every endpoint in this test is pre-inserted; the recheck path
            // never consults the Normalizer, so a system-config resolver
            // (built, never queried) is fine here.
            Arc::new(Normalizer::from_system_conf().expect("building a resolver from system config")),
            prober,
        );

        // recheck_once never returns (every probe hangs forever), so race
        // it against a fixed wall-clock budget under the paused test clock
        // and assert on the high-water mark of concurrently in-flight
        // connects observed so far.
        let cancel = CancellationToken::new();
        tokio::select! {
            _ = scheduler.recheck_once(&cancel) => unreachable!("recheck_once should never complete in this test"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        assert!(max_observed.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recheck_aborts_in_flight_probes_when_cancelled() {
        let registry = Arc::new(Registry::new());
        registry.upsert(crate::registry::EndpointCandidate {
            name: "n0".into(),
            host: "host0".into(),
            port: 443,
            ipv4: Some(Ipv4Addr::new(1, 2, 3, 4)),
            ipv6: None,
            insecure: false,
        });

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let connector = CountingStuckConnector {
            in_flight: in_flight.clone(),
            max_observed: max_observed.clone(),
        };
        let prober = Arc::new(Prober::new(Arc::new(connector)));

        let mut config = Config::default();
        config.check_concurrency = 3;
        config.check_duration = Duration::from_secs(30);
        let shared_config = Arc::new(RwLock::new(config));

        let scheduler = Scheduler::new(
            shared_config,
            registry,
            Arc::new(EmptyAssetSource),
            Arc::new(Normalizer::from_system_conf().expect("building a resolver from system config")),
            prober,
        );

        let cancel = CancellationToken::new();
        let recheck = tokio::spawn({
            let cancel = cancel.clone();
            async move { scheduler.recheck_once(&cancel).await }
        });

        tokio::task::yield_now().await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(200), recheck)
            .await
            .expect("recheck_once should return promptly once cancelled")
            .expect("recheck task should not panic");
    }
}
