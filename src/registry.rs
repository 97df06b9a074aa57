//! The process-wide, concurrently-mutated set of discovered relay endpoints.
//!
//! Ported from `internal/derperer/map.go`'s `addDerpEndpoint`/`Exist` (the
//! upsert/dedup half) and `derperer/map.go`'s `FilterDERPMap` (the
//! filter/renumbering half), generalized so both live behind one lock
//! instead of the two separate Go revisions' ad-hoc slices and maps.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use serde::Serialize;

use crate::relay_map::{Node, RegionEntry, RelayMap};
use crate::unit::Unit;

/// The first synthetic region id handed out. Nothing below 900 is ever
/// assigned, matching the Go original's `nextRegionID.Store(900)`.
pub const FIRST_ID: u32 = 900;

/// Guards against division by a literal zero bandwidth in the score
/// formula; see [`FilterParams`] and [`Registry::filter`].
const SCORE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Unknown,
    Available,
    Error,
}

/// The normalized, pre-insertion shape of an endpoint, produced by
/// [`crate::normalize::normalize`]. Everything here is immutable once
/// stored; the Registry owns identity assignment and health fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointCandidate {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub insecure: bool,
}

/// A single discovered relay, owned by the [`Registry`].
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub id: u32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub insecure: bool,

    pub status: EndpointStatus,
    pub latency: Option<Duration>,
    pub bandwidth: Option<Unit>,
    pub error: Option<String>,
}

impl Endpoint {
    fn from_candidate(id: u32, candidate: EndpointCandidate) -> Self {
        Self {
            id,
            name: candidate.name,
            host: candidate.host,
            port: candidate.port,
            ipv4: candidate.ipv4,
            ipv6: candidate.ipv6,
            insecure: candidate.insecure,
            status: EndpointStatus::Unknown,
            latency: None,
            bandwidth: None,
            error: None,
        }
    }

    fn to_node(&self) -> Node {
        Node {
            name: self.name.clone(),
            region_id: self.id,
            host_name: self.host.clone(),
            ipv4: self.ipv4,
            ipv6: self.ipv6,
            derp_port: self.port,
            insecure_for_tests: self.insecure,
        }
    }
}

/// The successful half of a probe result, as written back by
/// [`Registry::record`].
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub latency: Duration,
    pub bandwidth: Unit,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<(String, u16), u32>,
    by_id: HashMap<u32, Endpoint>,
}

/// The process-wide endpoint set. Shared via `Arc` between the Scheduler
/// (the sole writer) and the HTTP surface (readers).
pub struct Registry {
    inner: RwLock<Inner>,
    next_id: AtomicU32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU32::new(FIRST_ID),
        }
    }

    /// Inserts `candidate` if no endpoint shares its `(host, port)`; returns
    /// the stored endpoint and whether it was newly created. Ported from
    /// `DerpEndpoints.Exist` + the Go original's append-if-absent.
    pub fn upsert(&self, candidate: EndpointCandidate) -> (Endpoint, bool) {
        let key = (candidate.host.clone(), candidate.port);
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(id) = inner.by_key.get(&key) {
            let existing = inner.by_id.get(id).expect("by_id/by_key out of sync");
            return (existing.clone(), false);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let endpoint = Endpoint::from_candidate(id, candidate);
        inner.by_key.insert(key, id);
        inner.by_id.insert(id, endpoint.clone());
        (endpoint, true)
    }

    /// A shallow copy of every stored endpoint, safe to iterate while
    /// writers continue mutating the registry.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.by_id.values().cloned().collect()
    }

    /// Atomically records a probe outcome (or failure) against `id`. A
    /// missing id (the endpoint was never inserted, or this is a stale
    /// task from a previous cycle racing a restart) is silently ignored.
    pub fn record(&self, id: u32, result: Result<ProbeOutcome, String>) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        let Some(endpoint) = inner.by_id.get_mut(&id) else {
            return;
        };
        match result {
            Ok(outcome) => {
                endpoint.status = EndpointStatus::Available;
                endpoint.latency = Some(outcome.latency);
                endpoint.bandwidth = Some(outcome.bandwidth);
                endpoint.error = None;
            }
            Err(message) => {
                endpoint.status = EndpointStatus::Error;
                endpoint.error = Some(message);
            }
        }
    }

    /// Projects the current set into a consumer-compatible relay-map
    /// document, renumbering surviving regions from [`FIRST_ID`] upward in
    /// iteration order. Ported from `derperer/map.go`'s `FilterDERPMap`.
    pub fn filter(&self, params: &FilterParams) -> RelayMap {
        let endpoints = self.snapshot();
        let mut map = RelayMap::default();
        let mut next_id = FIRST_ID;

        for endpoint in endpoints {
            if let Some(status) = params.status {
                if endpoint.status != status {
                    continue;
                }
            }
            if let Some(limit) = params.latency_limit {
                match endpoint.latency {
                    Some(latency) if latency > limit => continue,
                    _ => {}
                }
            }
            if let Some(limit) = params.bandwidth_limit {
                match endpoint.bandwidth {
                    Some(bandwidth) if bandwidth.value < limit => continue,
                    _ => {}
                }
            }

            let new_id = next_id;
            next_id += 1;

            let mut node = endpoint.to_node();
            node.region_id = new_id;

            if let Some(bandwidth) = endpoint.bandwidth {
                if bandwidth.value > 0.0 {
                    let score = params.baseline_bandwidth / bandwidth.value.max(SCORE_EPSILON);
                    map.home_params.region_score.insert(new_id, score);
                }
            }

            map.regions.insert(
                new_id,
                RegionEntry {
                    region_id: new_id,
                    region_code: endpoint.name.clone(),
                    region_name: endpoint.name,
                    nodes: vec![node],
                },
            );
        }

        map
    }
}

/// Optional constraints for [`Registry::filter`]. A `None` field always
/// passes: an endpoint whose relevant field is unset always satisfies the
/// unset predicate.
#[derive(Debug, Clone, Default)]
pub struct FilterParams {
    pub status: Option<EndpointStatus>,
    pub latency_limit: Option<Duration>,
    pub bandwidth_limit: Option<f64>,
    pub baseline_bandwidth: f64,
}

impl FilterParams {
    /// `?status=all` bypasses the status predicate; unspecified defaults
    /// to `available`, matching `GET /derp.json`'s documented default.
    pub fn available_only(baseline_bandwidth: f64) -> Self {
        Self {
            status: Some(EndpointStatus::Available),
            latency_limit: None,
            bandwidth_limit: None,
            baseline_bandwidth,
        }
    }

    pub fn all(baseline_bandwidth: f64) -> Self {
        Self {
            status: None,
            latency_limit: None,
            bandwidth_limit: None,
            baseline_bandwidth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(host: &str, port: u16) -> EndpointCandidate {
        EndpointCandidate {
            name: format!("{host}-{port}"),
            host: host.to_string(),
            port,
            ipv4: Some(Ipv4Addr::new(1, 2, 3, 4)),
            ipv6: None,
            insecure: false,
        }
    }

    #[test]
    fn upsert_is_idempotent_on_host_and_port() {
        let registry = Registry::new();
        let (first, created_first) = registry.upsert(candidate("relay.example", 443));
        let (second, created_second) = registry.upsert(candidate("relay.example", 443));
        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn ids_are_monotonic_and_start_at_900() {
        let registry = Registry::new();
        let (a, _) = registry.upsert(candidate("a", 1));
        let (b, _) = registry.upsert(candidate("b", 1));
        let (c, _) = registry.upsert(candidate("c", 1));
        assert_eq!(a.id, FIRST_ID);
        assert_eq!(b.id, FIRST_ID + 1);
        assert_eq!(c.id, FIRST_ID + 2);
    }

    #[test]
    fn record_sets_status_and_measurements() {
        let registry = Registry::new();
        let (endpoint, _) = registry.upsert(candidate("relay.example", 443));
        registry.record(
            endpoint.id,
            Ok(ProbeOutcome {
                latency: Duration::from_millis(20),
                bandwidth: Unit::bps(1_048_576.0),
            }),
        );
        let snapshot = registry.snapshot();
        let updated = snapshot.iter().find(|e| e.id == endpoint.id).unwrap();
        assert_eq!(updated.status, EndpointStatus::Available);
        assert_eq!(updated.latency, Some(Duration::from_millis(20)));

        registry.record(endpoint.id, Err("boom".to_string()));
        let snapshot = registry.snapshot();
        let updated = snapshot.iter().find(|e| e.id == endpoint.id).unwrap();
        assert_eq!(updated.status, EndpointStatus::Error);
        assert_eq!(updated.error.as_deref(), Some("boom"));
    }

    #[test]
    fn filter_renumbers_from_900_in_iteration_order_and_each_region_has_one_matching_node() {
        let registry = Registry::new();
        for i in 0..3 {
            let (endpoint, _) = registry.upsert(candidate(&format!("host{i}"), 443));
            registry.record(
                endpoint.id,
                Ok(ProbeOutcome {
                    latency: Duration::from_millis(10),
                    bandwidth: Unit::bps(2.0 * 1024.0 * 1024.0),
                }),
            );
        }

        let map = registry.filter(&FilterParams::available_only(2.0 * 1024.0 * 1024.0));
        assert_eq!(map.regions.len(), 3);
        let mut ids: Vec<u32> = map.regions.keys().copied().collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![900, 901, 902]);
        for (region_id, region) in &map.regions {
            assert_eq!(region.region_id, *region_id);
            assert_eq!(region.nodes.len(), 1);
            assert_eq!(region.nodes[0].region_id, *region_id);
        }
    }

    #[test]
    fn default_filter_excludes_unknown_status() {
        let registry = Registry::new();
        registry.upsert(candidate("unprobed", 443));
        let map = registry.filter(&FilterParams::available_only(1.0));
        assert!(map.regions.is_empty());
    }

    #[test]
    fn status_all_bypasses_the_status_predicate() {
        let registry = Registry::new();
        registry.upsert(candidate("unprobed", 443));
        let map = registry.filter(&FilterParams::all(1.0));
        assert_eq!(map.regions.len(), 1);
    }

    #[test]
    fn region_score_is_only_emitted_for_strictly_positive_bandwidth() {
        let registry = Registry::new();
        let (endpoint, _) = registry.upsert(candidate("relay.example", 443));
        registry.record(
            endpoint.id,
            Ok(ProbeOutcome {
                latency: Duration::from_millis(10),
                bandwidth: Unit::bps(1024.0 * 1024.0),
            }),
        );
        let map = registry.filter(&FilterParams::available_only(2.0 * 1024.0 * 1024.0));
        let (&id, _) = map.regions.iter().next().unwrap();
        assert_eq!(map.home_params.region_score.get(&id), Some(&2.0));
    }
}
