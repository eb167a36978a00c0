//! Latency ordering of probed hosts.

use std::collections::HashMap;

use serde::Serialize;

use crate::defaults::UNREACHABLE_LATENCY_MS;

/// Outcome of probing one host once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub host: String,
    pub latency_ms: u64,
    pub reachable: bool,
}

impl ProbeResult {
    pub fn reachable(host: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            host: host.into(),
            latency_ms,
            reachable: true,
        }
    }

    pub fn unreachable(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            latency_ms: UNREACHABLE_LATENCY_MS,
            reachable: false,
        }
    }
}

/// Reachable hosts by ascending latency (ties keep input order), then the
/// unreachable ones in input order.
pub fn rank(results: &[ProbeResult]) -> Vec<String> {
    let (mut reachable, unreachable): (Vec<&ProbeResult>, Vec<&ProbeResult>) =
        results.iter().partition(|r| r.reachable);
    reachable.sort_by_key(|r| r.latency_ms);
    reachable
        .into_iter()
        .chain(unreachable)
        .map(|r| r.host.clone())
        .collect()
}

struct CachedRanking {
    ranked: Vec<String>,
    expires_at_ms: u64,
}

/// Rankings kept across requests served by the same isolate, keyed by the
/// unranked pool.
pub struct RankCache {
    ttl_ms: u64,
    entries: HashMap<Vec<String>, CachedRanking>,
}

impl RankCache {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: HashMap::new(),
        }
    }

    pub fn set_ttl_ms(&mut self, ttl_ms: u64) {
        self.ttl_ms = ttl_ms;
    }

    pub fn get(&mut self, pool: &[String], now_ms: u64) -> Option<Vec<String>> {
        self.entries.retain(|_, entry| entry.expires_at_ms > now_ms);
        self.entries.get(pool).map(|entry| entry.ranked.clone())
    }

    pub fn insert(&mut self, pool: Vec<String>, ranked: Vec<String>, now_ms: u64) {
        if self.ttl_ms == 0 {
            return;
        }
        self.entries.insert(
            pool,
            CachedRanking {
                ranked,
                expires_at_ms: now_ms.saturating_add(self.ttl_ms),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
