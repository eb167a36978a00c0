//! Concurrent latency probing of candidate hosts.

use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use futures_util::future::{Either, select};
use futures_util::stream::{self, StreamExt};
use worker::{Date, Delay, Fetch, Url, console_debug};

use crate::defaults;
use crate::rank::ProbeResult;

/// A single bounded reachability check.
///
/// Implementations fold every failure into [`ProbeResult::unreachable`].
#[allow(async_fn_in_trait)]
pub trait Probe {
    async fn probe(&self, host: &str) -> ProbeResult;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub timeout_ms: u64,
    /// Probes in flight at once.
    pub concurrency: usize,
    /// Wall-clock budget for the whole phase.
    pub budget_ms: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::PROBE_TIMEOUT_MS,
            concurrency: defaults::PROBE_CONCURRENCY,
            budget_ms: defaults::PROBE_BUDGET_MS,
        }
    }
}

/// Probes every host with at most `concurrency` in flight. The output has one
/// entry per input host, in input order, repeats included.
pub async fn probe_all<P: Probe>(
    prober: &P,
    hosts: &[String],
    concurrency: usize,
) -> Vec<ProbeResult> {
    stream::iter(hosts)
        .map(|host| prober.probe(host))
        .buffered(concurrency.max(1))
        .collect()
        .await
}

/// Resolves to `None` if `timer` finishes first.
pub async fn race_timeout<F: Future, T: Future>(fut: F, timer: T) -> Option<F::Output> {
    match select(pin!(fut), pin!(timer)).await {
        Either::Left((output, _)) => Some(output),
        Either::Right(_) => None,
    }
}

/// Runs `attempt`, which yields a latency on success, against `timer`. A
/// timeout folds into [`ProbeResult::unreachable`] like any other failure.
pub async fn probe_within<F, T>(host: &str, attempt: F, timer: T) -> ProbeResult
where
    F: Future<Output = Option<u64>>,
    T: Future,
{
    match race_timeout(attempt, timer).await.flatten() {
        Some(latency_ms) => ProbeResult::reachable(host, latency_ms),
        None => ProbeResult::unreachable(host),
    }
}

/// Probes `https://<host>/cdn-cgi/trace` through the Workers fetch API.
pub struct FetchProber {
    timeout_ms: u64,
    deadline_ms: u64,
}

impl FetchProber {
    /// The phase deadline starts counting now.
    pub fn new(settings: &ProbeSettings) -> Self {
        Self {
            timeout_ms: settings.timeout_ms,
            deadline_ms: Date::now().as_millis().saturating_add(settings.budget_ms),
        }
    }

}

/// Latency of a successful (2xx) GET of `url`.
async fn fetch_latency(url: Url) -> Option<u64> {
    let started = Date::now().as_millis();
    let request = Fetch::Url(url);
    let response = request.send().await.ok()?;
    (200..300)
        .contains(&response.status_code())
        .then(|| Date::now().as_millis().saturating_sub(started))
}

impl Probe for FetchProber {
    async fn probe(&self, host: &str) -> ProbeResult {
        if self.timeout_ms == 0 {
            console_debug!("probe {host}: timeout is zero");
            return ProbeResult::unreachable(host);
        }
        let remaining = self.deadline_ms.saturating_sub(Date::now().as_millis());
        if remaining == 0 {
            console_debug!("probe {host}: phase deadline passed");
            return ProbeResult::unreachable(host);
        }
        let timeout_ms = self.timeout_ms.min(remaining);

        let Ok(url) = Url::parse(&format!("https://{host}{}", defaults::PROBE_PATH)) else {
            console_debug!("probe {host}: not a valid host");
            return ProbeResult::unreachable(host);
        };

        let timer = Delay::from(Duration::from_millis(timeout_ms));
        let result = probe_within(host, fetch_latency(url), timer).await;
        if result.reachable {
            console_debug!("probe {host}: {}ms", result.latency_ms);
        } else {
            console_debug!("probe {host}: unreachable");
        }
        result
    }
}
