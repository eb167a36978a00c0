//! Per-request configuration snapshot.
//!
//! Precedence, highest first: query string, environment, built-in defaults.
//! [`assemble`] resolves the credential and every pool; the CSV pool is then
//! ranked by [`PendingConfig::finalize`] before the snapshot is handed out.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::Serialize;

use crate::defaults;
use crate::error::{Error, Result};
use crate::hash::Hasher;
use crate::identity::{self, RotationPolicy};
use crate::overrides::{EnvOverrides, QueryOverrides, RequestMeta};
use crate::pool::{Relay, parse_pool, pick};
use crate::probe::{Probe, ProbeSettings, probe_all};
use crate::rank::rank;

/// An override that was ignored in favour of the previous value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Degradation {
    InvalidNumber { field: &'static str, value: String },
    ZeroValue { field: &'static str },
    InvalidRotation { valid_secs: u64, update_secs: u64 },
    InvalidRelayEndpoint { address: String },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::InvalidNumber { field, value } => {
                write!(f, "{field}={value:?} is not a non-negative integer, keeping previous value")
            }
            Degradation::ZeroValue { field } => {
                write!(f, "{field}=0 is not allowed, keeping previous value")
            }
            Degradation::InvalidRotation {
                valid_secs,
                update_secs,
            } => write!(
                f,
                "rotation every {update_secs}s for {valid_secs}s is not supported, using defaults"
            ),
            Degradation::InvalidRelayEndpoint { address } => {
                write!(f, "relay {address:?} is not host:port")
            }
        }
    }
}

/// Built-in values every request starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defaults {
    pub rotation: RotationPolicy,
    pub dls: u64,
    pub remark_index: u64,
    pub file_name: String,
    pub sub_emoji: String,
    pub sub_converter: String,
    pub sub_protocol: String,
    pub sub_config: String,
    pub probe: ProbeSettings,
    pub rank_ttl_secs: u64,
}

impl Defaults {
    pub fn new() -> Self {
        Self {
            rotation: RotationPolicy::default(),
            dls: 0,
            remark_index: 0,
            file_name: defaults::FILE_NAME.to_string(),
            sub_emoji: defaults::SUB_EMOJI.to_string(),
            sub_converter: defaults::SUB_CONVERTER.to_string(),
            sub_protocol: defaults::SUB_PROTOCOL.to_string(),
            sub_config: defaults::SUB_CONFIG.to_string(),
            probe: ProbeSettings::default(),
            rank_ttl_secs: defaults::RANK_TTL_SECS,
        }
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pools {
    pub proxy_ips: Vec<String>,
    pub addresses: Vec<String>,
    pub addresses_api: Vec<String>,
    pub addresses_notls: Vec<String>,
    pub addresses_notls_api: Vec<String>,
    /// Latency-ranked once the snapshot is finalized.
    pub addresses_csv: Vec<String>,
    pub links: Vec<String>,
    pub go2_socks5: Vec<String>,
    pub https_ports: Vec<String>,
    pub ban_hosts: Vec<String>,
}

/// Display and subscription labels. Carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub dls: u64,
    pub remark_index: u64,
    pub bot_token: String,
    pub chat_id: String,
    pub file_name: String,
    pub sub_emoji: String,
    pub sub_converter: String,
    pub sub_protocol: String,
    pub sub_config: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Canonical credential clients must present.
    pub user_id: String,
    pub user_id_compact: String,
    /// Every canonical credential still accepted, newest first.
    pub accepted_user_ids: Vec<String>,
    /// Day-stable stand-in for `user_id`.
    pub decoy_user_id: String,
    pub rotation: RotationPolicy,
    /// `None` when the request asked for an explicit relay and named no proxy IP.
    pub proxy_ip: Option<String>,
    /// The proxy IP was inferred from the colo rather than configured.
    pub proxy_ip_inferred: bool,
    pub relay: Option<Relay>,
    pub notls: bool,
    pub scv: bool,
    pub pools: Pools,
    pub labels: Labels,
    /// `URL302`
    pub redirect_url: Option<String>,
    /// `URL`
    pub passthrough_url: Option<String>,
    pub probe: ProbeSettings,
    pub rank_ttl_secs: u64,
    pub degradations: Vec<Degradation>,
}

/// A snapshot whose CSV pool has not been ranked yet.
#[derive(Debug)]
pub struct PendingConfig {
    config: Config,
}

impl PendingConfig {
    pub fn csv_pool(&self) -> &[String] {
        &self.config.pools.addresses_csv
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        self.config.probe
    }

    pub fn rank_ttl_secs(&self) -> u64 {
        self.config.rank_ttl_secs
    }

    /// Probes and ranks the CSV pool when it is non-empty.
    pub async fn finalize<P: Probe>(self, prober: &P) -> Config {
        if self.csv_pool().is_empty() {
            return self.config;
        }
        let results = probe_all(prober, self.csv_pool(), self.config.probe.concurrency).await;
        let ranked = rank(&results);
        self.finalize_ranked(ranked)
    }

    /// Uses an ordering computed earlier for the same CSV pool.
    pub fn finalize_ranked(mut self, ranked: Vec<String>) -> Config {
        self.config.pools.addresses_csv = ranked;
        self.config
    }
}

/// Resolves everything but the CSV ranking.
///
/// Fails with [`Error::CredentialMissing`] before any pool is touched when
/// neither a user id nor a rotation key is configured.
pub fn assemble<H, R>(
    base: Defaults,
    env: &EnvOverrides,
    query: &QueryOverrides,
    meta: &RequestMeta,
    now_secs: u64,
    hasher: &H,
    rng: &mut R,
) -> Result<PendingConfig>
where
    H: Hasher + ?Sized,
    R: Rng + ?Sized,
{
    let mut degradations = Vec::new();

    let valid_secs = numeric(
        env.valid_secs.as_deref(),
        base.rotation.valid_secs(),
        "TIME",
        &mut degradations,
    );
    let update_secs = numeric(
        env.update_secs.as_deref(),
        base.rotation.update_secs(),
        "UPTIME",
        &mut degradations,
    );
    let rotation = RotationPolicy::new(valid_secs, update_secs).unwrap_or_else(|| {
        degradations.push(Degradation::InvalidRotation {
            valid_secs,
            update_secs,
        });
        base.rotation
    });

    let configured = env.user_id.as_deref();
    let rotation_key = env
        .rotation_key
        .as_deref()
        .or(configured.filter(|id| !identity::is_canonical(id)));

    let (user_id, user_id_compact, accepted_user_ids) = match (rotation_key, configured) {
        (Some(key), _) => {
            let accepted = identity::accepted_credentials(hasher, key, &rotation, now_secs)?;
            let current = accepted
                .first()
                .ok_or_else(|| Error::Derivation("rotation window is empty".into()))?;
            (
                current.canonical().to_string(),
                current.compact().to_string(),
                accepted.iter().map(|c| c.canonical().to_string()).collect(),
            )
        }
        (None, Some(id)) => {
            let canonical = id.to_ascii_lowercase();
            (canonical.clone(), canonical.replace('-', ""), vec![canonical])
        }
        (None, None) => return Err(Error::CredentialMissing),
    };
    let decoy_user_id = identity::decoy_credential(hasher, &user_id, now_secs)?
        .canonical()
        .to_string();

    let proxy_ips = parse_pool(env.proxy_ip.as_deref());
    let (proxy_ip, proxy_ip_inferred) = if let Some(ip) = &query.proxy_ip {
        (Some(ip.clone()), false)
    } else if let Some(ip) = pick(&proxy_ips, rng) {
        (Some(ip.to_string()), false)
    } else if query.relay_requested {
        (None, false)
    } else {
        let colo = meta
            .colo
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| defaults::UNKNOWN_COLO.to_string());
        (Some(colo), true)
    };

    let (relay_source, relay_forces_http) = match &query.relay {
        Some(relay) => (Some(relay.as_str()), query.relay_forces_http),
        None => (env.relay.as_deref(), env.relay_forces_http),
    };
    let relay_candidates = parse_pool(relay_source);
    let relay = pick(&relay_candidates, rng).map(|candidate| {
        let relay = Relay::from_candidate(candidate, relay_forces_http);
        if relay.endpoint.is_none() {
            degradations.push(Degradation::InvalidRelayEndpoint {
                address: relay.address.clone(),
            });
        }
        relay
    });

    let pools = Pools {
        proxy_ips,
        addresses: parse_pool(env.addresses.as_deref()),
        addresses_api: parse_pool(env.addresses_api.as_deref()),
        addresses_notls: parse_pool(env.addresses_notls.as_deref()),
        addresses_notls_api: parse_pool(env.addresses_notls_api.as_deref()),
        addresses_csv: parse_pool(env.addresses_csv.as_deref()),
        links: parse_pool(env.links.as_deref()),
        go2_socks5: parse_pool(env.go2_socks5.as_deref()),
        https_ports: parse_pool(env.https_ports.as_deref()),
        ban_hosts: parse_pool(env.ban_hosts.as_deref()),
    };

    let labels = Labels {
        dls: numeric(env.dls.as_deref(), base.dls, "DLS", &mut degradations),
        remark_index: numeric(
            env.remark_index.as_deref(),
            base.remark_index,
            "CSVREMARK",
            &mut degradations,
        ),
        bot_token: env.bot_token.clone().unwrap_or_default(),
        chat_id: env.chat_id.clone().unwrap_or_default(),
        file_name: env.file_name.clone().unwrap_or(base.file_name),
        sub_emoji: env.sub_emoji.clone().unwrap_or(base.sub_emoji),
        sub_converter: env.sub_converter.clone().unwrap_or(base.sub_converter),
        sub_protocol: base.sub_protocol,
        sub_config: env.sub_config.clone().unwrap_or(base.sub_config),
    };

    let probe = ProbeSettings {
        timeout_ms: positive(
            env.probe_timeout_ms.as_deref(),
            base.probe.timeout_ms,
            "PROBETIMEOUT",
            &mut degradations,
        ),
        concurrency: numeric(
            env.probe_concurrency.as_deref(),
            base.probe.concurrency,
            "PROBECONCURRENCY",
            &mut degradations,
        ),
        budget_ms: numeric(
            env.probe_budget_ms.as_deref(),
            base.probe.budget_ms,
            "PROBEBUDGET",
            &mut degradations,
        ),
    };
    let rank_ttl_secs = numeric(
        env.rank_ttl_secs.as_deref(),
        base.rank_ttl_secs,
        "RANKTTL",
        &mut degradations,
    );

    Ok(PendingConfig {
        config: Config {
            user_id,
            user_id_compact,
            accepted_user_ids,
            decoy_user_id,
            rotation,
            proxy_ip,
            proxy_ip_inferred,
            relay,
            notls: query.notls,
            scv: is_enabled(env.scv.as_deref()),
            pools,
            labels,
            redirect_url: env.redirect_url.clone(),
            passthrough_url: env.passthrough_url.clone(),
            probe,
            rank_ttl_secs,
            degradations,
        },
    })
}

/// Parses a non-negative integer override, keeping `previous` on failure.
fn numeric<T: FromStr>(
    raw: Option<&str>,
    previous: T,
    field: &'static str,
    degradations: &mut Vec<Degradation>,
) -> T {
    let Some(raw) = raw else {
        return previous;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            degradations.push(Degradation::InvalidNumber {
                field,
                value: raw.to_string(),
            });
            previous
        }
    }
}

/// Like [`numeric`], but `0` also keeps `previous`.
fn positive(
    raw: Option<&str>,
    previous: u64,
    field: &'static str,
    degradations: &mut Vec<Degradation>,
) -> u64 {
    match numeric(raw, previous, field, degradations) {
        0 => {
            degradations.push(Degradation::ZeroValue { field });
            previous
        }
        value => value,
    }
}

fn is_enabled(flag: Option<&str>) -> bool {
    !matches!(flag.map(str::trim), None | Some("" | "0" | "false"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Md5Hasher;
    use crate::pool::RelayKind;
    use crate::rank::ProbeResult;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::cell::RefCell;

    const NOW: u64 = 1_700_000_000;
    const UUID: &str = "d342d11e-d424-4583-b36e-524ab1f0afa4";

    fn build(env: EnvOverrides, query: QueryOverrides, meta: RequestMeta) -> Result<PendingConfig> {
        let mut rng = SmallRng::seed_from_u64(1);
        assemble(Defaults::new(), &env, &query, &meta, NOW, &Md5Hasher, &mut rng)
    }

    fn with_uuid() -> EnvOverrides {
        EnvOverrides {
            user_id: Some(UUID.into()),
            ..Default::default()
        }
    }

    fn finalized(pending: PendingConfig) -> Config {
        pending.finalize_ranked(Vec::new())
    }

    /// Records which hosts were probed.
    struct Recording {
        seen: RefCell<Vec<String>>,
    }

    impl Probe for Recording {
        async fn probe(&self, host: &str) -> ProbeResult {
            self.seen.borrow_mut().push(host.to_string());
            match host {
                "slow.example" => ProbeResult::reachable(host, 300),
                "fast.example" => ProbeResult::reachable(host, 20),
                _ => ProbeResult::unreachable(host),
            }
        }
    }

    #[test]
    fn missing_credential_fails() {
        let err = build(EnvOverrides::default(), QueryOverrides::default(), RequestMeta::default())
            .unwrap_err();
        assert!(matches!(err, Error::CredentialMissing));
    }

    #[test]
    fn canonical_user_id_is_used_as_is() {
        let config = finalized(build(with_uuid(), Default::default(), Default::default()).unwrap());
        assert_eq!(config.user_id, UUID);
        assert_eq!(config.user_id_compact, UUID.replace('-', ""));
        assert_eq!(config.accepted_user_ids, vec![UUID.to_string()]);
        assert_ne!(config.decoy_user_id, UUID);
        assert!(identity::is_canonical(&config.decoy_user_id));
    }

    #[test]
    fn non_canonical_user_id_is_derived() {
        let env = EnvOverrides {
            user_id: Some("hunter2".into()),
            ..Default::default()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        let expected =
            identity::current_credential(&Md5Hasher, "hunter2", &RotationPolicy::default(), NOW)
                .unwrap();
        assert_eq!(config.user_id, expected.canonical());
        assert_eq!(config.user_id_compact, expected.compact());
        assert_eq!(config.accepted_user_ids[0], config.user_id);
    }

    #[test]
    fn rotation_key_wins_over_uuid() {
        let env = EnvOverrides {
            rotation_key: Some("k".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_ne!(config.user_id, UUID);
        assert!(identity::is_canonical(&config.user_id));
    }

    #[test]
    fn same_interval_same_credential() {
        let env = EnvOverrides {
            rotation_key: Some("k".into()),
            ..Default::default()
        };
        let mut rng = SmallRng::seed_from_u64(1);
        let policy = RotationPolicy::default();
        let start = policy.epoch(NOW);
        let a = assemble(
            Defaults::new(),
            &env,
            &Default::default(),
            &Default::default(),
            start,
            &Md5Hasher,
            &mut rng,
        )
        .unwrap()
        .finalize_ranked(Vec::new());
        let b = assemble(
            Defaults::new(),
            &env,
            &Default::default(),
            &Default::default(),
            start + policy.update_secs() - 1,
            &Md5Hasher,
            &mut rng,
        )
        .unwrap()
        .finalize_ranked(Vec::new());
        assert_eq!(a.user_id, b.user_id);
    }

    #[test]
    fn bad_numbers_keep_previous_values() {
        let env = EnvOverrides {
            valid_secs: Some("a day".into()),
            update_secs: Some("3600".into()),
            dls: Some("-5".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_eq!(config.rotation.valid_secs(), 86_400);
        assert_eq!(config.rotation.update_secs(), 3_600);
        assert_eq!(config.labels.dls, 0);
        assert_eq!(
            config.degradations,
            vec![
                Degradation::InvalidNumber {
                    field: "TIME",
                    value: "a day".into()
                },
                Degradation::InvalidNumber {
                    field: "DLS",
                    value: "-5".into()
                },
            ]
        );
    }

    #[test]
    fn update_longer_than_valid_falls_back() {
        let env = EnvOverrides {
            valid_secs: Some("60".into()),
            update_secs: Some("120".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_eq!(config.rotation, RotationPolicy::default());
        assert!(matches!(
            config.degradations.as_slice(),
            [Degradation::InvalidRotation { valid_secs: 60, update_secs: 120 }]
        ));
    }

    #[test]
    fn unsupported_rotation_windows_fall_back() {
        for (valid, update) in [("18446744073709551615", "43200"), ("2592000", "60")] {
            let env = EnvOverrides {
                rotation_key: Some("k".into()),
                valid_secs: Some(valid.into()),
                update_secs: Some(update.into()),
                ..Default::default()
            };
            let config = finalized(build(env, Default::default(), Default::default()).unwrap());
            assert_eq!(config.rotation, RotationPolicy::default());
            assert_eq!(config.accepted_user_ids.len(), 2);
            assert!(matches!(
                config.degradations.as_slice(),
                [Degradation::InvalidRotation { .. }]
            ));
        }
    }

    #[test]
    fn zero_probe_timeout_keeps_default() {
        let env = EnvOverrides {
            probe_timeout_ms: Some("0".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_eq!(config.probe.timeout_ms, defaults::PROBE_TIMEOUT_MS);
        assert_eq!(
            config.degradations,
            vec![Degradation::ZeroValue {
                field: "PROBETIMEOUT"
            }]
        );
    }

    #[test]
    fn absent_pools_are_empty() {
        let config = finalized(build(with_uuid(), Default::default(), Default::default()).unwrap());
        assert_eq!(config.pools, Pools::default());
        assert!(config.relay.is_none());
    }

    #[test]
    fn pools_are_parsed_independently() {
        let env = EnvOverrides {
            addresses: Some("a.example, b.example".into()),
            addresses_notls: Some(",,".into()),
            https_ports: Some("443,8443".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_eq!(config.pools.addresses, vec!["a.example", "b.example"]);
        assert!(config.pools.addresses_notls.is_empty());
        assert_eq!(config.pools.https_ports, vec!["443", "8443"]);
    }

    #[test]
    fn proxy_ip_precedence() {
        let meta = RequestMeta {
            colo: Some("SJC".into()),
        };
        let config = finalized(build(with_uuid(), Default::default(), meta.clone()).unwrap());
        assert_eq!(config.proxy_ip.as_deref(), Some("SJC"));
        assert!(config.proxy_ip_inferred);

        let env = EnvOverrides {
            proxy_ip: Some("p1.example, p2.example".into()),
            ..with_uuid()
        };
        let config = finalized(build(env.clone(), Default::default(), meta.clone()).unwrap());
        let picked = config.proxy_ip.clone().unwrap();
        assert!(config.pools.proxy_ips.contains(&picked));
        assert!(!config.proxy_ip_inferred);

        let query = QueryOverrides {
            proxy_ip: Some("q.example".into()),
            ..Default::default()
        };
        let config = finalized(build(env, query, meta).unwrap());
        assert_eq!(config.proxy_ip.as_deref(), Some("q.example"));
    }

    #[test]
    fn unknown_colo_fallback() {
        let config = finalized(build(with_uuid(), Default::default(), Default::default()).unwrap());
        assert_eq!(config.proxy_ip.as_deref(), Some(defaults::UNKNOWN_COLO));
    }

    #[test]
    fn explicit_relay_request_skips_inferred_proxy_ip() {
        let query = QueryOverrides {
            relay_requested: true,
            ..Default::default()
        };
        let meta = RequestMeta {
            colo: Some("SJC".into()),
        };
        let config = finalized(build(with_uuid(), query, meta).unwrap());
        assert_eq!(config.proxy_ip, None);
        assert!(!config.proxy_ip_inferred);
    }

    #[test]
    fn relay_selection() {
        let env = EnvOverrides {
            relay: Some("http://1.2.3.4:1080".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        let relay = config.relay.unwrap();
        assert_eq!(relay.address, "1.2.3.4:1080");
        assert_eq!(relay.kind, RelayKind::Http);

        let env = EnvOverrides {
            relay: Some("5.6.7.8:1080".into()),
            ..with_uuid()
        };
        let query = QueryOverrides {
            relay_requested: true,
            relay: Some("9.9.9.9:1081".into()),
            ..Default::default()
        };
        let config = finalized(build(env, query, Default::default()).unwrap());
        let relay = config.relay.unwrap();
        assert_eq!(relay.address, "9.9.9.9:1081");
        assert_eq!(relay.kind, RelayKind::Socks5);
    }

    #[test]
    fn malformed_relay_is_kept_and_reported() {
        let env = EnvOverrides {
            relay: Some("no-port".into()),
            ..with_uuid()
        };
        let config = finalized(build(env, Default::default(), Default::default()).unwrap());
        assert_eq!(config.relay.unwrap().endpoint, None);
        assert_eq!(
            config.degradations,
            vec![Degradation::InvalidRelayEndpoint {
                address: "no-port".into()
            }]
        );
    }

    #[test]
    fn scv_flag() {
        assert!(!is_enabled(None));
        assert!(!is_enabled(Some("0")));
        assert!(!is_enabled(Some("false")));
        assert!(is_enabled(Some("1")));
        assert!(is_enabled(Some("yes")));
    }

    #[tokio::test]
    async fn csv_pool_is_ranked_on_finalize() {
        let env = EnvOverrides {
            addresses_csv: Some("dead.example, slow.example, fast.example".into()),
            ..with_uuid()
        };
        let pending = build(env, Default::default(), Default::default()).unwrap();
        let prober = Recording {
            seen: RefCell::new(Vec::new()),
        };
        let config = pending.finalize(&prober).await;
        assert_eq!(
            config.pools.addresses_csv,
            vec!["fast.example", "slow.example", "dead.example"]
        );
        assert_eq!(prober.seen.borrow().len(), 3);
    }

    #[tokio::test]
    async fn empty_csv_pool_is_not_probed() {
        let pending = build(with_uuid(), Default::default(), Default::default()).unwrap();
        let prober = Recording {
            seen: RefCell::new(Vec::new()),
        };
        let config = pending.finalize(&prober).await;
        assert!(config.pools.addresses_csv.is_empty());
        assert!(prober.seen.borrow().is_empty());
    }

    #[test]
    fn degradation_messages() {
        let msg = Degradation::InvalidNumber {
            field: "DLS",
            value: "x".into(),
        }
        .to_string();
        assert!(msg.contains("DLS"));
    }
}
