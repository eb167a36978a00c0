//! Raw inputs to the config assembler: environment bindings, query string and
//! request metadata. Nothing here is validated; that happens in `config`.

use worker::{Env, Request, Url};

/// Environment-style overrides. Each field lists the binding names it is read
/// from, first non-empty wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// `UUID`, `uuid`, `PASSWORD`, `pswd`
    pub user_id: Option<String>,
    /// `KEY`, `TOKEN`
    pub rotation_key: Option<String>,
    /// `TIME`
    pub valid_secs: Option<String>,
    /// `UPTIME`
    pub update_secs: Option<String>,
    /// `PROXYIP`, `proxyip`
    pub proxy_ip: Option<String>,
    /// `HTTP`, `SOCKS5`
    pub relay: Option<String>,
    /// Set when the relay came from `HTTP`.
    pub relay_forces_http: bool,
    /// `ADD`
    pub addresses: Option<String>,
    /// `ADDAPI`
    pub addresses_api: Option<String>,
    /// `ADDNOTLS`
    pub addresses_notls: Option<String>,
    /// `ADDNOTLSAPI`
    pub addresses_notls_api: Option<String>,
    /// `ADDCSV`
    pub addresses_csv: Option<String>,
    /// `LINK`
    pub links: Option<String>,
    /// `GO2SOCKS5`
    pub go2_socks5: Option<String>,
    /// `CFPORTS`
    pub https_ports: Option<String>,
    /// `BAN`
    pub ban_hosts: Option<String>,
    /// `DLS`
    pub dls: Option<String>,
    /// `CSVREMARK`
    pub remark_index: Option<String>,
    /// `TGTOKEN`
    pub bot_token: Option<String>,
    /// `TGID`
    pub chat_id: Option<String>,
    /// `SUBNAME`
    pub file_name: Option<String>,
    /// `SUBEMOJI`, `EMOJI`
    pub sub_emoji: Option<String>,
    /// `SUBAPI`
    pub sub_converter: Option<String>,
    /// `SUBCONFIG`
    pub sub_config: Option<String>,
    /// `SCV`
    pub scv: Option<String>,
    /// `URL302`
    pub redirect_url: Option<String>,
    /// `URL`
    pub passthrough_url: Option<String>,
    /// `PROBETIMEOUT`
    pub probe_timeout_ms: Option<String>,
    /// `PROBECONCURRENCY`
    pub probe_concurrency: Option<String>,
    /// `PROBEBUDGET`
    pub probe_budget_ms: Option<String>,
    /// `RANKTTL`
    pub rank_ttl_secs: Option<String>,
}

impl EnvOverrides {
    /// Reads every field through `lookup`, which returns the raw binding value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|key| lookup(*key))
                .find(|value| !value.trim().is_empty())
        };
        let http_relay = first(&["HTTP"]);

        Self {
            user_id: first(&["UUID", "uuid", "PASSWORD", "pswd"]),
            rotation_key: first(&["KEY", "TOKEN"]),
            valid_secs: first(&["TIME"]),
            update_secs: first(&["UPTIME"]),
            proxy_ip: first(&["PROXYIP", "proxyip"]),
            relay_forces_http: http_relay.is_some(),
            relay: http_relay.or_else(|| first(&["SOCKS5"])),
            addresses: first(&["ADD"]),
            addresses_api: first(&["ADDAPI"]),
            addresses_notls: first(&["ADDNOTLS"]),
            addresses_notls_api: first(&["ADDNOTLSAPI"]),
            addresses_csv: first(&["ADDCSV"]),
            links: first(&["LINK"]),
            go2_socks5: first(&["GO2SOCKS5"]),
            https_ports: first(&["CFPORTS"]),
            ban_hosts: first(&["BAN"]),
            dls: first(&["DLS"]),
            remark_index: first(&["CSVREMARK"]),
            bot_token: first(&["TGTOKEN"]),
            chat_id: first(&["TGID"]),
            file_name: first(&["SUBNAME"]),
            sub_emoji: first(&["SUBEMOJI", "EMOJI"]),
            sub_converter: first(&["SUBAPI"]),
            sub_config: first(&["SUBCONFIG"]),
            scv: first(&["SCV"]),
            redirect_url: first(&["URL302"]),
            passthrough_url: first(&["URL"]),
            probe_timeout_ms: first(&["PROBETIMEOUT"]),
            probe_concurrency: first(&["PROBECONCURRENCY"]),
            probe_budget_ms: first(&["PROBEBUDGET"]),
            rank_ttl_secs: first(&["RANKTTL"]),
        }
    }

    /// Plain vars first, then secrets of the same name.
    pub fn from_env(env: &Env) -> Self {
        Self::from_lookup(|key| {
            env.var(key)
                .map(|v| v.to_string())
                .or_else(|_| env.secret(key).map(|s| s.to_string()))
                .ok()
        })
    }
}

/// Query-string toggles. These outrank the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOverrides {
    /// `proxyip=<addr>`
    pub proxy_ip: Option<String>,
    /// Any of `socks5`, `socks`, `http` was present.
    pub relay_requested: bool,
    /// Non-empty value of `socks5`, `socks` or `http`.
    pub relay: Option<String>,
    /// The relay came from `http=`.
    pub relay_forces_http: bool,
    /// `notls` was present.
    pub notls: bool,
}

impl QueryOverrides {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Self::default();
        for (key, value) in pairs {
            let value = value.as_ref().trim();
            let non_empty = (!value.is_empty()).then(|| value.to_string());
            match key.as_ref() {
                "proxyip" => query.proxy_ip = non_empty.or(query.proxy_ip.take()),
                "notls" => query.notls = true,
                key @ ("socks5" | "socks" | "http") => {
                    query.relay_requested = true;
                    if query.relay.is_none() && non_empty.is_some() {
                        query.relay = non_empty;
                        query.relay_forces_http = key == "http";
                    }
                }
                _ => {}
            }
        }
        query
    }

    pub fn from_url(url: &Url) -> Self {
        Self::from_pairs(url.query_pairs())
    }
}

/// Facts about the inbound request supplied by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Cloudflare data center that received the request.
    pub colo: Option<String>,
}

impl RequestMeta {
    pub fn from_request(req: &Request) -> Self {
        Self {
            colo: req.cf().map(|cf| cf.colo()),
        }
    }
}
