pub mod config;
pub mod defaults;
pub mod error;
pub mod hash;
pub mod identity;
pub mod overrides;
pub mod pool;
pub mod probe;
pub mod rank;
pub mod relay;
pub mod websocket;

use std::cell::RefCell;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;
use worker::*;

use crate::config::{Config, Defaults, PendingConfig, Pools, assemble};
use crate::hash::Md5Hasher;
use crate::overrides::{EnvOverrides, QueryOverrides, RequestMeta};
use crate::pool::Relay;
use crate::probe::FetchProber;
use crate::rank::RankCache;
use crate::relay::{parse_early_data, run_echo};
use crate::websocket::WebSocketStream;

thread_local! {
    static RANKINGS: RefCell<RankCache> =
        RefCell::new(RankCache::new(defaults::RANK_TTL_SECS * 1000));
}

#[event(fetch)]
async fn main(req: Request, env: Env, _: Context) -> Result<Response> {
    console_error_panic_hook::set_once();

    match handle(req, env).await {
        Ok(response) => Ok(response),
        Err(err) => {
            console_error!("request failed: {err}");
            err.into_response()
        }
    }
}

async fn handle(req: Request, env: Env) -> error::Result<Response> {
    let url = req.url()?;
    let now_ms = Date::now().as_millis();

    let pending = assemble(
        Defaults::new(),
        &EnvOverrides::from_env(&env),
        &QueryOverrides::from_url(&url),
        &RequestMeta::from_request(&req),
        now_ms / 1000,
        &Md5Hasher,
        &mut SmallRng::seed_from_u64(now_ms),
    )?;
    let config = finalize(pending, now_ms).await;
    for degradation in &config.degradations {
        console_warn!("config: {degradation}");
    }

    let is_websocket = req
        .headers()
        .get("Upgrade")?
        .is_some_and(|up| up.eq_ignore_ascii_case("websocket"));
    if is_websocket {
        return Ok(accept_websocket(&req)?);
    }

    let path = url.path().to_ascii_lowercase();
    if path == "/" {
        return root(&config).await;
    }
    let is_pools_path = config
        .accepted_user_ids
        .iter()
        .any(|id| path == format!("/{id}/pools"));
    if is_pools_path {
        return Ok(Response::from_json(&PoolsView::from(&config))?);
    }

    Ok(Response::error("Not Found", 404)?)
}

/// Ranks the CSV pool, reusing this isolate's cached ordering while it is fresh.
async fn finalize(pending: PendingConfig, now_ms: u64) -> Config {
    if pending.csv_pool().is_empty() {
        return pending.finalize_ranked(Vec::new());
    }

    let ttl_ms = pending.rank_ttl_secs().saturating_mul(1000);
    let cached = RANKINGS.with_borrow_mut(|cache| {
        cache.set_ttl_ms(ttl_ms);
        cache.get(pending.csv_pool(), now_ms)
    });
    if let Some(ranked) = cached {
        return pending.finalize_ranked(ranked);
    }

    let unranked = pending.csv_pool().to_vec();
    let prober = FetchProber::new(&pending.probe_settings());
    let config = pending.finalize(&prober).await;
    console_log!(
        "ranked {} csv addresses, fastest {:?}",
        config.pools.addresses_csv.len(),
        config.pools.addresses_csv.first()
    );
    RANKINGS.with_borrow_mut(|cache| {
        cache.insert(unranked, config.pools.addresses_csv.clone(), Date::now().as_millis())
    });
    config
}

fn accept_websocket(req: &Request) -> Result<Response> {
    let early_data = parse_early_data(req.headers().get("Sec-WebSocket-Protocol")?)
        .map_err(|e| Error::RustError(e.to_string()))?;

    let pair = WebSocketPair::new()?;
    let server = pair.server;
    server.accept()?;

    wasm_bindgen_futures::spawn_local(async move {
        let events = match server.events() {
            Ok(events) => events,
            Err(err) => {
                console_error!("websocket events: {err}");
                return;
            }
        };
        let socket = WebSocketStream::new(&server, events, early_data);
        match run_echo(socket).await {
            Ok(bytes) => console_log!("websocket closed after {bytes} bytes"),
            Err(err) => {
                console_error!("websocket: {err}");
                _ = server.close(Some(1011), Some("Internal error"));
            }
        }
    });

    Response::from_websocket(pair.client)
}

/// `URL302` redirect, then `URL` passthrough, then the status page.
async fn root(config: &Config) -> error::Result<Response> {
    if let Some(target) = &config.redirect_url {
        let target = Url::parse(target).map_err(|e| error::Error::UpstreamProxy(e.to_string()))?;
        return Ok(Response::redirect(target)?);
    }
    if let Some(target) = &config.passthrough_url {
        return passthrough(target).await;
    }
    Ok(Response::from_html(status_page())?)
}

/// The configured `URL`, path and query included. Only http(s) is fetched.
fn passthrough_target(target: &str) -> error::Result<Url> {
    let url = Url::parse(target.trim())
        .map_err(|e| error::Error::UpstreamProxy(format!("{target:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(error::Error::UpstreamProxy(format!(
            "{target:?}: unsupported scheme {scheme}"
        ))),
    }
}

async fn passthrough(target: &str) -> error::Result<Response> {
    let upstream_err = |e: &dyn std::fmt::Display| error::Error::UpstreamProxy(e.to_string());

    let url = passthrough_target(target)?;

    let mut headers = Headers::new();
    headers
        .set("User-Agent", defaults::PASSTHROUGH_USER_AGENT)
        .map_err(|e| upstream_err(&e))?;
    let mut init = RequestInit::new();
    init.with_method(Method::Get).with_headers(headers);
    let request = Request::new_with_init(url.as_str(), &init).map_err(|e| upstream_err(&e))?;

    let mut upstream = Fetch::Request(request)
        .send()
        .await
        .map_err(|e| upstream_err(&e))?;
    let status = upstream.status_code();
    let mut response_headers = upstream.headers().clone();
    response_headers
        .set("Access-Control-Allow-Origin", "*")
        .map_err(|e| upstream_err(&e))?;
    let body = upstream.bytes().await.map_err(|e| upstream_err(&e))?;

    Ok(Response::from_bytes(body)
        .map_err(|e| upstream_err(&e))?
        .with_status(status)
        .with_headers(response_headers))
}

fn status_page() -> String {
    concat!(
        "<!DOCTYPE html>\n",
        "<html lang=\"en\">\n",
        "<head><meta charset=\"UTF-8\"><title>EdgeTunnel</title></head>\n",
        "<body><h1>EdgeTunnel</h1><p>Running.</p></body>\n",
        "</html>\n"
    )
    .to_string()
}

#[derive(Serialize)]
struct PoolsView<'a> {
    proxy_ip: Option<&'a str>,
    relay: Option<&'a Relay>,
    notls: bool,
    pools: &'a Pools,
}

impl<'a> From<&'a Config> for PoolsView<'a> {
    fn from(config: &'a Config) -> Self {
        Self {
            proxy_ip: config.proxy_ip.as_deref(),
            relay: config.relay.as_ref(),
            notls: config.notls,
            pools: &config.pools,
        }
    }
}
