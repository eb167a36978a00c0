//! Default values shared by the assembler, prober and ranker.

/// Seconds a derived credential stays acceptable.
pub const VALID_SECS: u64 = 60 * 60 * 24;
/// Seconds between credential rotations.
pub const UPDATE_SECS: u64 = 60 * 60 * 12;
pub const DAY_SECS: u64 = 60 * 60 * 24;
/// Most rotation intervals a single credential may stay acceptable for.
pub const MAX_ACCEPTED_EPOCHS: u64 = 8;

pub const FILE_NAME: &str = "clash";
pub const SUB_EMOJI: &str = "🚀";
pub const SUB_CONVERTER: &str = "api.v1.mk/sub";
pub const SUB_PROTOCOL: &str = "https";
pub const SUB_CONFIG: &str =
    "https://raw.githubusercontent.com/mahdibland/ShadowsocksConfig/main/configs/clash.yaml";

/// Used as the proxy IP when neither the request nor the environment names one
/// and the runtime reports no colo.
pub const UNKNOWN_COLO: &str = "unknown";

pub const PROBE_PATH: &str = "/cdn-cgi/trace";
pub const PROBE_TIMEOUT_MS: u64 = 3000;
/// Latency reported for hosts that failed to answer.
pub const UNREACHABLE_LATENCY_MS: u64 = 9999;
pub const PROBE_CONCURRENCY: usize = 16;
/// Upper bound on the whole probing phase of one request.
pub const PROBE_BUDGET_MS: u64 = 6000;
pub const RANK_TTL_SECS: u64 = 300;

pub const PASSTHROUGH_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
