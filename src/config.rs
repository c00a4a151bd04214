use std::env;
use std::time::Duration;

pub const DEFAULT_INGRESS_GATEWAY: &str = "system/default-gateway";

/// Environment-derived settings, read once at startup so the generators stay
/// pure functions of spec + configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Converge a gateway routing rule per session (`USE_INGRESS`).
    pub use_ingress: bool,
    /// Gateway reference placed into routing rules (`INGRESS_GATEWAY`).
    pub ingress_gateway: String,
    /// Give pods without a security context the default fsGroup (`ADD_FSGROUP`).
    pub add_fsgroup: bool,
    /// Stop idle sessions at all (`ENABLE_CULLING`).
    pub enable_culling: bool,
    /// How long a session may sit without activity (`CULL_IDLE_TIME`, minutes).
    pub cull_idle_time: chrono::Duration,
    /// Cadence of idleness re-checks (`IDLENESS_CHECK_PERIOD`, minutes).
    pub idleness_check_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            use_ingress: false,
            ingress_gateway: DEFAULT_INGRESS_GATEWAY.to_string(),
            add_fsgroup: true,
            enable_culling: false,
            cull_idle_time: chrono::Duration::minutes(1440),
            idleness_check_period: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            use_ingress: env::var("USE_INGRESS").map(|v| v == "true").unwrap_or(false),
            ingress_gateway: env::var("INGRESS_GATEWAY")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.ingress_gateway),
            add_fsgroup: env::var("ADD_FSGROUP").map(|v| v != "false").unwrap_or(true),
            enable_culling: env::var("ENABLE_CULLING")
                .map(|v| v == "true")
                .unwrap_or(false),
            cull_idle_time: env::var("CULL_IDLE_TIME")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .map(chrono::Duration::minutes)
                .unwrap_or(defaults.cull_idle_time),
            idleness_check_period: env::var("IDLENESS_CHECK_PERIOD")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|minutes| Duration::from_secs(minutes * 60))
                .unwrap_or(defaults.idleness_check_period),
        }
    }
}
