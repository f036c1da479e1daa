use std::time::Duration;

use anyhow::ensure;
use tracing::trace;

/// TLS settings for the EPP connection
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TlsConfig {
    /// Whether to wrap the EPP connection in TLS (disabled only for test rigs)
    #[serde(default = "default_tls_enabled")]
    pub enabled: bool,

    /// Server name for SNI and certificate validation; defaults to the backend host
    pub sni: Option<String>,

    /// Skip certificate verification (test rigs with self-signed certs)
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            enabled: default_tls_enabled(),
            sni: None,
            insecure_skip_verify: false,
        }
    }
}

fn default_tls_enabled() -> bool {
    true
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub whois: Option<WhoisConfig>,
    pub epp: Option<EppConfig>,

    /// Probability with which a latency observation enters the distribution
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,

    /// Health window: this many recent cycles per protocol must meet the SLA
    #[serde(default = "default_health_window")]
    pub health_window: usize,

    /// Per-cycle SLA in milliseconds for the liveness indicator
    #[serde(default = "default_health_sla_ms")]
    pub health_sla_ms: u64,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WhoisConfig {
    /// Top level domains to rotate through; we probe `whois.nic.<tld>`
    pub targets: Vec<String>,

    /// Backend host override; defaults to the per-target WHOIS host
    pub host: Option<String>,

    #[serde(default = "default_whois_port")]
    pub port: u16,

    /// Request path
    #[serde(default = "default_whois_path")]
    pub path: String,

    /// Accepted HTTP status codes; any 2xx when unset
    pub expected_status: Option<Vec<u16>>,

    /// Regex the response body must match
    pub body_pattern: Option<String>,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default = "default_budget_margin_ms")]
    pub budget_margin_ms: u64,
}

/// Which probe flow the EPP sequence runs between login and logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EppProbeFlow {
    /// Availability check for a fresh probe domain
    #[default]
    Check,

    /// Create a fresh probe domain, then delete it again
    CreateDelete,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct EppConfig {
    /// Top level domains to rotate through; probe domains are derived per cycle
    pub targets: Vec<String>,

    /// EPP backend host
    pub host: String,

    #[serde(default = "default_epp_port")]
    pub port: u16,

    /// Registrar account used for the login step
    pub client_id: String,
    pub password: String,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub flow: EppProbeFlow,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,

    #[serde(default = "default_budget_margin_ms")]
    pub budget_margin_ms: u64,
}

impl WhoisConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn budget_margin(&self) -> Duration {
        Duration::from_millis(self.budget_margin_ms)
    }
}

impl EppConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn budget_margin(&self) -> Duration {
        Duration::from_millis(self.budget_margin_ms)
    }
}

impl Config {
    /// Reject configurations that cannot produce a running prober.
    ///
    /// Only configuration errors are allowed to be fatal; everything past
    /// startup is contained per probe sequence.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.whois.is_some() || self.epp.is_some(),
            "at least one protocol section (whois, epp) must be configured"
        );
        ensure!(
            self.sampling_ratio > 0.0 && self.sampling_ratio <= 1.0,
            "sampling_ratio must be in (0, 1], got {}",
            self.sampling_ratio
        );
        if let Some(whois) = &self.whois {
            ensure!(!whois.targets.is_empty(), "whois.targets must not be empty");
            ensure!(whois.action_timeout_ms > 0, "whois.action_timeout_ms must be positive");
            if let Some(pattern) = &whois.body_pattern {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("invalid whois.body_pattern: {e}"))?;
            }
        }
        if let Some(epp) = &self.epp {
            ensure!(!epp.targets.is_empty(), "epp.targets must not be empty");
            ensure!(epp.action_timeout_ms > 0, "epp.action_timeout_ms must be positive");
            ensure!(!epp.host.is_empty(), "epp.host must not be empty");
        }
        Ok(())
    }
}

fn default_sampling_ratio() -> f64 {
    1.0
}

fn default_health_window() -> usize {
    5
}

fn default_health_sla_ms() -> u64 {
    10_000
}

fn default_whois_port() -> u16 {
    80
}

fn default_whois_path() -> String {
    String::from("/")
}

fn default_epp_port() -> u16 {
    700
}

fn default_interval() -> u64 {
    15
}

fn default_action_timeout_ms() -> u64 {
    2000
}

fn default_budget_margin_ms() -> u64 {
    1000
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}
