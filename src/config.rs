use anyhow::{bail, Context, Result};
use bitcoin::Network;
use serde::Deserialize;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How many connections the radar tries to maintain.
pub const DEFAULT_TARGET_CONNECTIONS: usize = 40;

pub const DEFAULT_NOTIFY_PORT: u16 = 7678;
pub const DEFAULT_COUNT_PORT: u16 = 7679;

/// Delay schedule between failed connect attempts on a slot.
///
/// Retries never stop; a zero `initial_delay` retries immediately.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            failures: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Per-slot retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Delay before the next attempt after one more failure.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.policy.multiplier.max(1.0).powi(self.failures.min(32) as i32);
        self.failures = self.failures.saturating_add(1);
        let secs = self.policy.initial_delay.as_secs_f64() * exp;
        if secs >= self.policy.max_delay.as_secs_f64() {
            self.policy.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Runtime configuration for the radar.
#[derive(Debug, Clone)]
pub struct RadarConfig {
    pub display_output: bool,
    pub thread_count: usize,
    pub target_connection_count: usize,
    pub network: Network,
    pub peers: Vec<SocketAddr>,
    pub user_agent: String,
    pub notify_port: u16,
    pub count_port: u16,
    pub local_only: bool,
    pub count_interval: Duration,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub log_dir: PathBuf,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            display_output: false,
            thread_count: 4,
            target_connection_count: DEFAULT_TARGET_CONNECTIONS,
            network: Network::Bitcoin,
            peers: Vec::new(),
            user_agent: concat!("/txradar:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            notify_port: DEFAULT_NOTIFY_PORT,
            count_port: DEFAULT_COUNT_PORT,
            local_only: cfg!(feature = "localhost-only"),
            count_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            log_dir: PathBuf::from("./logs"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRadarConfig {
    display_output: Option<bool>,
    thread_count: Option<usize>,
    target_connection_count: Option<usize>,
    network: Option<String>,
    peers: Option<Vec<SocketAddr>>,
    user_agent: Option<String>,
    notify_port: Option<u16>,
    count_port: Option<u16>,
    local_only: Option<bool>,
    count_interval_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    log_dir: Option<PathBuf>,
    retry: Option<RawRetry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetry {
    initial_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    multiplier: Option<f64>,
}

impl RadarConfig {
    /// Defaults overlaid with the TOML file at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        let Some(path) = path else {
            return Ok(config);
        };

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let raw: RawRadarConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        if let Some(v) = raw.display_output {
            config.display_output = v;
        }
        if let Some(v) = raw.thread_count {
            config.thread_count = v;
        }
        if let Some(v) = raw.target_connection_count {
            config.target_connection_count = v;
        }
        if let Some(v) = raw.network {
            config.network = parse_network(&v)?;
        }
        if let Some(v) = raw.peers {
            config.peers = v;
        }
        if let Some(v) = raw.user_agent {
            config.user_agent = v;
        }
        if let Some(v) = raw.notify_port {
            config.notify_port = v;
        }
        if let Some(v) = raw.count_port {
            config.count_port = v;
        }
        if let Some(v) = raw.local_only {
            config.local_only = v;
        }
        if let Some(ms) = raw.count_interval_ms {
            config.count_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.handshake_timeout_ms {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = raw.log_dir {
            config.log_dir = v;
        }
        if let Some(retry) = raw.retry {
            if let Some(ms) = retry.initial_delay_ms {
                config.retry.initial_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_delay_ms {
                config.retry.max_delay = Duration::from_millis(ms);
            }
            if let Some(m) = retry.multiplier {
                config.retry.multiplier = m;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            bail!("thread_count must be at least 1");
        }
        if self.notify_port == self.count_port {
            bail!("notify_port and count_port must differ");
        }
        if self.count_interval.is_zero() {
            bail!("count_interval must be positive");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            bail!("retry multiplier must be >= 1.0");
        }
        if !self.retry.initial_delay.is_zero() && self.retry.max_delay < self.retry.initial_delay {
            bail!("retry max_delay must not be below initial_delay");
        }
        Ok(())
    }

    fn bind_ip(&self) -> IpAddr {
        if self.local_only {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
    }

    pub fn notify_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip(), self.notify_port)
    }

    pub fn count_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip(), self.count_port)
    }
}

/// chain: mainnet/testnet/testnet4/signet/regtest
pub fn parse_network(name: &str) -> Result<Network> {
    Ok(match name {
        "main" | "mainnet" | "bitcoin" => Network::Bitcoin,
        "testnet" | "testnet3" => Network::Testnet,
        "testnet4" => Network::Testnet4,
        "signet" => Network::Signet,
        "regtest" => Network::Regtest,
        other => bail!("unknown network: {other}"),
    })
}
