use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::parse::{StateFilter, SubnetFilter};

pub const DEFAULT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SOURCE_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_ARP_PATH: &str = "/proc/net/arp";

/// Whether neighbor sources are read through the escalation prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Never,
    /// Probe once at startup and use elevation if it works.
    #[default]
    Auto,
    Always,
}

/// Delay policy between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    /// Double the delay after each failed cycle, up to `max_ms`.
    Exponential { max_ms: u64 },
}

impl Backoff {
    /// Delay before the next cycle given the base period and the number of consecutive failed cycles.
    pub fn next_delay(&self, interval: Duration, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed => interval,
            Backoff::Exponential { max_ms } => {
                let max = Duration::from_millis(max_ms).max(interval);
                let factor = 1u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
                interval.checked_mul(factor).unwrap_or(max).min(max)
            }
        }
    }
}

/// Everything the poller needs to know about where and how to look for devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub subnets: SubnetFilter,
    pub state_filter: StateFilter,
    pub privilege: Privilege,
    pub neigh_command: Vec<String>,
    pub arp_path: PathBuf,
    pub escalate_command: Vec<String>,
    pub source_timeout_ms: u64,
    pub backoff: Backoff,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            subnets: SubnetFilter::default(),
            state_filter: StateFilter::Any,
            privilege: Privilege::Auto,
            neigh_command: vec!["ip".into(), "neigh".into(), "show".into()],
            arp_path: PathBuf::from(DEFAULT_ARP_PATH),
            escalate_command: vec!["su".into(), "-c".into()],
            source_timeout_ms: DEFAULT_SOURCE_TIMEOUT_MS,
            backoff: Backoff::Fixed,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            bail!("interval_ms must be greater than zero");
        }
        if self.source_timeout_ms == 0 {
            bail!("source_timeout_ms must be greater than zero");
        }
        if self.subnets.is_empty() {
            bail!("at least one subnet must be configured");
        }
        if self.neigh_command.is_empty() {
            bail!("neigh_command must not be empty");
        }
        if self.privilege != Privilege::Never && self.escalate_command.is_empty() {
            bail!("escalate_command must not be empty unless privilege is \"never\"");
        }
        if let StateFilter::States(s) = &self.state_filter {
            if s.is_empty() {
                bail!("state_filter.states must list at least one state");
            }
        }
        Ok(())
    }
}

/// Parse a JSON config document. Missing keys take their defaults.
pub fn parse_config_str(s: &str) -> Result<PollerConfig> {
    let cfg: PollerConfig = serde_json::from_str(s).context("invalid config JSON")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load and validate a JSON config file.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<PollerConfig> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
    parse_config_str(&content).with_context(|| format!("in {}", path.as_ref().display()))
}
