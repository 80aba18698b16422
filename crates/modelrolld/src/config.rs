//! modelrolld.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use modelroll_core::duration::serde_str;
use modelroll_core::RolloutPolicy;
use modelroll_rollout::AuditConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub router: RouterConfig,
    pub audit: AuditConfig,
    /// Policy for start requests that carry none.
    pub policy: RolloutPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Ingested samples older than this (relative to the newest) are dropped.
    #[serde(with = "serde_str")]
    pub sample_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8470,
            data_dir: PathBuf::from("/var/lib/modelroll"),
            sample_retention: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    /// Keep splits in process. Standalone and demo use.
    #[default]
    Memory,
    /// POST splits to an external routing layer.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterConfig {
    pub kind: RouterKind,
    /// e.g. `http://mesh-gateway:9000/weights`
    pub endpoint: Option<String>,
    #[serde(with = "serde_str")]
    pub timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            kind: RouterKind::Memory,
            endpoint: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.router.kind == RouterKind::Http && self.router.endpoint.is_none() {
            bail!("router.kind = \"http\" requires router.endpoint");
        }
        if self.router.timeout.is_zero() {
            bail!("router.timeout must be greater than zero");
        }
        if self.audit.queue_capacity == 0 {
            bail!("audit.queue_capacity must be at least 1");
        }
        self.policy.validate().context("invalid [policy]")?;
        Ok(())
    }
}
