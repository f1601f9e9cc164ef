use rampart_core::{FragConfig, LockDiscipline, TtlRefresh, FRAG_BUCKETS};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    pub frag: FragSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            frag: FragSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FragSettings {
    pub capacity: usize,
    pub buckets: usize,
    pub default_ttl: u32,
    pub refresh: RefreshSetting,
    pub bump: u32,
    pub strict_locks: bool,
}

impl Default for FragSettings {
    fn default() -> Self {
        FragSettings {
            capacity: 8192,
            buckets: FRAG_BUCKETS,
            default_ttl: 120,
            refresh: RefreshSetting::Reset,
            bump: 1,
            strict_locks: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshSetting {
    Reset,
    Bump,
}

impl FragSettings {
    pub fn to_frag_config(&self) -> FragConfig {
        FragConfig {
            capacity: self.capacity,
            buckets: self.buckets,
            default_ttl: self.default_ttl,
            refresh: match self.refresh {
                RefreshSetting::Reset => TtlRefresh::Reset,
                RefreshSetting::Bump => TtlRefresh::Bump(self.bump),
            },
            discipline: if self.strict_locks {
                LockDiscipline::Strict
            } else {
                LockDiscipline::Blocking
            },
        }
    }
}

pub fn load_runtime_config(root: &Path) -> Result<RuntimeConfig, String> {
    let path = root.join("rampart.yaml");
    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }
    let body = fs::read_to_string(&path)
        .map_err(|e| format!("read runtime config {}: {e}", path.display()))?;
    if body.trim().is_empty() {
        return Ok(RuntimeConfig::default());
    }
    let cfg: RuntimeConfig = serde_yaml::from_str(&body)
        .map_err(|e| format!("parse runtime config {}: {e}", path.display()))?;
    Ok(cfg)
}
