use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Master enable. When false, blocks without an installed artifact are always interpreted.
    pub enabled: bool,
    /// Cold executions of a block before it is handed to the compiler.
    pub hot_threshold: u32,
    /// Compiled blocks a single `execute` call may chain through before yielding `Continue`.
    pub max_chain_depth: u32,
    /// Minimum time between statistics reports.
    pub stats_interval: Duration,
    /// IR instructions the reference interpreter runs per call before yielding.
    pub interpreter_step_budget: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hot_threshold: 100,
            max_chain_depth: 10,
            stats_interval: Duration::from_secs(1),
            interpreter_step_budget: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let cfg: JitConfig = serde_json::from_str(r#"{"hot_threshold": 3}"#).unwrap();
        assert_eq!(cfg.hot_threshold, 3);
        assert_eq!(cfg.max_chain_depth, 10);
        assert!(cfg.enabled);
    }
}
